//! Mapping validation of an expense group before export.
//!
//! All lookups of a group are run before failing, so one failed export reports
//! every missing mapping at once.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::{
    ResultEngine,
    export_errors::MappingSourceType,
    ports::{MappingResolver, ResolvedMapping},
};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct MissingMapping {
    pub source_type: MappingSourceType,
    pub source_value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{} required mapping(s) missing", .missing.len())]
pub struct ValidationFailure {
    pub missing: Vec<MissingMapping>,
}

/// Ledger identifiers resolved for one group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedDimensions {
    /// Vendor or employee the transaction is booked against.
    pub entity_id: String,
    /// Card account for card charges and card journal entries.
    pub card_account_id: Option<String>,
    /// Expense id -> ledger account of its category.
    pub line_accounts: HashMap<String, String>,
    /// Expense id -> tax code mapping.
    pub tax_codes: HashMap<String, ResolvedMapping>,
}

/// Caches lookups and accumulates every missing mapping of a group.
pub(crate) struct MappingCollector<'a> {
    resolver: &'a dyn MappingResolver,
    account_id: &'a str,
    cache: HashMap<(MappingSourceType, String), Option<ResolvedMapping>>,
    missing: Vec<MissingMapping>,
}

impl<'a> MappingCollector<'a> {
    pub(crate) fn new(resolver: &'a dyn MappingResolver, account_id: &'a str) -> Self {
        Self {
            resolver,
            account_id,
            cache: HashMap::new(),
            missing: Vec::new(),
        }
    }

    /// Looks a mapping up without recording it as missing.
    pub(crate) async fn lookup(
        &mut self,
        source_type: MappingSourceType,
        source_value: &str,
    ) -> ResultEngine<Option<ResolvedMapping>> {
        let key = (source_type, source_value.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }
        let resolved = self
            .resolver
            .resolve(self.account_id, source_type, source_value)
            .await?;
        self.cache.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Looks a mapping up; records it as missing when absent.
    pub(crate) async fn require(
        &mut self,
        source_type: MappingSourceType,
        source_value: &str,
    ) -> ResultEngine<Option<ResolvedMapping>> {
        let resolved = self.lookup(source_type, source_value).await?;
        if resolved.is_none() {
            self.record_missing(source_type, source_value);
        }
        Ok(resolved)
    }

    pub(crate) fn record_missing(&mut self, source_type: MappingSourceType, source_value: &str) {
        let missing = MissingMapping {
            source_type,
            source_value: source_value.to_string(),
        };
        if !self.missing.contains(&missing) {
            self.missing.push(missing);
        }
    }

    pub(crate) fn finish(self) -> Result<(), ValidationFailure> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure {
                missing: self.missing,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct OnlyMeals {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MappingResolver for OnlyMeals {
        async fn resolve(
            &self,
            _account_id: &str,
            source_type: MappingSourceType,
            source_value: &str,
        ) -> ResultEngine<Option<ResolvedMapping>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(
                (source_type == MappingSourceType::Category && source_value == "Meals").then(
                    || ResolvedMapping {
                        destination_id: "6000".to_string(),
                        tax_rate: None,
                    },
                ),
            )
        }
    }

    #[tokio::test]
    async fn collects_every_missing_mapping_once() {
        let resolver = OnlyMeals {
            calls: AtomicUsize::new(0),
        };
        let mut collector = MappingCollector::new(&resolver, "acc");

        assert!(
            collector
                .require(MappingSourceType::Category, "Meals")
                .await
                .unwrap()
                .is_some()
        );
        collector
            .require(MappingSourceType::Category, "Travel")
            .await
            .unwrap();
        collector
            .require(MappingSourceType::Category, "Travel")
            .await
            .unwrap();
        collector
            .require(MappingSourceType::Employee, "a@example.test")
            .await
            .unwrap();

        let failure = collector.finish().unwrap_err();
        assert_eq!(failure.missing.len(), 2);
        assert_eq!(failure.missing[0].source_value, "Travel");
        assert_eq!(failure.missing[1].source_type, MappingSourceType::Employee);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
    }
}
