//! The module contains the errors the engine can throw.
//!
//! The errors are:
//!
//! - [`KeyNotFound`] thrown when an item is not found.
//! - [`InvalidFilter`] thrown when an expense filter cannot be applied.
//! - [`Validation`] thrown when an expense group misses required mappings.
//! - [`Ledger`] / [`Source`] wrap failures of the external collaborators.
//!
//!  [`KeyNotFound`]: EngineError::KeyNotFound
//!  [`InvalidFilter`]: EngineError::InvalidFilter
//!  [`Validation`]: EngineError::Validation
//!  [`Ledger`]: EngineError::Ledger
//!  [`Source`]: EngineError::Source
use sea_orm::DbErr;
use thiserror::Error;

use crate::ports::{LedgerError, SourceError};
use crate::validation::ValidationFailure;

/// Engine custom errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("\"{0}\" key not found!")]
    KeyNotFound(String),
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::KeyNotFound(a), Self::KeyNotFound(b)) => a == b,
            (Self::InvalidId(a), Self::InvalidId(b)) => a == b,
            (Self::InvalidFilter(a), Self::InvalidFilter(b)) => a == b,
            (Self::InvalidConfig(a), Self::InvalidConfig(b)) => a == b,
            (Self::InvalidState(a), Self::InvalidState(b)) => a == b,
            (Self::Validation(a), Self::Validation(b)) => a == b,
            (Self::Ledger(a), Self::Ledger(b)) => a == b,
            (Self::Source(a), Self::Source(b)) => a == b,
            (Self::Serialization(a), Self::Serialization(b)) => a.to_string() == b.to_string(),
            (Self::Database(a), Self::Database(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}
