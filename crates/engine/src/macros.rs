//! Conversions between stored tags and the typed enums of the engine.
//!
//! Every enum persisted as a TEXT column goes through [`impl_str_enum!`], which
//! generates `as_str`, `Display` and `TryFrom<&str>` from one mapping so the
//! stored tag set cannot drift from the Rust variants.

/// Implements `as_str`, `Display` and `TryFrom<&str>` for a tag enum.
///
/// Parsing is exact: stored tags are written by the engine itself.
macro_rules! impl_str_enum {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl $enum_name {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $str,)+
                }
            }
        }

        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<&str> for $enum_name {
            type Error = $crate::EngineError;

            fn try_from(value: &str) -> Result<Self, $crate::EngineError> {
                match value {
                    $($str => Ok(Self::$variant),)+
                    other => Err($crate::EngineError::InvalidState(format!(
                        "invalid {}: {other}",
                        stringify!($enum_name)
                    ))),
                }
            }
        }
    };
}

pub(crate) use impl_str_enum;

#[cfg(test)]
mod tests {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Sample {
        One,
        Two,
        Error,
    }

    impl_str_enum!(Sample {
        One => "ONE",
        Two => "TWO",
        Error => "ERROR",
    });

    #[test]
    fn round_trips_tags() {
        assert_eq!(Sample::One.as_str(), "ONE");
        assert_eq!(Sample::try_from("TWO").unwrap(), Sample::Two);
        assert_eq!(Sample::Two.to_string(), "TWO");
    }

    #[test]
    fn variant_named_error_parses() {
        assert_eq!(Sample::try_from("ERROR").unwrap(), Sample::Error);
        assert_eq!(Sample::Error.as_str(), "ERROR");
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(Sample::try_from("one").is_err());
    }
}
