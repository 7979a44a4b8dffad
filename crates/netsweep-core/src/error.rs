use thiserror::Error;

/// Errors raised while building address ranges and scan units.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid address range '{input}': {reason}")]
    InvalidRange { input: String, reason: String },

    #[error("Invalid scan unit '{0}'")]
    InvalidUnit(String),

    #[error("Prefix length /{prefix} is outside the allowed range /{min}../32")]
    PrefixOutOfRange { prefix: u8, min: u8 },
}

pub type Result<T> = std::result::Result<T, CoreError>;
