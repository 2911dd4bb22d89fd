use thiserror::Error;

/// Errors surfaced by the backup protocol.
///
/// Every public operation resolves to either a typed value or one of these
/// kinds. A decryption miss while scanning the log ("not addressed to me")
/// is not an error and never appears here; it is filtered out silently.
#[derive(Debug, Error)]
pub enum Error {
    /// A message failed its schema check before sealing. Nothing is published.
    #[error("message validation failed: {0}")]
    Validation(String),

    /// A box, unbox or signature operation failed on a payload that was
    /// expected to be addressable.
    #[error("crypto operation failed: {0}")]
    Crypto(String),

    /// Bad split parameters, or structurally corrupt shares given to combine.
    #[error("share operation failed: {0}")]
    Share(String),

    /// Combine was given fewer usable shares than the embedded threshold.
    #[error("insufficient shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    /// Own shard missing, or no reply/forward candidates exist for a root.
    #[error("not found: {0}")]
    NotFound(String),

    /// A reconstructed blob did not parse back into label and secret.
    #[error("unpack failed: {0}")]
    Unpack(String),

    /// The ephemeral key store failed to read or write.
    #[error("key store error: {0}")]
    Storage(String),

    /// The message log rejected a publish or query.
    #[error("log error: {0}")]
    Log(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(err.to_string())
    }
}
