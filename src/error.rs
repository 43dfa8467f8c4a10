use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Serialization error for '{id}': {message}")]
    Serialization { id: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Git {op} failed: {message}")]
    Git { op: String, message: String },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Store is in read-only mode")]
    ReadOnly,

    #[error("Watcher error: {0}")]
    Watch(String),

    #[error("{0}")]
    Other(String),
}

impl VaultError {
    /// Wrap a serialization failure with the document ID it occurred on.
    pub fn serialization(id: impl Into<String>, message: impl ToString) -> Self {
        VaultError::Serialization {
            id: id.into(),
            message: message.to_string(),
        }
    }

    pub fn git(op: impl Into<String>, err: git2::Error) -> Self {
        VaultError::Git {
            op: op.into(),
            message: err.message().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
