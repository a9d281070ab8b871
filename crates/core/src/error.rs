use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown {kind} status: {value}")]
    UnknownStatus { kind: &'static str, value: String },

    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
