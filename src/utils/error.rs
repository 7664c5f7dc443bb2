use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Divisibility or shape mismatch, unknown split, empty dataset.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cross-rank divergence found by a sanity check.
    #[error("Consistency error: field `{field}` diverges on rank {rank} in {group} group")]
    Consistency {
        field: String,
        rank: usize,
        group: String,
    },

    /// Collective timeout, group-membership or enumeration mismatch.
    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

pub type Result<T> = std::result::Result<T, MeshError>;
