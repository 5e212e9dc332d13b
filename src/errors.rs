use thiserror::Error;

/// Failure kinds surfaced by the analysis engine. Anything not covered here
/// travels as a plain `anyhow` error with context attached by the pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid range: pos {pos} (+{del} deleted) does not fit a file of {len} lines")]
    InvalidRange { pos: u32, del: u32, len: u32 },

    #[error("cannot merge files of different lengths: {left} vs {right}")]
    InvalidMerge { left: u32, right: u32 },

    #[error("corrupt input: {0}")]
    CorruptInput(String),

    #[error("missing object {oid} for {path}")]
    MissingObject { oid: String, path: String },

    #[error("time budget of {0:?} exceeded")]
    BudgetExceeded(std::time::Duration),

    #[error("dependency cycle among pipeline items: {0:?}")]
    Cycle(Vec<String>),
}
