use thiserror::Error;

/// Errors raised by the domain model itself — parsing wire strings into
/// typed enums, validating a submitted pipeline shape. Transport and
/// storage errors live in their own crates (`stagework-broker`,
/// `stagework-store`) and convert into this type only where they cross
/// back into model construction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("unknown stage status: {0}")]
    UnknownStageStatus(String),

    #[error("unknown pipeline status: {0}")]
    UnknownPipelineStatus(String),

    #[error("unknown worker state: {0}")]
    UnknownWorkerState(String),

    #[error("duplicate stage name within pipeline: {0}")]
    DuplicateStageName(String),

    #[error("dependsOn reference to unknown stage: {0}")]
    UnknownDependency(String),

    #[error("circular stage dependency involving: {0}")]
    CircularDependency(String),

    #[error("{0}")]
    Other(String),
}
