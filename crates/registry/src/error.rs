use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Model(#[from] stagework_core::ModelError),

    #[error("unknown worker: {0}")]
    UnknownWorker(uuid::Uuid),

    #[error("session expired for worker {0}")]
    SessionExpired(uuid::Uuid),

    #[error("event batch of {got} exceeds max {max}")]
    BatchTooLarge { got: usize, max: u32 },
}
