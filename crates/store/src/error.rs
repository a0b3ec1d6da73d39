use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("unknown stage id: {0}")]
    UnknownStage(i64),

    #[error("unknown pipeline id: {0}")]
    UnknownPipeline(i64),

    #[error("duplicate stage name within pipeline: {0}")]
    DuplicateStageName(String),

    #[error("dependsOn reference to unknown stage: {0}")]
    UnknownDependency(String),

    #[error(transparent)]
    Model(#[from] stagework_core::ModelError),
}
