use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("config source error: {0}")]
    Config(String),

    #[error("sink delivery error: {0}")]
    Delivery(String),
}
