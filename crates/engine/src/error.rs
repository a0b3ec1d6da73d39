use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] stagework_store::StoreError),

    #[error(transparent)]
    Broker(#[from] stagework_broker::BrokerError),
}
