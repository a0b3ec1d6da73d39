pub mod error;
pub mod pool;
mod row;
mod schedule;
mod snapshot;
mod store;

pub use error::StoreError;
pub use pool::init_pg_pool;
pub use store::Store;
