pub mod config;
pub mod error;
pub mod model;
pub mod wire;

pub use config::Config;
pub use error::ModelError;
pub use model::*;
pub use wire::*;
