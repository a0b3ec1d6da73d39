pub mod dedupe;
pub mod error;
pub mod logging;
pub mod traits;

pub use dedupe::{CachedConfigReader, DedupingAlertSink};
pub use error::AlertError;
pub use logging::LoggingAlertSink;
pub use traits::{AlertConfigReader, AlertSink};
