pub mod clock;
pub mod config;
pub mod error;
pub mod db;
pub mod format;
pub mod split;
pub mod status;
pub mod store;
pub mod process;
pub mod janitor;
pub mod pipeline;

pub use config::Config;
pub use error::{DocsplitError, Result};
pub use pipeline::{CleanupOutcome, DocumentStatusReport, Pipeline, SplitOutcome};
