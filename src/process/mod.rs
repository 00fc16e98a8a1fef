//! Converting parts and whole documents on a bounded worker pool.

pub mod converter;
pub mod pool;

pub use converter::{build_converter, Conversion, Converter, HttpConverter, PlainTextConverter};
pub use pool::{ProcessingHandle, WorkerPool, CANCELLED_MESSAGE};
