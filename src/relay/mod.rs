//! Raw terminal byte path: clipboard extraction and budgeted flushing.

pub mod extractor;
pub mod scheduler;
pub mod stream;
