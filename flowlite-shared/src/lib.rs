//! Types shared between flowlite crates.

pub mod errors;

pub use errors::{FlowliteError, FlowliteResult, StepFailure};
