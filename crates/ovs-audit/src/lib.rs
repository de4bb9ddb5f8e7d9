//! Audit surface: the masked per-execution event stream and the sink-level
//! log masker.
//!
//! Every payload that reaches a persisted event or a log line passes through
//! [`LogMasker`] first. Masking is idempotent — applying it twice yields the
//! same output — so downstream sinks may re-apply it safely.

pub mod masker;
pub mod writer;

pub use masker::LogMasker;
pub use writer::EventWriter;
