//! Shared utility functions for persona-forge.
//!
//! Retry/poll policies used by every external-service caller, and JSON
//! extraction for model responses that wrap their payload in prose.

pub mod backoff;
pub mod json_extraction;

pub use backoff::{BackoffPolicy, DelayStrategy, PollPolicy, Transient};
pub use json_extraction::{extract_json_object, find_matching_brace};
