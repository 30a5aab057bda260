//! Error classification for retry logic and error handling.

mod traits;

pub use traits::{retry_with_backoff, ErrorCategory, ErrorClassification};
