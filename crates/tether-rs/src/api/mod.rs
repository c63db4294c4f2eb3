//! Protocol and policy layer: stream framing, backoff, and routing.
//!
//! - [`streaming`]: NDJSON framer for incremental chat responses. Produces
//!   [`StreamEvent`](streaming::StreamEvent) values.
//! - [`retry`]: exponential backoff with a cap, and a circuit breaker with a
//!   half-open probe after its cool-down.
//! - [`router`]: [`ConnectionRouter`] picks the best healthy transport and
//!   merges the model lists.

pub mod retry;
pub mod router;
pub mod streaming;

// Re-export commonly used items at the module level.
pub use retry::{Backoff, CircuitBreaker, RetryPolicy, RetryState};
pub use router::{ConnectionRouter, RouterStatus};
pub use streaming::{StreamEvent, StreamFramer, collect_text, decode_stream};
