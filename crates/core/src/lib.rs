//! Transport-free building blocks of the voice relay: outbound audio pacing,
//! upstream event classification, the upstream wire vocabulary and the
//! handshake retry policy.

pub mod events;
pub mod pacer;
pub mod realtime_api;
pub mod retry;

pub use events::{CycleStep, DecodeError, UpstreamEvent, demux};
pub use pacer::{AudioPacer, FlushPayload, REALTIME_SAMPLE_RATE};
pub use retry::RetryPolicy;
