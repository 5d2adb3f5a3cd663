//! Outbound audio pacing.
//!
//! Browser clients deliver PCM16 audio in whatever chunk sizes their audio
//! worklet produces. The realtime API rejects segments shorter than a minimum
//! duration, so the `AudioPacer` accumulates raw bytes and only releases them
//! once the buffered audio spans at least `min_buffer_duration_ms`.

use bytes::{Bytes, BytesMut};
use std::ops::Deref;
use std::time::Instant;
use tracing::trace;

/// Sample rate the realtime API expects for `pcm16` input and output.
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;
/// Bytes per sample for 16-bit PCM.
pub const PCM16_SAMPLE_WIDTH_BYTES: u32 = 2;
/// Shortest segment the pacer will release on its own.
pub const MIN_BUFFER_DURATION_MS: u32 = 100;

/// Duration in milliseconds of `byte_count` bytes of mono audio.
///
/// `byte_count / sample_width_bytes / sample_rate * 1000`, evaluated in `f64`
/// without rounding to whole samples.
pub fn duration_ms(byte_count: usize, sample_rate: u32, sample_width_bytes: u32) -> f64 {
    byte_count as f64 / f64::from(sample_width_bytes) / f64::from(sample_rate) * 1000.0
}

/// A block of buffered audio released by the pacer, ready to be sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushPayload(Bytes);

impl FlushPayload {
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Deref for FlushPayload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// Accumulates client audio until it is long enough to send upstream.
#[derive(Debug)]
pub struct AudioPacer {
    buffer: BytesMut,
    sample_rate: u32,
    sample_width_bytes: u32,
    min_buffer_duration_ms: u32,
    last_flush: Option<Instant>,
}

impl AudioPacer {
    /// Creates a pacer for 16-bit mono audio at `sample_rate` with the default
    /// 100ms threshold.
    pub fn new(sample_rate: u32) -> Self {
        Self::with_threshold(sample_rate, MIN_BUFFER_DURATION_MS)
    }

    pub fn with_threshold(sample_rate: u32, min_buffer_duration_ms: u32) -> Self {
        Self {
            buffer: BytesMut::new(),
            sample_rate,
            sample_width_bytes: PCM16_SAMPLE_WIDTH_BYTES,
            min_buffer_duration_ms,
            last_flush: None,
        }
    }

    /// Appends `chunk` and returns the whole buffer once it holds at least the
    /// minimum duration. Below the threshold the bytes stay queued.
    pub fn ingest(&mut self, chunk: &[u8]) -> Option<FlushPayload> {
        self.buffer.extend_from_slice(chunk);
        let buffered = self.buffered_duration_ms();
        if buffered < f64::from(self.min_buffer_duration_ms) {
            trace!(
                buffered_bytes = self.buffer.len(),
                buffered_ms = buffered,
                "Audio queued below flush threshold"
            );
            return None;
        }
        Some(self.take())
    }

    /// Releases whatever is buffered regardless of the threshold. Used at
    /// teardown so trailing audio is not dropped.
    pub fn drain(&mut self) -> Option<FlushPayload> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.take())
    }

    /// Puts a released payload back ahead of anything buffered since, so a
    /// later `drain` still returns it. Used when sending the payload failed.
    pub fn restore(&mut self, payload: FlushPayload) {
        let mut buffer = BytesMut::with_capacity(payload.len() + self.buffer.len());
        buffer.extend_from_slice(&payload);
        buffer.extend_from_slice(&self.buffer);
        self.buffer = buffer;
    }

    /// Duration of the currently buffered audio in milliseconds.
    pub fn buffered_duration_ms(&self) -> f64 {
        duration_ms(self.buffer.len(), self.sample_rate, self.sample_width_bytes)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// When the pacer last released a payload, if ever.
    pub fn last_flush(&self) -> Option<Instant> {
        self.last_flush
    }

    fn take(&mut self) -> FlushPayload {
        let now = Instant::now();
        if let Some(previous) = self.last_flush {
            trace!(
                since_last_flush_ms = now.duration_since(previous).as_millis() as u64,
                "Releasing buffered audio"
            );
        }
        self.last_flush = Some(now);
        FlushPayload(self.buffer.split().freeze())
    }
}
