//! One-shot text-to-speech
//!
//! Shares the transport and playback queue with voice sessions but skips the
//! configuration handshake and the capture side.

mod client;
mod wav;

pub use client::{
    simple_tts, MetadataHandler, SynthesisHandle, SynthesisOptions, SynthesisReport, TtsClient,
    DEFAULT_RESPONSE_TIMEOUT, DRAIN_GRACE,
};
pub use wav::write_wav;
