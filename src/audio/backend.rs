use crate::error::{Result, SessionError};
use std::sync::Arc;

/// Raw audio frame (16-bit little-endian PCM, mono)
///
/// Frames are immutable once produced: they come from the capture device or
/// from the transport and are consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pcm: Vec<u8>,
}

impl AudioFrame {
    /// Wrap raw PCM bytes
    pub fn new(pcm: Vec<u8>) -> Self {
        Self { pcm }
    }

    /// Build a frame from i16 samples
    pub fn from_samples(samples: &[i16]) -> Self {
        Self {
            pcm: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
        }
    }

    /// Decode the frame back into i16 samples (a trailing odd byte is ignored)
    pub fn samples(&self) -> Vec<i16> {
        self.pcm
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pcm
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.pcm
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.pcm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }
}

impl From<Vec<u8>> for AudioFrame {
    fn from(pcm: Vec<u8>) -> Self {
        Self::new(pcm)
    }
}

/// Configuration for the audio device adapter
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBackendConfig {
    /// Capture sample rate in Hz
    pub input_sample_rate: u32,
    /// Playback sample rate in Hz
    pub output_sample_rate: u32,
    /// Channel count (the wire format is mono)
    pub channels: u16,
    /// Duration of one capture frame in milliseconds
    pub frame_duration_ms: u32,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 44100,
            output_sample_rate: 44100,
            channels: 1,
            frame_duration_ms: 20,
        }
    }
}

impl AudioBackendConfig {
    /// Samples per capture frame (882 at 44.1kHz / 20ms)
    pub fn frame_samples(&self) -> usize {
        (self.input_sample_rate as u64 * self.frame_duration_ms as u64 / 1000) as usize
            * self.channels as usize
    }

    /// Bytes per capture frame
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(SessionError::Config("sample rate must be positive".into()));
        }
        if self.channels != 1 {
            return Err(SessionError::Config(format!(
                "only mono audio is supported, got {} channels",
                self.channels
            )));
        }
        if self.frame_duration_ms == 0 {
            return Err(SessionError::Config("frame duration must be positive".into()));
        }
        Ok(())
    }
}

/// Open input stream
///
/// `read_frame` blocks for at most about one frame period. `Ok(None)` means
/// the frame was dropped (hardware overflow) and the caller should read again.
pub trait AudioInput: Send {
    fn read_frame(&mut self) -> Result<Option<AudioFrame>>;

    /// Release the stream. Calling it twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Open output stream
pub trait AudioOutput: Send {
    /// Write a buffer, blocking while the device is saturated
    fn write(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Release the stream. Calling it twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Audio device adapter
///
/// Platform implementation:
/// - `CpalDevice`: default system microphone and speakers (feature `cpal`)
pub trait AudioDevice: Send + Sync {
    fn open_input(&self, config: &AudioBackendConfig) -> Result<Box<dyn AudioInput>>;

    fn open_output(&self, config: &AudioBackendConfig) -> Result<Box<dyn AudioOutput>>;

    /// Device name for logging
    fn name(&self) -> &str;
}

/// Device with no hardware behind it
///
/// Opening either direction fails. Useful for synthesis that only collects
/// audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDevice;

impl AudioDevice for NullDevice {
    fn open_input(&self, _config: &AudioBackendConfig) -> Result<Box<dyn AudioInput>> {
        Err(SessionError::Device("no input device".into()))
    }

    fn open_output(&self, _config: &AudioBackendConfig) -> Result<Box<dyn AudioOutput>> {
        Err(SessionError::Device("no output device".into()))
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Audio device factory
pub struct AudioDeviceFactory;

impl AudioDeviceFactory {
    /// Create the platform's default audio device
    pub fn create() -> Result<Arc<dyn AudioDevice>> {
        #[cfg(feature = "cpal")]
        {
            Ok(Arc::new(super::cpal_backend::CpalDevice::new()))
        }

        #[cfg(not(feature = "cpal"))]
        {
            Err(SessionError::Device(
                "built without audio device support (enable the `cpal` feature)".into(),
            ))
        }
    }
}
