pub mod backend;
pub mod capture;
pub mod convert;
pub mod playback;

#[cfg(feature = "cpal")]
pub mod cpal_backend;

pub use backend::{
    AudioBackendConfig, AudioDevice, AudioDeviceFactory, AudioFrame, AudioInput, AudioOutput,
    NullDevice,
};
pub use capture::{CaptureExit, CapturePipeline, CaptureReport, FrameSink};
pub use playback::{spawn_playback, PlaybackQueue, QueuedFrame, DEQUEUE_TIMEOUT};

#[cfg(feature = "cpal")]
pub use cpal_backend::CpalDevice;
