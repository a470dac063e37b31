//! Default system microphone and speakers via cpal.
//!
//! Streams run in the device's own default format; audio is downmixed and
//! resampled to the mono wire rate on input, and upmixed and resampled on
//! output.
//!
//! Each cpal stream lives on its own thread for its whole lifetime; the
//! `AudioInput`/`AudioOutput` handles talk to it through channels and a shared
//! sample buffer, so they stay `Send` on every host.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, info};

use super::backend::{AudioBackendConfig, AudioDevice, AudioFrame, AudioInput, AudioOutput};
use super::convert::{fill_interleaved, resample, to_f32, to_i16, to_mono};
use crate::error::{Result, SessionError};

/// Callback chunks buffered before the input side starts dropping (overflow)
const INPUT_BACKLOG: usize = 64;

/// Output audio buffered ahead of the device before `write` blocks
const OUTPUT_AHEAD_MS: u32 = 200;

/// The host's default input and output devices
pub struct CpalDevice {
    name: String,
}

impl CpalDevice {
    pub fn new() -> Self {
        Self {
            name: format!("cpal ({:?})", cpal::default_host().id()),
        }
    }
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for CpalDevice {
    fn open_input(&self, config: &AudioBackendConfig) -> Result<Box<dyn AudioInput>> {
        config.validate()?;
        Ok(Box::new(CpalInput::open(config)?))
    }

    fn open_output(&self, config: &AudioBackendConfig) -> Result<Box<dyn AudioOutput>> {
        config.validate()?;
        Ok(Box::new(CpalOutput::open(config)?))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Owns a stream thread and stops it exactly once
struct StreamThread {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(mpsc::Receiver<()>, mpsc::Sender<Result<()>>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(stop_rx, ready_tx))
            .map_err(|e| SessionError::Device(format!("failed to spawn {name} thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(SessionError::Device(format!("{name} thread exited during setup"))),
        }
    }

    fn stop(&mut self) {
        // Dropping the sender wakes the thread, which then drops its stream.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("audio stream thread panicked");
            }
        }
    }
}

struct CpalInput {
    rx: mpsc::Receiver<Vec<i16>>,
    pending: Vec<i16>,
    frame_samples: usize,
    read_timeout: Duration,
    thread: StreamThread,
}

impl CpalInput {
    fn open(config: &AudioBackendConfig) -> Result<Self> {
        let target_rate = config.input_sample_rate;
        let (data_tx, data_rx) = mpsc::sync_channel::<Vec<i16>>(INPUT_BACKLOG);

        let thread = StreamThread::spawn("audio-input", move |stop_rx, ready_tx| {
            let host = cpal::default_host();
            let Some(device) = host.default_input_device() else {
                let _ = ready_tx.send(Err(SessionError::Device("no default input device".into())));
                return;
            };

            let native = match device.default_input_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(SessionError::Device(format!(
                        "no default input config: {e}"
                    ))));
                    return;
                }
            };
            let native_rate = native.sample_rate();
            let native_channels = native.channels();
            let stream_config = StreamConfig {
                channels: native_channels,
                sample_rate: native_rate,
                buffer_size: cpal::BufferSize::Default,
            };
            info!(
                "Native input config: {}Hz, {} channels (sending {}Hz mono)",
                native_rate, native_channels, target_rate
            );

            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = to_mono(data, native_channels);
                    let samples: Vec<i16> = resample(&mono, native_rate, target_rate)
                        .into_iter()
                        .map(to_i16)
                        .collect();
                    // Never block the audio thread; a full backlog is an overflow.
                    if data_tx.try_send(samples).is_err() {
                        debug!("input backlog full, dropping samples");
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(SessionError::Device(format!(
                        "failed to build input stream: {e}"
                    ))));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(SessionError::Device(format!(
                    "failed to start input stream: {e}"
                ))));
                return;
            }

            let _ = ready_tx.send(Ok(()));
            let _ = stop_rx.recv();
            drop(stream);
        })?;

        info!(
            "Input stream opened ({}Hz, {} channel, {}ms frames)",
            config.input_sample_rate, config.channels, config.frame_duration_ms
        );

        Ok(Self {
            rx: data_rx,
            pending: Vec::new(),
            frame_samples: config.frame_samples(),
            read_timeout: Duration::from_millis(config.frame_duration_ms as u64 * 5),
            thread,
        })
    }
}

impl AudioInput for CpalInput {
    fn read_frame(&mut self) -> Result<Option<AudioFrame>> {
        while self.pending.len() < self.frame_samples {
            match self.rx.recv_timeout(self.read_timeout) {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::Device("input stream ended".into()));
                }
            }
        }

        let rest = self.pending.split_off(self.frame_samples);
        let frame = AudioFrame::from_samples(&self.pending);
        self.pending = rest;
        Ok(Some(frame))
    }

    fn close(&mut self) -> Result<()> {
        self.thread.stop();
        Ok(())
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.thread.stop();
    }
}

struct CpalOutput {
    /// Mono samples at the device rate
    buffer: Arc<Mutex<VecDeque<f32>>>,
    failed: Arc<AtomicBool>,
    source_rate: u32,
    device_rate: u32,
    max_ahead: usize,
    thread: StreamThread,
}

impl CpalOutput {
    fn open(config: &AudioBackendConfig) -> Result<Self> {
        let buffer = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let failed = Arc::new(AtomicBool::new(false));
        let (rate_tx, rate_rx) = mpsc::channel();

        let cb_buffer = Arc::clone(&buffer);
        let cb_failed = Arc::clone(&failed);
        let thread = StreamThread::spawn("audio-output", move |stop_rx, ready_tx| {
            let host = cpal::default_host();
            let Some(device) = host.default_output_device() else {
                let _ = ready_tx.send(Err(SessionError::Device("no default output device".into())));
                return;
            };

            let native = match device.default_output_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(SessionError::Device(format!(
                        "no default output config: {e}"
                    ))));
                    return;
                }
            };
            let native_channels = native.channels();
            let stream_config = StreamConfig {
                channels: native_channels,
                sample_rate: native.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };
            let _ = rate_tx.send(native.sample_rate());

            let stream = device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut buf = match cb_buffer.lock() {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    fill_interleaved(data, native_channels, || buf.pop_front());
                },
                move |err| {
                    error!("audio output stream error: {err}");
                    cb_failed.store(true, Ordering::SeqCst);
                },
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(SessionError::Device(format!(
                        "failed to build output stream: {e}"
                    ))));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(SessionError::Device(format!(
                    "failed to start output stream: {e}"
                ))));
                return;
            }

            let _ = ready_tx.send(Ok(()));
            let _ = stop_rx.recv();
            drop(stream);
        })?;

        let device_rate = rate_rx.recv().unwrap_or(config.output_sample_rate);
        info!(
            "Output stream opened ({}Hz mono in, {}Hz device)",
            config.output_sample_rate, device_rate
        );

        Ok(Self {
            buffer,
            failed,
            source_rate: config.output_sample_rate,
            device_rate,
            max_ahead: (device_rate * OUTPUT_AHEAD_MS / 1000) as usize,
            thread,
        })
    }

    fn buffered(&self) -> usize {
        match self.buffer.lock() {
            Ok(b) => b.len(),
            Err(p) => p.into_inner().len(),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(SessionError::Device("output stream failed".into()));
        }

        let samples: Vec<f32> = frame.samples().into_iter().map(to_f32).collect();
        let samples = resample(&samples, self.source_rate, self.device_rate);
        {
            let mut buf = match self.buffer.lock() {
                Ok(b) => b,
                Err(p) => p.into_inner(),
            };
            buf.extend(samples);
        }

        // Block like a hardware write while the device is far ahead of us.
        while self.buffered() > self.max_ahead {
            if self.failed.load(Ordering::SeqCst) {
                return Err(SessionError::Device("output stream failed".into()));
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.thread.stop();
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.thread.stop();
    }
}
