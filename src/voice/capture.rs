//! Audio capture from microphone
//!
//! The cpal callback slices incoming samples into fixed-size frames and
//! pushes them into a small bounded queue. When the consumer falls behind
//! the newest frame is dropped instead of blocking the device callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};

use super::frame::{AudioFrame, f32_to_i16};
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// A source of fixed-size frames
///
/// Implementations need not be `Send`; the capture thread builds its own.
pub trait FrameSource {
    /// Wait up to `timeout` for the next frame
    ///
    /// `Ok(None)` means no frame arrived in time.
    ///
    /// # Errors
    ///
    /// [`Error::AudioRead`] for a recoverable glitch, [`Error::Audio`] when
    /// the device is gone
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>>;
}

/// An input device as listed by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
}

enum CaptureMessage {
    Frame(AudioFrame),
    Glitch(String),
}

/// Captures fixed-size frames from an input device
pub struct AudioCapture {
    _stream: Stream,
    frames: Receiver<CaptureMessage>,
    failed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl AudioCapture {
    /// Open the configured input device and start streaming
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be found, opened or started
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_input_device(&host, config.input_device.as_deref())?;
        let (stream_config, format) = pick_input_config(&device, config.sample_rate)?;

        let (tx, rx) = mpsc::sync_channel(config.queue_depth.max(1));
        let failed = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let framer = Framer {
            chunk_size: config.chunk_size,
            channels: usize::from(stream_config.channels.max(1)),
            pending: Vec::with_capacity(config.chunk_size * 2),
            tx: tx.clone(),
            dropped: Arc::clone(&dropped),
        };

        let stream = match format {
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, framer, tx, &failed),
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, framer, tx, &failed),
            other => Err(Error::Audio(format!("unsupported sample format {other:?}"))),
        }?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::info!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate,
            channels = stream_config.channels,
            chunk_size = config.chunk_size,
            format = ?format,
            "audio capture started"
        );

        Ok(Self {
            _stream: stream,
            frames: rx,
            failed,
            dropped,
        })
    }

    /// Frames dropped because the queue was full, since the last call
    #[must_use]
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

impl FrameSource for AudioCapture {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>> {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::Audio("input device no longer available".to_string()));
        }

        let dropped = self.take_dropped();
        if dropped > 0 {
            tracing::warn!(dropped, "capture queue full, frames dropped");
        }

        match self.frames.recv_timeout(timeout) {
            Ok(CaptureMessage::Frame(frame)) => Ok(Some(frame)),
            Ok(CaptureMessage::Glitch(msg)) => Err(Error::AudioRead(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Audio("capture stream closed".to_string()))
            }
        }
    }
}

/// Slices interleaved callback data into mono frames
struct Framer {
    chunk_size: usize,
    channels: usize,
    pending: Vec<i16>,
    tx: SyncSender<CaptureMessage>,
    dropped: Arc<AtomicU64>,
}

impl Framer {
    fn push<T>(&mut self, data: &[T])
    where
        T: Sample,
        f32: FromSample<T>,
    {
        for frame in data.chunks(self.channels) {
            #[allow(clippy::cast_precision_loss)]
            let mixed = frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32;
            self.pending.push(f32_to_i16(mixed));

            if self.pending.len() == self.chunk_size {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.chunk_size));
                match self.tx.try_send(CaptureMessage::Frame(AudioFrame::new(samples))) {
                    Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut framer: Framer,
    glitches: SyncSender<CaptureMessage>,
    failed: &Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let failed = Arc::clone(failed);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| framer.push(data),
            move |err| {
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    tracing::error!("input device disconnected");
                    failed.store(true, Ordering::Release);
                } else {
                    let _ = glitches.try_send(CaptureMessage::Glitch(err.to_string()));
                }
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

/// Find an input device by index or case-insensitive name substring
///
/// `None` selects the host default.
fn select_input_device(host: &cpal::Host, selector: Option<&str>) -> Result<Device> {
    let Some(selector) = selector.map(str::trim).filter(|s| !s.is_empty()) else {
        return host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()));
    };

    let mut devices = host
        .input_devices()
        .map_err(|e| Error::Audio(e.to_string()))?;

    let found = if let Ok(index) = selector.parse::<usize>() {
        devices.nth(index)
    } else {
        let wanted = selector.to_lowercase();
        devices.find(|d| {
            d.name()
                .is_ok_and(|n| n.to_lowercase().contains(&wanted))
        })
    };

    found.ok_or_else(|| Error::Audio(format!("input device not found: {selector}")))
}

/// Choose a stream config at `sample_rate`, preferring mono and `i16`
fn pick_input_config(device: &Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    let rate = SampleRate(sample_rate);
    let mut candidates: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| {
            c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
                && matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32)
        })
        .collect();

    candidates.sort_by_key(|c| (c.channels() != 1, c.sample_format() != SampleFormat::I16));

    let chosen = candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::Audio(format!("no input config supports {sample_rate} Hz")))?;

    let format = chosen.sample_format();
    Ok((chosen.with_sample_rate(rate).config(), format))
}

/// List the host's input devices
///
/// # Errors
///
/// Returns error if the host cannot enumerate devices
pub fn list_input_devices() -> Result<Vec<InputDeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| Error::Audio(e.to_string()))?
        .enumerate()
        .map(|(index, d)| {
            let name = d.name().unwrap_or_else(|_| "<unknown>".to_string());
            InputDeviceInfo {
                index,
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
            }
        })
        .collect();

    Ok(devices)
}
