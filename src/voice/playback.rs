//! Audio playback to speakers
//!
//! Router speech arrives as 16 kHz PCM16; feedback chimes are WAV or MP3
//! files. Everything is decoded to mono `f32`, resampled to the output
//! device's rate and played on a dedicated worker thread, one job at a time.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::mute::MuteState;
use crate::{Error, Result};

/// Sample rate of speech audio sent by the router
pub const SPEECH_SAMPLE_RATE: u32 = 16000;

/// Extra mute held past the end of speech playback
const PLAYBACK_TAIL: Duration = Duration::from_millis(300);

/// Plays audio to the default output device
#[derive(Debug, Clone)]
pub struct AudioPlayback {
    config: StreamConfig,
}

impl AudioPlayback {
    /// Create a new audio playback instance
    ///
    /// Prefers an output config at the speech rate; otherwise takes the
    /// device default and resamples.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let rate = SampleRate(SPEECH_SAMPLE_RATE);
        let native = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .filter(|c| {
                c.sample_format() == cpal::SampleFormat::F32
                    && c.min_sample_rate() <= rate
                    && c.max_sample_rate() >= rate
            })
            .min_by_key(|c| c.channels())
            .map(|c| c.with_sample_rate(rate).config());

        let config = match native {
            Some(config) => config,
            None => {
                let default = device
                    .default_output_config()
                    .map_err(|e| Error::Audio(e.to_string()))?;
                if default.sample_format() != cpal::SampleFormat::F32 {
                    return Err(Error::Audio(format!(
                        "output device does not support f32 samples ({:?})",
                        default.sample_format()
                    )));
                }
                default.config()
            }
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { config })
    }

    /// Output sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Play mono samples recorded at `rate`, blocking until done
    ///
    /// # Errors
    ///
    /// Returns error if resampling or the output stream fails
    pub fn play(&self, samples: &[f32], rate: u32) -> Result<()> {
        let samples = resample(samples, rate, self.sample_rate())?;
        self.play_samples_blocking(samples)
    }

    /// Play little-endian PCM16 speech at the router's rate
    ///
    /// # Errors
    ///
    /// Returns error if playback fails
    pub fn play_pcm16(&self, bytes: &[u8]) -> Result<()> {
        self.play(&pcm16_to_f32(bytes), SPEECH_SAMPLE_RATE)
    }

    /// Decode and play a WAV or MP3 file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or decoded, or playback fails
    pub fn play_file(&self, path: &Path) -> Result<()> {
        let (samples, rate) = decode_file(path)?;
        self.play(&samples, rate)
    }

    /// Play samples in a blocking manner
    fn play_samples_blocking(&self, samples: Vec<f32>) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device".to_string()))?;

        let channels = usize::from(self.config.channels.max(1));
        let sample_count = samples.len();
        let samples = Arc::new(samples);
        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let stream = {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            let finished = Arc::clone(&finished);

            device
                .build_output_stream(
                    &self.config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut pos = position.load(Ordering::Relaxed);
                        for frame in data.chunks_mut(channels) {
                            let sample = samples.get(pos).copied().unwrap_or(0.0);
                            frame.fill(sample);
                            if pos < samples.len() {
                                pos += 1;
                            }
                        }
                        position.store(pos, Ordering::Relaxed);
                        if pos >= samples.len() {
                            finished.store(true, Ordering::Release);
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        // Poll for completion with timeout
        let expected = duration_of(
            u64::try_from(sample_count).unwrap_or(u64::MAX),
            self.sample_rate(),
        );
        let start = Instant::now();
        let timeout = expected + Duration::from_millis(500);

        while !finished.load(Ordering::Acquire) {
            if start.elapsed() > timeout {
                tracing::warn!(samples = sample_count, "playback timed out");
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));

        drop(stream);
        tracing::debug!(samples = sample_count, "playback complete");

        Ok(())
    }
}

/// Feedback sounds looked up in the sounds directory
#[derive(Debug, Clone, Default)]
pub struct FeedbackSounds {
    /// Played once at startup
    pub boot: Option<PathBuf>,
    /// Played on activation
    pub click: Option<PathBuf>,
    /// Played when the router starts a conversation
    pub init: Option<PathBuf>,
}

impl FeedbackSounds {
    /// Find `boot.wav`, `click.wav` and `init.mp3` in `dir`
    ///
    /// Missing files are left unset.
    #[must_use]
    pub fn from_dir(dir: Option<&Path>) -> Self {
        let Some(dir) = dir else {
            return Self::default();
        };

        let find = |name: &str| {
            let path = dir.join(name);
            if path.is_file() {
                Some(path)
            } else {
                tracing::debug!(path = %path.display(), "feedback sound not found");
                None
            }
        };

        Self {
            boot: find("boot.wav"),
            click: find("click.wav"),
            init: find("init.mp3"),
        }
    }
}

/// Progress reported by the playback worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// All queued speech has been played
    SpeechDrained,
}

enum PlaybackJob {
    Speech { pcm: Vec<u8>, samples: u64 },
    File(PathBuf),
}

/// Queue feeding the playback worker thread
///
/// While speech is queued or playing, listening is held muted when
/// `self_mute` is set, so the node does not hear itself.
#[derive(Debug, Clone)]
pub struct PlaybackQueue {
    jobs: Sender<PlaybackJob>,
    mute: Arc<MuteState>,
    self_mute: bool,
    speech_backlog: Arc<AtomicU64>,
}

impl PlaybackQueue {
    /// Start the worker thread
    ///
    /// If no output device can be opened the worker logs and discards jobs.
    /// The receiver yields [`PlaybackEvent`]s from the worker.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn spawn(
        mute: Arc<MuteState>,
        self_mute: bool,
    ) -> Result<(Self, UnboundedReceiver<PlaybackEvent>)> {
        let (tx, rx) = mpsc::channel();
        let (event_tx, events) = unbounded_channel();
        let speech_backlog = Arc::new(AtomicU64::new(0));

        let worker = PlaybackWorker {
            jobs: rx,
            events: event_tx,
            mute: Arc::clone(&mute),
            self_mute,
            speech_backlog: Arc::clone(&speech_backlog),
        };

        std::thread::Builder::new()
            .name("wakenode-playback".to_string())
            .spawn(move || worker.run())?;

        let queue = Self {
            jobs: tx,
            mute,
            self_mute,
            speech_backlog,
        };
        Ok((queue, events))
    }

    /// Whether speech is queued or playing
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speech_backlog.load(Ordering::Acquire) > 0
    }

    /// Queue router speech (PCM16 at [`SPEECH_SAMPLE_RATE`])
    ///
    /// # Errors
    ///
    /// Returns error if the worker has exited
    pub fn speak(&self, pcm: Vec<u8>) -> Result<()> {
        let samples = u64::try_from(pcm.len() / 2).unwrap_or(u64::MAX);
        let backlog = self.speech_backlog.fetch_add(samples, Ordering::AcqRel) + samples;

        if self.self_mute {
            self.mute.hold(duration_of(backlog, SPEECH_SAMPLE_RATE) + PLAYBACK_TAIL);
        }

        self.send(PlaybackJob::Speech { pcm, samples }).inspect_err(|_| {
            self.speech_backlog.fetch_sub(samples, Ordering::AcqRel);
        })
    }

    /// Queue a sound file
    ///
    /// # Errors
    ///
    /// Returns error if the worker has exited
    pub fn play_file(&self, path: PathBuf) -> Result<()> {
        self.send(PlaybackJob::File(path))
    }

    fn send(&self, job: PlaybackJob) -> Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| Error::Audio("playback worker is gone".to_string()))
    }
}

struct PlaybackWorker {
    jobs: Receiver<PlaybackJob>,
    events: UnboundedSender<PlaybackEvent>,
    mute: Arc<MuteState>,
    self_mute: bool,
    speech_backlog: Arc<AtomicU64>,
}

impl PlaybackWorker {
    fn run(self) {
        let playback = match AudioPlayback::new() {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::error!(error = %e, "audio output unavailable, playback disabled");
                None
            }
        };

        while let Ok(job) = self.jobs.recv() {
            match job {
                PlaybackJob::Speech { pcm, samples } => {
                    if let Some(Err(e)) = playback.as_ref().map(|p| p.play_pcm16(&pcm)) {
                        tracing::warn!(error = %e, "speech playback failed");
                    }
                    self.speech_finished(samples);
                }
                PlaybackJob::File(path) => {
                    if let Some(Err(e)) = playback.as_ref().map(|p| p.play_file(&path)) {
                        tracing::warn!(path = %path.display(), error = %e, "sound playback failed");
                    }
                }
            }
        }

        tracing::debug!("playback worker stopped");
    }

    fn speech_finished(&self, samples: u64) {
        let remaining = self
            .speech_backlog
            .fetch_sub(samples, Ordering::AcqRel)
            .saturating_sub(samples);
        if remaining > 0 {
            return;
        }

        if self.self_mute {
            std::thread::sleep(PLAYBACK_TAIL);
            if self.speech_backlog.load(Ordering::Acquire) > 0 {
                return;
            }
            self.mute.release_hold();
        }

        if self.events.send(PlaybackEvent::SpeechDrained).is_err() {
            tracing::debug!("nobody listening for playback events");
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn duration_of(samples: u64, rate: u32) -> Duration {
    if rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / f64::from(rate))
}

/// Convert little-endian PCM16 bytes to normalized samples
#[must_use]
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect()
}

/// Resample mono audio between rates
///
/// # Errors
///
/// Returns error if the resampler rejects the ratio
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from == 0 || to == 0 {
        return Err(Error::Audio(format!("invalid resample {from} Hz -> {to} Hz")));
    }

    let ratio = f64::from(to) / f64::from(from);
    let mut resampler =
        FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Septic, samples.len(), 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let mut output = resampler
        .process(&[samples], None)
        .map_err(|e| Error::Audio(format!("resampling failed: {e}")))?;

    Ok(output.pop().unwrap_or_default())
}

/// Decode a sound file by extension
///
/// # Errors
///
/// Returns error for unreadable files, unknown extensions or bad data
pub fn decode_file(path: &Path) -> Result<(Vec<f32>, u32)> {
    let data = std::fs::read(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("wav") => decode_wav(&data),
        Some("mp3") => decode_mp3(&data),
        _ => Err(Error::Audio(format!("unsupported sound file: {}", path.display()))),
    }
}

/// Decode WAV bytes to mono f32 samples and their rate
///
/// # Errors
///
/// Returns error if the data is not valid WAV
#[allow(clippy::cast_precision_loss)]
pub fn decode_wav(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(data)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?
        }
    };

    Ok((downmix(&interleaved, usize::from(spec.channels)), spec.sample_rate))
}

/// Decode MP3 bytes to mono f32 samples and their rate
///
/// # Errors
///
/// Returns error on corrupt frames or mixed sample rates
pub fn decode_mp3(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(data));
    let mut samples = Vec::new();
    let mut rate: Option<u32> = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                let frame_rate = u32::try_from(frame.sample_rate)
                    .map_err(|_| Error::Audio(format!("bad MP3 sample rate {}", frame.sample_rate)))?;
                match rate {
                    None => rate = Some(frame_rate),
                    Some(r) if r != frame_rate => {
                        return Err(Error::Audio("MP3 changes sample rate mid-stream".to_string()));
                    }
                    Some(_) => {}
                }

                let floats: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&floats, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    let rate = rate.ok_or_else(|| Error::Audio("MP3 contains no frames".to_string()))?;
    Ok((samples, rate))
}

/// Average interleaved channels into mono
#[allow(clippy::cast_precision_loss)]
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(channels: u16, rate: u32, samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn pcm16_conversion() {
        let samples = pcm16_to_f32(&[0x00, 0x40, 0x00, 0xc0, 0x01]);
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn decodes_stereo_wav_to_mono() {
        let data = wav_bytes(2, 22050, &[16384, 0, -16384, -16384]);
        let (samples, rate) = decode_wav(&data).unwrap();
        assert_eq!(rate, 22050);
        assert_eq!(samples, vec![0.25, -0.5]);
    }

    #[test]
    fn rejects_garbage_wav() {
        assert!(decode_wav(b"definitely not riff").is_err());
    }

    #[test]
    fn empty_mp3_is_an_error() {
        assert!(decode_mp3(&[]).is_err());
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&input, 16000, 16000).unwrap(), input);
    }

    #[test]
    fn resample_changes_length_by_ratio() {
        let input: Vec<f32> = (0..4800).map(|i| (i as f32 * 0.01).sin()).collect();
        let output = resample(&input, 48000, 16000).unwrap();
        let expected = 1600.0;
        let len = output.len() as f64;
        assert!((len - expected).abs() / expected < 0.1, "len = {len}");
    }

    #[test]
    fn unknown_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chime.ogg");
        std::fs::write(&path, b"OggS").unwrap();
        assert!(matches!(decode_file(&path), Err(Error::Audio(_))));
    }

    #[test]
    fn feedback_sounds_only_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("click.wav"), wav_bytes(1, 16000, &[0; 16])).unwrap();

        let sounds = FeedbackSounds::from_dir(Some(dir.path()));
        assert!(sounds.boot.is_none());
        assert_eq!(sounds.click, Some(dir.path().join("click.wav")));
        assert!(sounds.init.is_none());

        assert!(FeedbackSounds::from_dir(None).click.is_none());
    }

    #[test]
    fn drained_speech_releases_only_the_hold() {
        let mute = Arc::new(MuteState::new());
        let (queue, mut events) = PlaybackQueue::spawn(Arc::clone(&mute), true).unwrap();

        queue.speak(vec![0; 320]).unwrap();
        assert!(mute.is_muted());
        mute.mute(None);

        let event = events.blocking_recv();
        assert_eq!(event, Some(PlaybackEvent::SpeechDrained));
        assert!(!queue.is_speaking());
        // The peer mute taken during playback is still in force
        assert!(mute.is_muted());
        assert!(mute.unmute());
        assert!(!mute.is_muted());
    }

    #[test]
    fn durations() {
        assert_eq!(duration_of(16000, 16000), Duration::from_secs(1));
        assert_eq!(duration_of(8000, 0), Duration::ZERO);
    }
}
