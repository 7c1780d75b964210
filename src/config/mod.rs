//! Configuration management for wakenode

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use self::file::NodeConfigFile;
use crate::router::RetryPolicy;
use crate::voice::SAMPLE_RATE;
use crate::{Error, Result};

/// Default router address
pub const DEFAULT_ROUTER: &str = "127.0.0.1:5555";

/// Default mute broadcast port
pub const DEFAULT_PEERS_PORT: u16 = 5556;

/// Default discovery port
pub const DEFAULT_DISCOVERY_PORT: u16 = 8888;

/// Node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity announced to the router and to peers
    pub name: String,

    /// Router address (`host:port`)
    pub router_address: String,

    /// Capture settings
    pub audio: AudioConfig,

    /// Wake word detection settings
    pub detector: DetectorConfig,

    /// Endpointing settings
    pub listen: ListenConfig,

    /// Peer coordination settings
    pub peers: PeersConfig,

    /// Reconnect policy for router and peer links
    pub reconnect: RetryPolicy,

    /// Directory holding feedback sounds
    pub sounds_dir: Option<PathBuf>,
}

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Samples per frame
    pub chunk_size: usize,

    /// Input device name substring or index (default device if `None`)
    pub input_device: Option<String>,

    /// Frames buffered between the device callback and the capture loop
    pub queue_depth: usize,

    /// Consecutive failed reads tolerated before the capture loop gives up
    pub max_read_errors: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_size: 320,
            input_device: None,
            queue_depth: 16,
            max_read_errors: 50,
        }
    }
}

/// Wake word detection configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Keyword key in the model output
    pub wake_word: String,

    /// Sidecar scoring command (`None` disables keyword activation)
    pub model_command: Option<String>,

    /// Sensitivity from 0.0 to 1.0
    pub sensitivity: f32,

    /// Chunk activations needed to trigger
    pub trigger_level: u32,

    /// RMS level mapped to VAD probability 0.0
    pub vad_floor: f32,

    /// RMS level mapped to VAD probability 1.0
    pub vad_ceiling: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            wake_word: "hey_jarvis".to_string(),
            model_command: None,
            sensitivity: 0.5,
            trigger_level: 3,
            vad_floor: 0.01,
            vad_ceiling: 0.06,
        }
    }
}

/// Endpointing configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ListenConfig {
    /// How long to wait for speech after activation
    pub false_start: Duration,

    /// Trailing silence that ends an utterance
    pub silence: Duration,

    /// VAD probability above which a frame counts as speech
    pub speech_threshold: f32,

    /// VAD probability below which a frame counts as silence
    pub silence_threshold: f32,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            false_start: Duration::from_secs(4),
            silence: Duration::from_secs(1),
            speech_threshold: 0.5,
            silence_threshold: 0.4,
        }
    }
}

/// Peer discovery and mute coordination configuration
#[derive(Debug, Clone)]
pub struct PeersConfig {
    /// Run discovery and the mute broadcast
    pub enabled: bool,

    /// Mute broadcast port (publisher binds, subscribers connect)
    pub port: u16,

    /// UDP discovery port
    pub discovery_port: u16,

    /// Interval between presence announcements
    pub discovery_interval: Duration,

    /// Auto-unmute deadline for mute requests (`None` never expires)
    pub mute_timeout: Option<Duration>,

    /// Mute the local pipeline while playing synthesized speech
    pub self_mute_during_playback: bool,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_PEERS_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_interval: Duration::from_secs(3),
            mute_timeout: Some(Duration::from_secs(15)),
            self_mute_during_playback: true,
        }
    }
}

impl Config {
    /// Load configuration from `.env`, the environment and the TOML file
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }

        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Build configuration with precedence env > file > default
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or out of range
    pub fn from_sources(fc: NodeConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let name = env("WAKENODE_NAME")
            .or(fc.node.name)
            .unwrap_or_else(default_name);

        let router_address = env("WAKENODE_ROUTER")
            .or(fc.node.router)
            .unwrap_or_else(|| DEFAULT_ROUTER.to_string());

        let audio_defaults = AudioConfig::default();
        let audio = AudioConfig {
            sample_rate: env_parse(&env, "WAKENODE_SAMPLE_RATE")?
                .or(fc.audio.sample_rate)
                .unwrap_or(audio_defaults.sample_rate),
            chunk_size: env_parse(&env, "WAKENODE_CHUNK_SIZE")?
                .or(fc.audio.chunk_size)
                .unwrap_or(audio_defaults.chunk_size),
            input_device: env("WAKENODE_INPUT_DEVICE").or(fc.audio.input_device),
            queue_depth: fc.audio.queue_depth.unwrap_or(audio_defaults.queue_depth),
            max_read_errors: fc
                .audio
                .max_read_errors
                .unwrap_or(audio_defaults.max_read_errors),
        };

        let detector_defaults = DetectorConfig::default();
        let detector = DetectorConfig {
            wake_word: env("WAKENODE_WAKE_WORD")
                .or(fc.detector.wake_word)
                .unwrap_or(detector_defaults.wake_word),
            model_command: env("WAKENODE_MODEL_COMMAND")
                .or(fc.detector.model_command)
                .filter(|c| !c.trim().is_empty()),
            sensitivity: env_parse(&env, "WAKENODE_SENSITIVITY")?
                .or(fc.detector.sensitivity)
                .unwrap_or(detector_defaults.sensitivity),
            trigger_level: env_parse(&env, "WAKENODE_TRIGGER_LEVEL")?
                .or(fc.detector.trigger_level)
                .unwrap_or(detector_defaults.trigger_level),
            vad_floor: env_parse(&env, "WAKENODE_VAD_FLOOR")?
                .or(fc.detector.vad_floor)
                .unwrap_or(detector_defaults.vad_floor),
            vad_ceiling: env_parse(&env, "WAKENODE_VAD_CEILING")?
                .or(fc.detector.vad_ceiling)
                .unwrap_or(detector_defaults.vad_ceiling),
        };

        let listen_defaults = ListenConfig::default();
        let listen = ListenConfig {
            false_start: secs(
                "false_start",
                env_parse(&env, "WAKENODE_FALSE_START_SECS")?.or(fc.listen.false_start_secs),
            )?
            .unwrap_or(listen_defaults.false_start),
            silence: secs(
                "silence",
                env_parse(&env, "WAKENODE_SILENCE_SECS")?.or(fc.listen.silence_secs),
            )?
            .unwrap_or(listen_defaults.silence),
            speech_threshold: fc
                .listen
                .speech_threshold
                .unwrap_or(listen_defaults.speech_threshold),
            silence_threshold: fc
                .listen
                .silence_threshold
                .unwrap_or(listen_defaults.silence_threshold),
        };

        let peers_defaults = PeersConfig::default();
        let mute_timeout = match secs(
            "mute_timeout",
            env_parse(&env, "WAKENODE_MUTE_TIMEOUT_SECS")?.or(fc.peers.mute_timeout_secs),
        )? {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => peers_defaults.mute_timeout,
        };
        let peers = PeersConfig {
            enabled: env_parse(&env, "WAKENODE_PEERS_ENABLED")?
                .or(fc.peers.enabled)
                .unwrap_or(peers_defaults.enabled),
            port: env_parse(&env, "WAKENODE_PEERS_PORT")?
                .or(fc.peers.port)
                .unwrap_or(peers_defaults.port),
            discovery_port: env_parse(&env, "WAKENODE_DISCOVERY_PORT")?
                .or(fc.peers.discovery_port)
                .unwrap_or(peers_defaults.discovery_port),
            discovery_interval: secs("discovery_interval", fc.peers.discovery_interval_secs)?
                .unwrap_or(peers_defaults.discovery_interval),
            mute_timeout,
            self_mute_during_playback: env_parse(&env, "WAKENODE_SELF_MUTE")?
                .or(fc.peers.self_mute_during_playback)
                .unwrap_or(peers_defaults.self_mute_during_playback),
        };

        let retry_defaults = RetryPolicy::default();
        let reconnect = RetryPolicy {
            max_retries: fc
                .reconnect
                .max_retries
                .unwrap_or(retry_defaults.max_retries),
            base_delay: fc
                .reconnect
                .base_delay_ms
                .map_or(retry_defaults.base_delay, Duration::from_millis),
            max_delay: fc
                .reconnect
                .max_delay_ms
                .map_or(retry_defaults.max_delay, Duration::from_millis),
        };

        let sounds_dir = env("WAKENODE_SOUNDS_DIR")
            .or(fc.node.sounds_dir)
            .map(PathBuf::from);

        let config = Self {
            name,
            router_address,
            audio,
            detector,
            listen,
            peers,
            reconnect,
            sounds_dir,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains(char::is_whitespace) {
            return Err(Error::Config(format!(
                "node name must be a single non-empty token, got {:?}",
                self.name
            )));
        }
        if !(0.0..=1.0).contains(&self.detector.sensitivity) {
            return Err(Error::Config(format!(
                "sensitivity must be within 0.0..=1.0, got {}",
                self.detector.sensitivity
            )));
        }
        if self.detector.trigger_level == 0 {
            return Err(Error::Config("trigger_level must be at least 1".to_string()));
        }
        if self.audio.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".to_string()));
        }
        // Captured PCM goes to the router and the scorers unconverted
        if self.audio.sample_rate != SAMPLE_RATE {
            return Err(Error::Config(format!(
                "sample_rate must be {SAMPLE_RATE} Hz, got {}",
                self.audio.sample_rate
            )));
        }
        if self.audio.queue_depth == 0 {
            return Err(Error::Config("queue_depth must be positive".to_string()));
        }
        if self.listen.silence_threshold > self.listen.speech_threshold {
            return Err(Error::Config(format!(
                "silence_threshold {} exceeds speech_threshold {}",
                self.listen.silence_threshold, self.listen.speech_threshold
            )));
        }
        if self.detector.vad_ceiling <= self.detector.vad_floor {
            return Err(Error::Config(
                "vad_ceiling must exceed vad_floor".to_string(),
            ));
        }
        Ok(())
    }

    /// Duration of one frame at the configured rate
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.audio.chunk_size as f64 / f64::from(self.audio.sample_rate))
    }
}

/// Default node identity: the host name
fn default_name() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().trim().replace(char::is_whitespace, "-"))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "wakenode".to_string())
}

/// Parse an environment value, rejecting malformed input
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw:?}")))
        })
        .transpose()
}

/// Convert fractional seconds into a duration
fn secs(field: &str, value: Option<f64>) -> Result<Option<Duration>> {
    value
        .map(|s| {
            Duration::try_from_secs_f64(s)
                .map_err(|_| Error::Config(format!("invalid duration for {field}: {s}")))
        })
        .transpose()
}
