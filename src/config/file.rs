//! TOML configuration file loading
//!
//! Supports `~/.config/wakenode/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct NodeConfigFile {
    /// Node identity and router connection
    #[serde(default)]
    pub node: NodeFileConfig,

    /// Capture device settings
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Wake word and VAD scoring
    #[serde(default)]
    pub detector: DetectorFileConfig,

    /// Utterance endpointing
    #[serde(default)]
    pub listen: ListenFileConfig,

    /// Peer discovery and mute coordination
    #[serde(default)]
    pub peers: PeersFileConfig,

    /// Reconnect policy for router and peer links
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
}

/// Node identity configuration
#[derive(Debug, Default, Deserialize)]
pub struct NodeFileConfig {
    /// Identity announced to the router and to peers
    pub name: Option<String>,

    /// Router address (`host:port`)
    pub router: Option<String>,

    /// Directory holding `boot.wav`, `click.wav` and `init.mp3`
    pub sounds_dir: Option<String>,
}

/// Capture device configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub chunk_size: Option<usize>,
    /// Input device name substring or index
    pub input_device: Option<String>,
    pub queue_depth: Option<usize>,
    pub max_read_errors: Option<u32>,
}

/// Wake word detector configuration
#[derive(Debug, Default, Deserialize)]
pub struct DetectorFileConfig {
    /// Keyword key in the model's prediction output (e.g. "hey_jarvis")
    pub wake_word: Option<String>,

    /// Sidecar command that scores frames for the wake word model
    pub model_command: Option<String>,

    /// Sensitivity from 0.0 to 1.0
    pub sensitivity: Option<f32>,

    /// Consecutive positive frames needed to trigger
    pub trigger_level: Option<u32>,

    /// RMS level mapped to VAD probability 0.0
    pub vad_floor: Option<f32>,

    /// RMS level mapped to VAD probability 1.0
    pub vad_ceiling: Option<f32>,
}

/// Endpointing configuration
#[derive(Debug, Default, Deserialize)]
pub struct ListenFileConfig {
    pub false_start_secs: Option<f64>,
    pub silence_secs: Option<f64>,
    pub speech_threshold: Option<f32>,
    pub silence_threshold: Option<f32>,
}

/// Peer coordination configuration
#[derive(Debug, Default, Deserialize)]
pub struct PeersFileConfig {
    pub enabled: Option<bool>,
    /// Mute broadcast port
    pub port: Option<u16>,
    pub discovery_port: Option<u16>,
    pub discovery_interval_secs: Option<f64>,
    /// Auto-unmute deadline for peer mute requests (0 disables)
    pub mute_timeout_secs: Option<f64>,
    pub self_mute_during_playback: Option<bool>,
}

/// Reconnect policy configuration
#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `NodeConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> NodeConfigFile {
    let Some(path) = config_file_path() else {
        return NodeConfigFile::default();
    };

    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
///
/// Missing or unparsable files yield defaults.
pub fn load_config_file_from(path: &Path) -> NodeConfigFile {
    if !path.exists() {
        return NodeConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                NodeConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            NodeConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/wakenode/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("wakenode").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let fc = load_config_file_from(Path::new("/nonexistent/wakenode.toml"));
        assert!(fc.node.name.is_none());
        assert!(fc.detector.sensitivity.is_none());
    }

    #[test]
    fn partial_file_overlays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[node]\nname = \"kitchen\"\n\n[detector]\nsensitivity = 0.8\ntrigger_level = 4\n",
        )
        .unwrap();

        let fc = load_config_file_from(&path);
        assert_eq!(fc.node.name.as_deref(), Some("kitchen"));
        assert_eq!(fc.detector.sensitivity, Some(0.8));
        assert_eq!(fc.detector.trigger_level, Some(4));
        assert!(fc.peers.port.is_none());
    }

    #[test]
    fn invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[detector\nsensitivity = ").unwrap();

        let fc = load_config_file_from(&path);
        assert!(fc.detector.sensitivity.is_none());
    }
}
