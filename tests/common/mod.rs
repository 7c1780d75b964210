//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use wakenode::config::{AudioConfig, DetectorConfig, ListenConfig, PeersConfig};
use wakenode::router::RetryPolicy;
use wakenode::router::codec::read_multipart;
use wakenode::voice::{AudioFrame, FrameSource, Predictions, VoiceActivityModel, WakeWordModel};
use wakenode::{Config, Error, Result};

/// Keyword name the scripted model reports under
pub const KEYWORD: &str = "hey_test";

/// Samples per test frame
pub const CHUNK: usize = 320;

/// Configuration with short endpoint windows and peers disabled
#[must_use]
pub fn test_config() -> Config {
    Config {
        name: "test-node".to_string(),
        router_address: "127.0.0.1:1".to_string(),
        audio: AudioConfig {
            chunk_size: CHUNK,
            max_read_errors: 3,
            ..AudioConfig::default()
        },
        detector: DetectorConfig {
            wake_word: KEYWORD.to_string(),
            ..DetectorConfig::default()
        },
        listen: ListenConfig {
            false_start: Duration::from_millis(200),
            silence: Duration::from_millis(100),
            ..ListenConfig::default()
        },
        peers: PeersConfig {
            enabled: false,
            ..PeersConfig::default()
        },
        reconnect: fast_retry(),
        sounds_dir: None,
    }
}

/// Retry policy that gives up quickly
#[must_use]
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

/// A frame of constant non-zero samples
#[must_use]
pub fn tone_frame(value: i16) -> AudioFrame {
    AudioFrame::new(vec![value; CHUNK])
}

/// Wake model replaying fixed scores, then zero
pub struct ScriptedWakeModel {
    scores: VecDeque<f32>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedWakeModel {
    pub fn new(scores: &[f32]) -> Self {
        Self {
            scores: scores.iter().copied().collect(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of `predict` calls, readable after the model is boxed
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl WakeWordModel for ScriptedWakeModel {
    fn predict(&mut self, _frame: &AudioFrame) -> Result<Predictions> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let score = self.scores.pop_front().unwrap_or(0.0);
        Ok(Predictions::from([(KEYWORD.to_string(), score)]))
    }
}

/// VAD replaying fixed probabilities, then `rest`
pub struct ScriptedVad {
    probabilities: VecDeque<f32>,
    rest: f32,
}

impl ScriptedVad {
    pub fn new(probabilities: &[f32], rest: f32) -> Self {
        Self {
            probabilities: probabilities.iter().copied().collect(),
            rest,
        }
    }
}

impl VoiceActivityModel for ScriptedVad {
    fn probability(&mut self, _frame: &AudioFrame) -> Result<f32> {
        Ok(self.probabilities.pop_front().unwrap_or(self.rest))
    }
}

/// One step of a scripted frame source
pub enum Step {
    Frame(AudioFrame),
    Glitch,
    DeviceLost,
}

/// Frame source replaying steps, then reporting no data
pub struct ScriptedSource {
    steps: VecDeque<Step>,
}

impl ScriptedSource {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    /// A source that never produces a frame
    pub fn idle() -> Self {
        Self::new([])
    }
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>> {
        match self.steps.pop_front() {
            Some(Step::Frame(frame)) => Ok(Some(frame)),
            Some(Step::Glitch) => Err(Error::AudioRead("input overflow".to_string())),
            Some(Step::DeviceLost) => Err(Error::Audio("device lost".to_string())),
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                Ok(None)
            }
        }
    }
}

/// A listener on an ephemeral local port
pub async fn local_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Read one message and return its parts as UTF-8 (lossy)
pub async fn read_text(stream: &mut TcpStream) -> Vec<String> {
    let parts = tokio::time::timeout(Duration::from_secs(5), read_multipart(stream))
        .await
        .expect("timed out waiting for a message")
        .unwrap()
        .expect("stream closed");
    parts
        .iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}
