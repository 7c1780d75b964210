//! Outbound command tags and inbound router directives

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Handshake tag sent once per connection before any other traffic
pub const GREET: &str = "GREET";

/// Outbound command tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Wake word heard, an utterance is about to stream
    StartSpeak,
    /// One chunk of utterance audio
    Continue,
    /// Utterance ended after speech
    Finish,
    /// Activation ended without speech
    Cancel,
}

impl Command {
    /// Wire tag for this command
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartSpeak => "START_SPEAK",
            Self::Continue => "CONTINUE",
            Self::Finish => "FINISH",
            Self::Cancel => "CANCEL",
        }
    }

    /// Whether this command closes an utterance
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finish | Self::Cancel)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command queued for the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl OutboundCommand {
    /// Command with an empty payload
    #[must_use]
    pub const fn bare(command: Command) -> Self {
        Self {
            command,
            payload: Vec::new(),
        }
    }

    /// Command carrying raw audio bytes
    #[must_use]
    pub const fn with_payload(command: Command, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }
}

/// Parameters of a `WAKEUP` directive
#[derive(Debug, Deserialize)]
struct WakeupParams {
    /// Seconds to wait for speech before cancelling
    wait_timeout: f64,
}

/// Decoded inbound message from the router
#[derive(Debug, Clone, PartialEq)]
pub enum RouterDirective {
    /// Synthesized speech to play (16-bit mono PCM)
    Speak { audio: Vec<u8> },
    /// A conversation started; play the local chime
    InitConversation,
    /// Start listening without a wake word
    WakeUp { wait_timeout: Duration },
    /// Unrecognized tag, kept for logging
    Other {
        tag: String,
        params: Option<serde_json::Value>,
    },
}

impl RouterDirective {
    /// Decode a `[tag, params, audio]` message
    ///
    /// `params` is UTF-8 JSON when non-empty and treated as absent otherwise.
    ///
    /// # Errors
    ///
    /// Returns error if the message has the wrong shape or the params of a
    /// known tag are malformed
    pub fn decode(parts: Vec<Vec<u8>>) -> Result<Self> {
        let [tag, params, audio]: [Vec<u8>; 3] = parts.try_into().map_err(|p: Vec<Vec<u8>>| {
            Error::Protocol(format!("expected 3 parts from router, got {}", p.len()))
        })?;

        let tag = String::from_utf8(tag)
            .map_err(|_| Error::Protocol("router tag is not UTF-8".to_string()))?;

        let params: Option<serde_json::Value> = if params.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&params)?)
        };

        match tag.as_str() {
            "SPEAK" => Ok(Self::Speak { audio }),
            "INIT_CONVERSATION" => Ok(Self::InitConversation),
            "WAKEUP" => {
                let params = params
                    .ok_or_else(|| Error::Protocol("WAKEUP without params".to_string()))?;
                let WakeupParams { wait_timeout } = serde_json::from_value(params)?;
                let wait_timeout = Duration::try_from_secs_f64(wait_timeout).map_err(|_| {
                    Error::Protocol(format!("invalid wait_timeout {wait_timeout}"))
                })?;
                Ok(Self::WakeUp { wait_timeout })
            }
            _ => Ok(Self::Other { tag, params }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(tag: &str, params: &str, audio: &[u8]) -> Vec<Vec<u8>> {
        vec![tag.into(), params.into(), audio.to_vec()]
    }

    #[test]
    fn command_tags() {
        assert_eq!(Command::StartSpeak.as_str(), "START_SPEAK");
        assert_eq!(Command::Continue.to_string(), "CONTINUE");
        assert!(Command::Finish.is_terminal());
        assert!(Command::Cancel.is_terminal());
        assert!(!Command::Continue.is_terminal());
    }

    #[test]
    fn decodes_speak_with_audio() {
        let d = RouterDirective::decode(parts("SPEAK", "", &[1, 0, 2, 0])).unwrap();
        assert_eq!(d, RouterDirective::Speak { audio: vec![1, 0, 2, 0] });
    }

    #[test]
    fn decodes_wakeup_timeout() {
        let d = RouterDirective::decode(parts("WAKEUP", r#"{"wait_timeout": 2.5}"#, &[])).unwrap();
        assert_eq!(
            d,
            RouterDirective::WakeUp {
                wait_timeout: Duration::from_millis(2500)
            }
        );
    }

    #[test]
    fn wakeup_requires_params() {
        assert!(RouterDirective::decode(parts("WAKEUP", "", &[])).is_err());
        assert!(RouterDirective::decode(parts("WAKEUP", r#"{"wait_timeout": -1}"#, &[])).is_err());
    }

    #[test]
    fn unknown_tag_keeps_params() {
        let d = RouterDirective::decode(parts("STATUS", r#"{"ok": true}"#, &[])).unwrap();
        match d {
            RouterDirective::Other { tag, params } => {
                assert_eq!(tag, "STATUS");
                assert_eq!(params, Some(serde_json::json!({"ok": true})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_part_count_is_protocol_error() {
        let err = RouterDirective::decode(vec![b"SPEAK".to_vec()]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn malformed_params_rejected() {
        let err = RouterDirective::decode(parts("INIT_CONVERSATION", "{not json", &[])).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
