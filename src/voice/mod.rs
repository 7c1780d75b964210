//! Voice processing module
//!
//! Frame capture, wake word debouncing, utterance endpointing, listening
//! mute and playback. The capture loop in [`listener`] ties the pieces
//! together on its own thread.

mod capture;
mod frame;
mod listener;
mod model;
mod mute;
mod phrase;
mod playback;
mod trigger;

pub use capture::{AudioCapture, FrameSource, InputDeviceInfo, SAMPLE_RATE, list_input_devices};
pub use frame::{AudioFrame, f32_to_i16};
pub use listener::{Listener, ListenerControl, ListenerController, ListenerHandle};
pub use model::{
    EnergyVad, NullWakeModel, Predictions, SidecarWakeModel, VoiceActivityModel, WakeWordModel,
    keyword_score, parse_predictions,
};
pub use mute::MuteState;
pub use phrase::{ActivationSource, Deadline, ListenerEvent, PhraseState, PhraseStateMachine};
pub use playback::{
    AudioPlayback, FeedbackSounds, PlaybackEvent, PlaybackQueue, SPEECH_SAMPLE_RATE, decode_file, decode_mp3,
    decode_wav, pcm16_to_f32, resample,
};
pub use trigger::TriggerDetector;
