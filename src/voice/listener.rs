//! The capture loop
//!
//! Runs on a dedicated thread so frame cadence never waits on network I/O.
//! Each iteration drains control requests, checks endpoint deadlines, then
//! reads one frame and routes it through the trigger detector and the
//! phrase state machine unless listening is muted. Everything the loop
//! produces leaves as a [`ListenerEvent`] on a channel to the node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use super::capture::FrameSource;
use super::frame::AudioFrame;
use super::model::{VoiceActivityModel, WakeWordModel, keyword_score};
use super::mute::MuteState;
use super::phrase::{ActivationSource, ListenerEvent, PhraseStateMachine};
use super::trigger::TriggerDetector;
use crate::config::Config;
use crate::{Error, Result};

/// How long one read waits before deadlines are checked again
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Requests from the node to the capture thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    /// Start listening without the wake word
    WakeUp {
        /// Window for speech to begin
        false_start: Duration,
    },
}

/// Cloneable sender of control requests
#[derive(Debug, Clone)]
pub struct ListenerController {
    control: Sender<ListenerControl>,
}

impl ListenerController {
    /// A controller paired with the receiver a custom loop passes to
    /// [`Listener::run`]
    #[must_use]
    pub fn channel() -> (Self, Receiver<ListenerControl>) {
        let (tx, rx) = mpsc::channel();
        (Self { control: tx }, rx)
    }

    /// Force an activation with a caller-supplied false-start window
    ///
    /// # Errors
    ///
    /// Returns error if the capture thread has exited
    pub fn wake_up(&self, false_start: Duration) -> Result<()> {
        self.control
            .send(ListenerControl::WakeUp { false_start })
            .map_err(|_| Error::Channel("capture thread is gone".to_string()))
    }
}

/// Owner's handle on a running capture thread
pub struct ListenerHandle {
    controller: ListenerController,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ListenerHandle {
    /// A sender for control requests
    #[must_use]
    pub fn controller(&self) -> ListenerController {
        self.controller.clone()
    }

    /// Whether the capture thread is still looping
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the loop to stop and join the thread
    ///
    /// # Errors
    ///
    /// Returns the error that ended the loop, if any
    pub fn stop(mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        let result = thread
            .join()
            .map_err(|_| Error::Audio("capture thread panicked".to_string()))?;
        tracing::debug!("capture thread joined");
        result
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Wake word detection and endpointing over a frame stream
pub struct Listener {
    keyword: String,
    detector: TriggerDetector,
    phrase: PhraseStateMachine,
    wake_model: Box<dyn WakeWordModel>,
    vad: Box<dyn VoiceActivityModel>,
    mute: Arc<MuteState>,
    events: UnboundedSender<ListenerEvent>,
    max_read_errors: u32,
    model_errors: u64,
}

impl Listener {
    /// Assemble a listener from configuration and scoring models
    #[must_use]
    pub fn new(
        config: &Config,
        wake_model: Box<dyn WakeWordModel>,
        vad: Box<dyn VoiceActivityModel>,
        mute: Arc<MuteState>,
        events: UnboundedSender<ListenerEvent>,
    ) -> Self {
        Self {
            keyword: config.detector.wake_word.clone(),
            detector: TriggerDetector::new(
                config.audio.chunk_size,
                config.detector.sensitivity,
                config.detector.trigger_level,
            ),
            phrase: PhraseStateMachine::new(config.listen.clone()),
            wake_model,
            vad,
            mute,
            events,
            max_read_errors: config.audio.max_read_errors,
            model_errors: 0,
        }
    }

    /// Whether an utterance is in progress
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phrase.is_active()
    }

    /// Score one unmuted frame and advance the state machine
    ///
    /// # Errors
    ///
    /// Returns error if the event receiver is gone
    pub fn handle_frame(&mut self, frame: &AudioFrame, now: Instant) -> Result<()> {
        let score = self.wake_score(frame);

        if self.detector.update(score) {
            tracing::info!(keyword = %self.keyword, score, "wake word detected");
            match self.phrase.activate(ActivationSource::Keyword, None, now) {
                Some(event) => self.emit(event)?,
                None => tracing::debug!("already listening, activation ignored"),
            }
        }

        if self.phrase.is_active() {
            let vad = self.vad_probability(frame);
            if let Some(event) = self.phrase.listen(frame, vad, now) {
                self.emit(event)?;
            }
        }

        Ok(())
    }

    /// Apply a control request
    ///
    /// # Errors
    ///
    /// Returns error if the event receiver is gone
    pub fn handle_control(&mut self, control: ListenerControl, now: Instant) -> Result<()> {
        match control {
            ListenerControl::WakeUp { false_start } => {
                tracing::info!(false_start_ms = millis(false_start), "remote wake up");
                if let Some(event) = self.phrase.activate(ActivationSource::Remote, Some(false_start), now) {
                    self.emit(event)?;
                }
            }
        }
        Ok(())
    }

    /// Fire any elapsed endpoint deadline
    ///
    /// # Errors
    ///
    /// Returns error if the event receiver is gone
    pub fn poll_deadlines(&mut self, now: Instant) -> Result<()> {
        if let Some(event) = self.phrase.poll(now) {
            self.emit(event)?;
        }
        Ok(())
    }

    /// Run the loop on a dedicated thread
    ///
    /// `open` builds the frame source on the new thread, which lets it own
    /// device handles that cannot cross threads.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn spawn<F>(self, open: F) -> Result<ListenerHandle>
    where
        F: FnOnce() -> Result<Box<dyn FrameSource>> + Send + 'static,
    {
        let (controller, rx) = ListenerController::channel();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let thread = std::thread::Builder::new()
            .name("wakenode-capture".to_string())
            .spawn(move || {
                let mut listener = self;
                let result = open().and_then(|mut source| listener.run(source.as_mut(), &rx, &flag));
                flag.store(false, Ordering::Release);

                if let Err(e) = &result {
                    tracing::error!(error = %e, "capture loop stopped");
                }
                result
            })?;

        Ok(ListenerHandle {
            controller,
            running,
            thread: Some(thread),
        })
    }

    /// Loop until `running` clears or a fatal error occurs
    ///
    /// Pending deadlines are disarmed on exit.
    ///
    /// # Errors
    ///
    /// Returns error on device failure, too many consecutive read errors,
    /// or a closed event receiver
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        control: &Receiver<ListenerControl>,
        running: &AtomicBool,
    ) -> Result<()> {
        tracing::info!(keyword = %self.keyword, "listening for wake word");
        let result = self.run_inner(source, control, running);
        self.phrase.shutdown();
        result
    }

    fn run_inner(
        &mut self,
        source: &mut dyn FrameSource,
        control: &Receiver<ListenerControl>,
        running: &AtomicBool,
    ) -> Result<()> {
        let mut read_errors: u32 = 0;

        while running.load(Ordering::Acquire) {
            let now = Instant::now();
            loop {
                match control.try_recv() {
                    Ok(request) => self.handle_control(request, now)?,
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
            self.poll_deadlines(now)?;

            match source.read_frame(READ_TIMEOUT) {
                Ok(Some(frame)) => {
                    read_errors = 0;
                    if self.mute.is_muted() {
                        continue;
                    }
                    self.handle_frame(&frame, Instant::now())?;
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    read_errors += 1;
                    tracing::warn!(error = %e, consecutive = read_errors, "frame read failed");
                    if read_errors > self.max_read_errors {
                        return Err(Error::Audio(format!(
                            "{read_errors} consecutive read failures, last: {e}"
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!("capture loop stopping");
        Ok(())
    }

    fn wake_score(&mut self, frame: &AudioFrame) -> f32 {
        match self.wake_model.predict(frame) {
            Ok(predictions) => keyword_score(&predictions, &self.keyword),
            Err(e) => {
                self.note_model_error(&e);
                0.0
            }
        }
    }

    fn vad_probability(&mut self, frame: &AudioFrame) -> f32 {
        match self.vad.probability(frame) {
            Ok(p) if p.is_finite() => p.clamp(0.0, 1.0),
            Ok(_) => 0.0,
            Err(e) => {
                self.note_model_error(&e);
                0.0
            }
        }
    }

    /// Log the first model failure and then every 500th
    fn note_model_error(&mut self, error: &Error) {
        if self.model_errors % 500 == 0 {
            tracing::warn!(error = %error, total = self.model_errors + 1, "model failed, scoring frame as zero");
        }
        self.model_errors += 1;
    }

    fn emit(&self, event: ListenerEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| Error::Channel("listener event receiver closed".to_string()))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
