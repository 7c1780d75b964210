//! Node - the single dispatch point
//!
//! Bridges the capture thread, the command channel to the router and the
//! peer coordinator. Everything that reacts to an event runs here, on the
//! async runtime, so the capture thread never blocks on the network.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::peers::{self, MuteAction, MutePublisher, PeerRequest};
use crate::router::{Command, CommandChannel, OutboundCommand, RouterDirective, RouterLink};
use crate::voice::{
    ActivationSource, AudioCapture, EnergyVad, FeedbackSounds, FrameSource, Listener,
    ListenerController, ListenerEvent, MuteState, NullWakeModel, PlaybackEvent, PlaybackQueue,
    SidecarWakeModel, WakeWordModel,
};
use crate::{Config, Error, Result};

/// Reacts to listener events, router directives and peer requests
pub struct Dispatcher {
    commands: CommandChannel,
    listener: ListenerController,
    mute: Arc<MuteState>,
    mute_timeout: Option<Duration>,
    publisher: Option<MutePublisher>,
    playback: Option<PlaybackQueue>,
    sounds: FeedbackSounds,
    /// An utterance is being captured; peers stay muted until it ends
    capturing: AtomicBool,
}

impl Dispatcher {
    /// Dispatcher with no peers and no audio output
    #[must_use]
    pub fn new(
        commands: CommandChannel,
        listener: ListenerController,
        mute: Arc<MuteState>,
        mute_timeout: Option<Duration>,
    ) -> Self {
        Self {
            commands,
            listener,
            mute,
            mute_timeout,
            publisher: None,
            playback: None,
            sounds: FeedbackSounds::default(),
            capturing: AtomicBool::new(false),
        }
    }

    /// Announce activations and finishes to peers
    #[must_use]
    pub fn with_publisher(mut self, publisher: MutePublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Play router speech and feedback sounds through `playback`
    #[must_use]
    pub fn with_playback(mut self, playback: PlaybackQueue, sounds: FeedbackSounds) -> Self {
        self.playback = Some(playback);
        self.sounds = sounds;
        self
    }

    /// Forward a capture event to the router and to peers
    ///
    /// Peers are asked to mute before the router hears about the utterance
    /// and to unmute after it has been closed, unless speech is still
    /// playing.
    ///
    /// # Errors
    ///
    /// Returns error if the command channel has stopped
    pub fn on_listener_event(&self, event: ListenerEvent) -> Result<()> {
        match event {
            ListenerEvent::Activated { source } => {
                tracing::info!(?source, "utterance started");
                self.capturing.store(true, Ordering::Release);
                self.publish(MuteAction::Mute);
                if source == ActivationSource::Keyword {
                    self.commands.send(OutboundCommand::bare(Command::StartSpeak))?;
                    self.play_sound(self.sounds.click.as_ref());
                }
            }
            ListenerEvent::Chunk(pcm) => {
                self.commands
                    .send(OutboundCommand::with_payload(Command::Continue, pcm))?;
            }
            ListenerEvent::Finished {
                speech_detected,
                utterance,
            } => {
                let command = if speech_detected {
                    Command::Finish
                } else {
                    Command::Cancel
                };
                tracing::info!(
                    %command,
                    bytes = utterance.as_ref().map_or(0, Vec::len),
                    "utterance ended"
                );
                self.commands.send(OutboundCommand::bare(command))?;
                self.capturing.store(false, Ordering::Release);
                self.release_peers();
            }
        }
        Ok(())
    }

    /// Act on a directive from the router
    ///
    /// # Errors
    ///
    /// Returns error if the capture thread has exited
    pub fn on_directive(&self, directive: RouterDirective) -> Result<()> {
        match directive {
            RouterDirective::Speak { audio } => {
                if audio.is_empty() {
                    tracing::debug!("empty speech payload");
                } else if let Some(playback) = &self.playback {
                    tracing::debug!(bytes = audio.len(), "queueing speech");
                    self.publish(MuteAction::Mute);
                    if let Err(e) = playback.speak(audio) {
                        tracing::warn!(error = %e, "speech dropped");
                        self.release_peers();
                    }
                } else {
                    tracing::debug!(bytes = audio.len(), "no audio output, speech dropped");
                }
            }
            RouterDirective::InitConversation => {
                tracing::debug!("conversation started");
                self.play_sound(self.sounds.init.as_ref());
            }
            RouterDirective::WakeUp { wait_timeout } => {
                tracing::info!(?wait_timeout, "router requested wake up");
                self.listener.wake_up(wait_timeout)?;
            }
            RouterDirective::Other { tag, params } => {
                tracing::debug!(%tag, ?params, "ignoring router message");
            }
        }
        Ok(())
    }

    /// React to the playback worker
    pub fn on_playback_event(&self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::SpeechDrained => {
                tracing::debug!("speech playback finished");
                self.release_peers();
            }
        }
    }

    /// Mute or unmute listening at a peer's request
    pub fn on_peer_request(&self, request: &PeerRequest) {
        match request.action {
            MuteAction::Mute => {
                if self.mute.mute(self.mute_timeout) {
                    tracing::info!(peer = %request.peer, "muted by peer");
                }
            }
            MuteAction::Unmute => {
                if self.mute.unmute() {
                    tracing::info!(peer = %request.peer, "unmuted by peer");
                }
            }
        }
    }

    /// Unmute peers once neither capture nor speech needs them quiet
    fn release_peers(&self) {
        if !self.capturing.load(Ordering::Acquire) && !self.is_speaking() {
            self.publish(MuteAction::Unmute);
        }
    }

    fn is_speaking(&self) -> bool {
        self.playback.as_ref().is_some_and(PlaybackQueue::is_speaking)
    }

    fn publish(&self, action: MuteAction) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(action);
        }
    }

    fn play_sound(&self, sound: Option<&std::path::PathBuf>) {
        let (Some(playback), Some(path)) = (&self.playback, sound) else {
            return;
        };
        if let Err(e) = playback.play_file(path.clone()) {
            tracing::warn!(error = %e, "feedback sound dropped");
        }
    }
}

/// A running voice front end
pub struct Node {
    config: Config,
}

impl Node {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C or a fatal error
    ///
    /// # Errors
    ///
    /// Returns error if a component fails to start or fails fatally
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves or a fatal error occurs
    ///
    /// # Errors
    ///
    /// Returns error if a component fails to start or fails fatally
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let config = self.config;
        let cancel = CancellationToken::new();
        let mute = Arc::new(MuteState::new());

        tracing::info!(
            name = %config.name,
            router = %config.router_address,
            wake_word = %config.detector.wake_word,
            peers = config.peers.enabled,
            "starting node"
        );

        let sounds = FeedbackSounds::from_dir(config.sounds_dir.as_deref());
        let (playback, mut playback_events) =
            PlaybackQueue::spawn(Arc::clone(&mute), config.peers.self_mute_during_playback)?;
        if let Some(boot) = &sounds.boot {
            playback.play_file(boot.clone())?;
        }

        let (directive_tx, mut directives) = mpsc::unbounded_channel();
        let link = RouterLink {
            address: config.router_address.clone(),
            identity: config.name.clone(),
            policy: config.reconnect.clone(),
        };
        let (commands, mut router_task) = link.spawn(directive_tx, cancel.clone());

        let (publisher, mut peer_requests, mut peer_task) = if config.peers.enabled {
            let links = peers::start(&config.peers, &config.name, config.reconnect.clone(), cancel.clone())
                .await?;
            (Some(links.publisher), Some(links.requests), Some(links.task))
        } else {
            tracing::info!("peer coordination disabled");
            (None, None, None)
        };

        let wake_model = wake_model(&config)?;
        let vad = Box::new(EnergyVad::new(config.detector.vad_floor, config.detector.vad_ceiling));
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let listener = Listener::new(&config, wake_model, vad, Arc::clone(&mute), event_tx);
        let audio = config.audio.clone();
        let capture = listener.spawn(move || {
            let source: Box<dyn FrameSource> = Box::new(AudioCapture::open(&audio)?);
            Ok(source)
        })?;

        let mut dispatcher = Dispatcher::new(
            commands,
            capture.controller(),
            Arc::clone(&mute),
            config.peers.mute_timeout,
        )
        .with_playback(playback, sounds);
        if let Some(publisher) = publisher {
            dispatcher = dispatcher.with_publisher(publisher);
        }

        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!("capture loop exited");
                        break Ok(());
                    };
                    if let Err(e) = dispatcher.on_listener_event(event) {
                        break Err(e);
                    }
                }
                Some(directive) = directives.recv() => {
                    if let Err(e) = dispatcher.on_directive(directive) {
                        break Err(e);
                    }
                }
                Some(event) = playback_events.recv() => {
                    dispatcher.on_playback_event(event);
                }
                Some(request) = next_request(&mut peer_requests) => {
                    dispatcher.on_peer_request(&request);
                }
                r = &mut router_task => break joined("command channel", r),
                r = next_exit(&mut peer_task) => break joined("peer coordinator", r),
            }
        };

        cancel.cancel();
        router_task.abort();
        if let Some(task) = peer_task {
            task.abort();
        }

        let stopped = tokio::task::spawn_blocking(move || capture.stop())
            .await
            .map_err(|e| Error::Audio(format!("capture shutdown failed: {e}")))
            .and_then(|r| r);

        tracing::info!("node stopped");
        result.and(stopped)
    }
}

/// Resolve on Ctrl-C; never resolves if the handler cannot be installed
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// The scorer gets one frame's duration to answer each frame
fn wake_model(config: &Config) -> Result<Box<dyn WakeWordModel>> {
    match &config.detector.model_command {
        Some(command) => {
            tracing::info!(%command, "starting wake word scorer");
            Ok(Box::new(SidecarWakeModel::spawn(command, config.frame_duration())?))
        }
        None => {
            tracing::warn!("no wake word model configured, only router wake ups will activate");
            Ok(Box::new(NullWakeModel))
        }
    }
}

async fn next_request(rx: &mut Option<mpsc::UnboundedReceiver<PeerRequest>>) -> Option<PeerRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_exit(
    task: &mut Option<JoinHandle<Result<()>>>,
) -> std::result::Result<Result<()>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

fn joined(name: &str, r: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match r {
        Ok(Ok(())) => {
            tracing::info!(task = name, "task finished");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(e) => Err(Error::Channel(format!("{name} task failed: {e}"))),
    }
}
