use crate::config::Config;
use crate::error::{StreamError, StreamResult};
use crate::models::{Video, VideoId};
use crate::store::Store;
use crate::stream::command::build_command;
use crate::stream::scheduler::{ExitContext, LoopScheduler, NextAction};
use crate::stream::session::{SessionState, StreamStatus, Transition};
use crate::stream::supervisor::{EngineEvent, ExitEvent, ExitReason, ProcessSupervisor};
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedReceiver, unbounded};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, watch};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub ffmpeg_path: String,
    pub grace_timeout: Duration,
    pub startup_probe: Duration,
    pub failure_threshold: u32,
    pub stderr_tail_bytes: usize,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            grace_timeout: config.grace_timeout(),
            startup_probe: config.startup_probe(),
            failure_threshold: config.failure_threshold,
            stderr_tail_bytes: config.stderr_tail_bytes,
        }
    }
}

/// Read-only copy of the session as reported by `/api/stream-status`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: StreamStatus,
    pub current_video_id: Option<VideoId>,
    pub queued_video_id: Option<VideoId>,
    pub loop_playlist: bool,
    pub last_error: Option<String>,
}

impl From<&SessionState> for SessionSnapshot {
    fn from(session: &SessionState) -> Self {
        Self {
            status: session.status(),
            current_video_id: session.current_video_id(),
            queued_video_id: session.queued_video_id(),
            loop_playlist: session.loop_enabled(),
            last_error: session.last_error().map(str::to_string),
        }
    }
}

#[derive(Debug)]
struct EngineInner {
    session: SessionState,
    supervisor: ProcessSupervisor,
    scheduler: LoopScheduler,
}

/// The stream state machine.
///
/// Every transition, API intents and process events alike, runs while holding
/// the one engine lock. When the store is needed it is locked after the engine.
#[derive(Clone)]
pub struct StreamEngine {
    inner: Arc<TokioMutex<EngineInner>>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    store: Store,
    videos_dir: PathBuf,
    grace_timeout: Duration,
}

impl StreamEngine {
    pub async fn new(settings: EngineSettings, store: Store, videos_dir: PathBuf) -> Self {
        let (tx, rx) = unbounded();
        let session = SessionState::new(store.loop_enabled().await);
        let (snapshot, _) = watch::channel(SessionSnapshot::from(&session));

        info!(
            ffmpeg_path = %settings.ffmpeg_path,
            failure_threshold = settings.failure_threshold,
            loop_enabled = session.loop_enabled(),
            "Stream engine started"
        );

        let inner = EngineInner {
            session,
            supervisor: ProcessSupervisor::new(
                settings.ffmpeg_path,
                settings.startup_probe,
                settings.stderr_tail_bytes,
                tx,
            ),
            scheduler: LoopScheduler::new(settings.failure_threshold),
        };

        let this = Self {
            inner: Arc::new(TokioMutex::new(inner)),
            snapshot: Arc::new(snapshot),
            store,
            videos_dir,
            grace_timeout: settings.grace_timeout,
        };
        this.handle_events(rx);
        this
    }

    /// Latest session state. Never waits on the engine lock.
    pub fn status(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    fn publish(&self, session: &SessionState) {
        self.snapshot.send_replace(SessionSnapshot::from(session));
    }

    /// Starts streaming `video_id`, or the queued, current or first video.
    pub async fn request_start(&self, video_id: Option<VideoId>) -> StreamResult<SessionSnapshot> {
        let mut inner = self.inner.lock().await;
        if inner.session.status().is_active() {
            return Err(StreamError::AlreadyRunning);
        }

        let video = self.start_target(&inner.session, video_id).await?;
        inner.scheduler.reset();

        let result = self.launch(&mut inner, &video).await;
        if let Err(error) = &result
            && inner.session.status() == StreamStatus::Starting
        {
            _ = inner.session.apply(Transition::Fail {
                message: error.to_string(),
            });
        }
        self.publish(&inner.session);
        result?;

        info!(video_id = video.id, title = %video.title, "Stream starting");
        Ok(SessionSnapshot::from(&inner.session))
    }

    async fn start_target(
        &self,
        session: &SessionState,
        video_id: Option<VideoId>,
    ) -> StreamResult<Video> {
        if let Some(id) = video_id {
            return self
                .store
                .video(id)
                .await
                .ok_or(StreamError::VideoNotFound(id));
        }

        for id in [session.queued_video_id(), session.current_video_id()]
            .into_iter()
            .flatten()
        {
            if let Some(video) = self.store.video(id).await {
                return Ok(video);
            }
        }

        self.store
            .videos()
            .await
            .into_iter()
            .next()
            .ok_or(StreamError::NoVideoSelected)
    }

    /// Builds the command and spawns the encoder for `video`.
    ///
    /// Configuration and media errors leave the session untouched. A spawn
    /// failure leaves it `starting` with no process, for the caller to resolve.
    async fn launch(&self, inner: &mut EngineInner, video: &Video) -> StreamResult<()> {
        let source = self.videos_dir.join(&video.filename);
        let config = self.store.stream_config().await;
        let command = build_command(&config, &source)?;

        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(StreamError::MissingMedia(source));
        }

        inner.session.apply(Transition::Launch { video_id: video.id })?;
        let process_id = inner.supervisor.start(&command)?;
        debug!(video_id = video.id, process_id, "Encoder launched");
        Ok(())
    }

    /// Stops the stream. Always ends idle, whatever was running.
    pub async fn request_stop(&self) -> SessionSnapshot {
        let mut inner = self.inner.lock().await;
        if matches!(
            inner.session.status(),
            StreamStatus::Starting | StreamStatus::Live
        ) {
            _ = inner.session.apply(Transition::BeginStop);
            self.publish(&inner.session);
        }

        if let Err(error) = inner.supervisor.stop(self.grace_timeout).await {
            error!(%error, "Failed to stop encoder cleanly");
        }
        inner.scheduler.reset();
        _ = inner.session.apply(Transition::Settle { note: None });
        self.publish(&inner.session);

        info!("Stream stopped");
        SessionSnapshot::from(&inner.session)
    }

    /// Persists the loop flag and applies it to the running session.
    pub async fn set_loop(&self, enabled: bool) -> StreamResult<()> {
        let mut inner = self.inner.lock().await;
        self.store.set_loop_enabled(enabled).await?;
        inner.session.apply(Transition::SetLoop { enabled })?;
        self.publish(&inner.session);

        info!(enabled, "Loop playback updated");
        Ok(())
    }

    /// Persisted loop flag and the flag the running session uses.
    pub async fn loop_status(&self) -> (bool, bool) {
        let inner = self.inner.lock().await;
        let persisted = self.store.loop_enabled().await;
        (persisted, inner.session.loop_enabled())
    }

    /// Selects the video to play. While streaming it is queued for the next start.
    pub async fn set_current_video(&self, video_id: VideoId) -> StreamResult<SessionSnapshot> {
        let mut inner = self.inner.lock().await;
        if self.store.video(video_id).await.is_none() {
            return Err(StreamError::VideoNotFound(video_id));
        }

        inner.session.apply(Transition::Select { video_id })?;
        self.publish(&inner.session);

        info!(
            video_id,
            queued = inner.session.queued_video_id().is_some(),
            "Current video selected"
        );
        Ok(SessionSnapshot::from(&inner.session))
    }

    /// Removes a video unless it is the one on air.
    pub async fn remove_video(&self, video_id: VideoId) -> StreamResult<Video> {
        let inner = self.inner.lock().await;
        if inner.session.status().is_active() && inner.session.current_video_id() == Some(video_id)
        {
            return Err(StreamError::InvalidTransition {
                from: inner.session.status().as_str(),
                action: "delete the video on air",
            });
        }

        self.store
            .remove_video(video_id)
            .await?
            .ok_or(StreamError::VideoNotFound(video_id))
    }

    /// Stops any running encoder before the service exits.
    pub async fn shutdown(&self) {
        info!("Shutting down stream engine");
        self.request_stop().await;
    }

    fn handle_events(&self, rx: UnboundedReceiver<EngineEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(event) = rx.next().await {
                this.handle_event(event).await;
            }
            debug!("Engine event loop finished");
        });
    }

    async fn handle_event(&self, event: EngineEvent) {
        let mut inner = self.inner.lock().await;
        match event {
            EngineEvent::Started { process_id } => {
                if inner.supervisor.active_id() != Some(process_id) {
                    debug!(process_id, "Ignoring start of an inactive encoder");
                    return;
                }
                if inner.session.status() == StreamStatus::Starting {
                    _ = inner.session.apply(Transition::ConfirmLive);
                    inner.scheduler.confirm_live();
                    info!(
                        process_id,
                        video_id = ?inner.session.current_video_id(),
                        "Stream is live"
                    );
                }
            }
            EngineEvent::Exited(exit) => {
                if inner.supervisor.active_id() != Some(exit.process_id) {
                    debug!(process_id = exit.process_id, "Ignoring exit of a stopped encoder");
                    return;
                }
                inner.supervisor.release(exit.process_id);
                self.on_exit(&mut inner, exit).await;
            }
        }
        self.publish(&inner.session);
    }

    async fn on_exit(&self, inner: &mut EngineInner, exit: ExitEvent) {
        let immediate = inner.session.status() == StreamStatus::Starting;
        let loop_enabled = inner.session.loop_enabled();
        let playlist = if loop_enabled {
            self.store.videos().await
        } else {
            Vec::new()
        };

        let action = inner.scheduler.on_process_exited(&ExitContext {
            reason: exit.reason.clone(),
            immediate,
            loop_enabled,
            current_video_id: inner.session.current_video_id(),
            queued_video_id: inner.session.queued_video_id(),
            playlist: &playlist,
        });

        match (action, exit.reason) {
            (NextAction::Idle { .. }, ExitReason::Failed { code }) if !loop_enabled => {
                let error = StreamError::EncoderRuntime {
                    code,
                    stderr: exit.stderr_tail,
                };
                warn!(%error, "Stream failed");
                _ = inner.session.apply(Transition::Fail {
                    message: error.to_string(),
                });
            }
            (action, _) => self.follow(inner, action).await,
        }
    }

    /// Applies a scheduler decision, launching videos until one spawns or the
    /// scheduler gives up.
    async fn follow(&self, inner: &mut EngineInner, mut action: NextAction) {
        loop {
            let next = match action {
                NextAction::Idle { note } => {
                    info!(?note, "Stream settled");
                    _ = inner.session.apply(Transition::Settle { note });
                    return;
                }
                NextAction::Fault(message) => {
                    error!(%message, "Stream failed");
                    _ = inner.session.apply(Transition::Fail { message });
                    return;
                }
                NextAction::Advance(next) => next,
            };

            let launched = match self.store.video(next).await {
                Some(video) => self.launch(inner, &video).await,
                None => Err(StreamError::VideoNotFound(next)),
            };
            let Err(error) = launched else {
                info!(video_id = next, "Playlist advanced");
                return;
            };

            warn!(video_id = next, %error, "Failed to launch next video");
            // A selection that cannot launch is skipped, not retried
            _ = inner.session.apply(Transition::Unqueue { video_id: next });
            let playlist = self.store.videos().await;
            action = inner.scheduler.on_process_exited(&ExitContext {
                reason: ExitReason::Failed { code: None },
                immediate: true,
                loop_enabled: inner.session.loop_enabled(),
                current_video_id: Some(next),
                queued_video_id: inner.session.queued_video_id(),
                playlist: &playlist,
            });
        }
    }
}
