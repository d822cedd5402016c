use crate::error::{StreamError, StreamResult};
use crate::models::VideoId;
use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Starting,
    Live,
    Stopping,
    Error,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Idle => "idle",
            StreamStatus::Starting => "starting",
            StreamStatus::Live => "live",
            StreamStatus::Stopping => "stopping",
            StreamStatus::Error => "error",
        }
    }

    /// Whether an encoder may be running in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StreamStatus::Starting | StreamStatus::Live | StreamStatus::Stopping
        )
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the session transition function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// A new encoder is being launched for `video_id`.
    Launch { video_id: VideoId },
    /// The active encoder survived its startup probe.
    ConfirmLive,
    /// An explicit stop was requested.
    BeginStop,
    /// No encoder is running any more; `note` records why, if noteworthy.
    Settle { note: Option<String> },
    /// The session failed and needs acknowledgement or a fresh start.
    Fail { message: String },
    /// Operator selection of the video to play.
    Select { video_id: VideoId },
    /// A queued selection could not be launched and is given up.
    Unqueue { video_id: VideoId },
    SetLoop { enabled: bool },
}

/// The authoritative stream session. Only [`SessionState::apply`] mutates it.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SessionState {
    status: StreamStatus,
    current_video_id: Option<VideoId>,
    queued_video_id: Option<VideoId>,
    loop_enabled: bool,
    last_error: Option<String>,
}

impl SessionState {
    pub fn new(loop_enabled: bool) -> Self {
        Self {
            status: StreamStatus::Idle,
            current_video_id: None,
            queued_video_id: None,
            loop_enabled,
            last_error: None,
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn current_video_id(&self) -> Option<VideoId> {
        self.current_video_id
    }

    /// Selection made while streaming, played on the next advance or restart.
    pub fn queued_video_id(&self) -> Option<VideoId> {
        self.queued_video_id
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn apply(&mut self, transition: Transition) -> StreamResult<()> {
        use StreamStatus::*;

        match (self.status, transition) {
            (Idle | Error | Starting | Live, Transition::Launch { video_id }) => {
                self.status = Starting;
                self.current_video_id = Some(video_id);
                if self.queued_video_id == Some(video_id) {
                    self.queued_video_id = None;
                }
                self.last_error = None;
            }
            (Starting, Transition::ConfirmLive) => self.status = Live,
            (Starting | Live, Transition::BeginStop) => self.status = Stopping,
            (_, Transition::Settle { note }) => {
                self.status = Idle;
                if note.is_some() {
                    self.last_error = note;
                }
            }
            (Starting | Live | Stopping, Transition::Fail { message }) => {
                self.status = Error;
                self.last_error = Some(message);
            }
            (status, Transition::Select { video_id }) => {
                if status.is_active() {
                    self.queued_video_id = Some(video_id);
                } else {
                    self.current_video_id = Some(video_id);
                    self.queued_video_id = None;
                }
            }
            (_, Transition::Unqueue { video_id }) => {
                if self.queued_video_id == Some(video_id) {
                    self.queued_video_id = None;
                }
            }
            (_, Transition::SetLoop { enabled }) => self.loop_enabled = enabled,
            (from, transition) => {
                return Err(StreamError::InvalidTransition {
                    from: from.as_str(),
                    action: transition.action(),
                });
            }
        }

        Ok(())
    }
}

impl Transition {
    fn action(&self) -> &'static str {
        match self {
            Transition::Launch { .. } => "launch",
            Transition::ConfirmLive => "confirm live",
            Transition::BeginStop => "stop",
            Transition::Settle { .. } => "settle",
            Transition::Fail { .. } => "fail",
            Transition::Select { .. } => "select",
            Transition::Unqueue { .. } => "unqueue",
            Transition::SetLoop { .. } => "set loop",
        }
    }
}
