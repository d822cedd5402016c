pub mod command;
pub mod engine;
pub mod scheduler;
pub mod session;
pub mod supervisor;

// Re-export public types and functions
pub use command::{EncoderCommand, build_command, destination_url};
pub use engine::{EngineSettings, SessionSnapshot, StreamEngine};
pub use scheduler::{ExitContext, LoopScheduler, NextAction, next_video};
pub use session::{SessionState, StreamStatus, Transition};
pub use supervisor::{
    EngineEvent, ExitEvent, ExitReason, ProbeReport, ProcessId, ProcessSupervisor, StderrTail,
    probe_encoder,
};
