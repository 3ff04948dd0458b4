//! Hosts the game process: lifecycle supervision, console plumbing, output
//! history and the status probe.

pub mod config;
pub mod console_io;
pub mod history;
pub mod hooks;
pub mod status_protocol;
pub mod supervisor;

pub use config::GameConfig;
pub use history::OutputHistory;
pub use hooks::LifecycleHooks;
pub use status_protocol::{GameStatus, StatusProbe};
pub use supervisor::{GameSupervisor, PathValidator, SupervisorError};
