use std::sync::Arc;

use hearth_agent::{GameConfig, GameSupervisor, LifecycleHooks, PathValidator, StatusProbe};
use hearth_process::ProcessStatus;

use crate::{
    auth::TokenService, console::ConsoleHub, pipeline::MessageAuthorizationPipeline,
    sessions::SessionRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: GameSupervisor,
    pub console: ConsoleHub,
    pub sessions: SessionRegistry,
    pub pipeline: MessageAuthorizationPipeline,
    pub tokens: Arc<dyn TokenService>,
    pub probe: Arc<StatusProbe>,
    pub allowed_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn build(game: GameConfig, tokens: Arc<dyn TokenService>, allowed_origins: Vec<String>) -> Self {
        let console = ConsoleHub::new(game.history_max_lines);
        let supervisor = GameSupervisor::new(game.supervisor, console_hooks(&console));
        Self::assemble(supervisor, console, game.status, tokens, allowed_origins)
    }

    pub fn with_path_validator(
        game: GameConfig,
        tokens: Arc<dyn TokenService>,
        allowed_origins: Vec<String>,
        paths: Arc<dyn PathValidator>,
    ) -> Self {
        let console = ConsoleHub::new(game.history_max_lines);
        let supervisor = GameSupervisor::with_path_validator(game.supervisor, console_hooks(&console), paths);
        Self::assemble(supervisor, console, game.status, tokens, allowed_origins)
    }

    fn assemble(
        supervisor: GameSupervisor,
        console: ConsoleHub,
        status: hearth_agent::config::StatusProbeConfig,
        tokens: Arc<dyn TokenService>,
        allowed_origins: Vec<String>,
    ) -> Self {
        let pipeline =
            MessageAuthorizationPipeline::new(Arc::new(supervisor.clone()), tokens.clone(), console.clone());
        Self {
            sessions: SessionRegistry::new(tokens.clone()),
            probe: Arc::new(StatusProbe::new(status)),
            allowed_origins: Arc::new(allowed_origins),
            supervisor,
            console,
            pipeline,
            tokens,
        }
    }
}

/// Routes game output and lifecycle changes into the console hub.
pub fn console_hooks(console: &ConsoleHub) -> LifecycleHooks {
    let lifecycle = |status: ProcessStatus| {
        let console = console.clone();
        move || console.publish_lifecycle(status)
    };
    LifecycleHooks::builder()
        .on_process_started(lifecycle(ProcessStatus::Starting))
        .on_game_ready(lifecycle(ProcessStatus::Up))
        .on_game_stopping(lifecycle(ProcessStatus::Stopping))
        .on_process_exited({
            let console = console.clone();
            move |code| {
                tracing::info!(?code, "game process exited");
                console.publish_lifecycle(ProcessStatus::Down);
            }
        })
        .on_input_line({
            let console = console.clone();
            move |line| console.publish_game_line(line)
        })
        .build()
}
