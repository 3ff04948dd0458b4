use std::sync::Arc;

use async_trait::async_trait;
use hearth_agent::{GameSupervisor, SupervisorError};
use hearth_process::ProcessStatus;

use crate::{
    auth::{AuthContext, COMMAND_CAPABILITY_PREFIX, TokenService},
    console::ConsoleHub,
    messages::{InboundMessage, ReplyMessage},
};

/// The slice of the supervisor the pipeline needs.
#[async_trait]
pub trait GameConsole: Send + Sync {
    fn status(&self) -> ProcessStatus;
    async fn send_line(&self, line: &str) -> Result<(), SupervisorError>;
}

#[async_trait]
impl GameConsole for GameSupervisor {
    fn status(&self) -> ProcessStatus {
        GameSupervisor::status(self)
    }

    async fn send_line(&self, line: &str) -> Result<(), SupervisorError> {
        GameSupervisor::send_line(self, line).await
    }
}

/// Why an inbound command was refused. Each maps to an error reply; the
/// session stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandRejection {
    #[error("Invalid message")]
    Validation,
    #[error("Cannot process message - game is not active")]
    NotActive,
    #[error("Access denied to command '{command}'")]
    AccessDenied { command: String },
    #[error("Game console is unavailable")]
    Unavailable,
}

impl CommandRejection {
    pub fn to_reply(&self) -> ReplyMessage {
        ReplyMessage::error(self.to_string())
    }
}

/// Non-empty and starting with a letter, or `/` followed by a letter.
pub fn is_well_formed(raw: &str) -> bool {
    let mut chars = raw.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => true,
        Some('/') => chars.next().is_some_and(|c| c.is_ascii_alphabetic()),
        _ => false,
    }
}

/// First whitespace-separated token, without a leading `/`, lowercased.
pub fn normalize_command(raw: &str) -> String {
    let head = raw.split_whitespace().next().unwrap_or_default();
    head.strip_prefix('/').unwrap_or(head).to_lowercase()
}

/// Exact match against `COMMAND_<name>`; the suffix is compared without case.
/// Holding `COMMAND_op` does not grant `open`.
pub fn is_authorized(auth: &AuthContext, command: &str) -> bool {
    auth.capabilities().iter().any(|cap| {
        cap.strip_prefix(COMMAND_CAPABILITY_PREFIX)
            .is_some_and(|name| name.eq_ignore_ascii_case(command))
    })
}

/// Gatekeeper between client sockets and the game console.
#[derive(Clone)]
pub struct MessageAuthorizationPipeline {
    game: Arc<dyn GameConsole>,
    tokens: Arc<dyn TokenService>,
    console: ConsoleHub,
}

impl MessageAuthorizationPipeline {
    pub fn new(game: Arc<dyn GameConsole>, tokens: Arc<dyn TokenService>, console: ConsoleHub) -> Self {
        Self {
            game,
            tokens,
            console,
        }
    }

    pub async fn handle_inbound(&self, auth: &AuthContext, msg: InboundMessage) -> Result<(), CommandRejection> {
        match msg {
            InboundMessage::Command { data } => self.handle_command(auth, &data).await,
            InboundMessage::Unknown => Err(CommandRejection::Validation),
        }
    }

    /// Validates, checks the game is up, authorizes, then forwards `raw`
    /// verbatim to the game and echoes it to every subscriber.
    pub async fn handle_command(&self, auth: &AuthContext, raw: &str) -> Result<(), CommandRejection> {
        if !is_well_formed(raw) {
            return Err(CommandRejection::Validation);
        }
        if self.game.status() != ProcessStatus::Up {
            return Err(CommandRejection::NotActive);
        }

        let command = normalize_command(raw);
        if !is_authorized(auth, &command) {
            tracing::info!(principal = %auth.principal(), %command, "console command denied");
            return Err(CommandRejection::AccessDenied {
                command: raw.to_string(),
            });
        }

        if let Err(e) = self.game.send_line(raw).await {
            tracing::warn!(principal = %auth.principal(), %command, error = %e, "console command not delivered");
            return Err(CommandRejection::Unavailable);
        }
        tracing::info!(principal = %auth.principal(), %command, "console command accepted");
        self.console.publish_server_line(raw);
        Ok(())
    }

    /// Re-checks the bound token before a frame crosses the session boundary.
    /// An expired token strips the binding and returns `false`; the caller then
    /// drops the connection without replying.
    pub fn revalidate(&self, binding: &mut Option<AuthContext>) -> bool {
        let Some(auth) = binding.as_ref() else {
            return false;
        };
        if self.tokens.is_expired(auth.token()) {
            tracing::info!(principal = %auth.principal(), "access token expired; revoking console session");
            *binding = None;
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU8, Ordering},
    };

    use super::*;
    use crate::sessions::tests::FakeTokens;

    #[derive(Default)]
    struct FakeGame {
        status: AtomicU8,
        sent: Mutex<Vec<String>>,
        broken: bool,
    }

    impl FakeGame {
        fn up() -> Self {
            let g = Self::default();
            g.status.store(ProcessStatus::Up.as_u8(), Ordering::SeqCst);
            g
        }
    }

    #[async_trait]
    impl GameConsole for FakeGame {
        fn status(&self) -> ProcessStatus {
            ProcessStatus::from_u8(self.status.load(Ordering::SeqCst))
        }

        async fn send_line(&self, line: &str) -> Result<(), SupervisorError> {
            if self.broken {
                return Err(SupervisorError::NotRunning);
            }
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    fn pipeline(game: Arc<FakeGame>) -> (MessageAuthorizationPipeline, ConsoleHub, Arc<FakeTokens>) {
        let tokens = Arc::new(FakeTokens::default());
        let hub = ConsoleHub::new(100);
        (
            MessageAuthorizationPipeline::new(game, tokens.clone(), hub.clone()),
            hub,
            tokens,
        )
    }

    fn user(caps: &[&str]) -> AuthContext {
        AuthContext::new("alice", "alice-token", caps.iter().copied())
    }

    #[test]
    fn shape_check() {
        for ok in ["say hi", "/say hi", "List", "/Weather clear"] {
            assert!(is_well_formed(ok), "{ok}");
        }
        for bad in ["", " say", "1say", "/", "/1", "//say", "é"] {
            assert!(!is_well_formed(bad), "{bad:?}");
        }
    }

    #[test]
    fn normalization_examples() {
        assert_eq!(normalize_command("  /Say hello  "), "say");
        assert_eq!(normalize_command("wEather clear"), "weather");
        assert_eq!(normalize_command("/tp a b"), "tp");
        assert_eq!(normalize_command("list"), "list");
    }

    #[test]
    fn authorization_is_exact() {
        assert!(!is_authorized(&user(&[]), "say"));
        assert!(is_authorized(&user(&["COMMAND_say"]), "say"));
        assert!(is_authorized(&user(&["COMMAND_Weather"]), "weather"));
        assert!(!is_authorized(&user(&["COMMAND_op"]), "open"));
        assert!(!is_authorized(&user(&["ROLE_ADMIN"]), "say"));
    }

    #[tokio::test]
    async fn down_game_rejects_without_side_effects() {
        let game = Arc::new(FakeGame::default());
        let (p, hub, _) = pipeline(game.clone());

        let err = p.handle_command(&user(&["COMMAND_say"]), "say hi").await.unwrap_err();
        assert_eq!(err, CommandRejection::NotActive);
        assert!(game.sent.lock().unwrap().is_empty());
        assert!(hub.history().is_empty());
    }

    #[tokio::test]
    async fn shape_is_checked_before_liveness() {
        let (p, _, _) = pipeline(Arc::new(FakeGame::default()));
        let err = p.handle_command(&user(&["COMMAND_say"]), "").await.unwrap_err();
        assert_eq!(err, CommandRejection::Validation);
        assert_eq!(err.to_reply(), ReplyMessage::error("Invalid message"));
    }

    #[tokio::test]
    async fn denied_command_names_the_raw_input() {
        let game = Arc::new(FakeGame::up());
        let (p, hub, _) = pipeline(game.clone());

        let err = p.handle_command(&user(&["COMMAND_op"]), "/open sesame").await.unwrap_err();
        assert_eq!(
            err,
            CommandRejection::AccessDenied {
                command: "/open sesame".to_string()
            }
        );
        assert_eq!(err.to_string(), "Access denied to command '/open sesame'");
        assert!(game.sent.lock().unwrap().is_empty());
        assert!(hub.history().is_empty());
    }

    #[tokio::test]
    async fn accepted_command_is_forwarded_echoed_and_recorded() {
        let game = Arc::new(FakeGame::up());
        let (p, hub, _) = pipeline(game.clone());
        let mut rx = hub.subscribe();

        p.handle_inbound(
            &user(&["COMMAND_say"]),
            InboundMessage::Command {
                data: "/Say hello world".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(*game.sent.lock().unwrap(), vec!["/Say hello world"]);
        assert_eq!(hub.history().snapshot(), vec!["/Say hello world"]);
        let echo = rx.recv().await.unwrap();
        assert_eq!(echo.data, "/Say hello world");
    }

    #[tokio::test]
    async fn delivery_failure_is_reported() {
        let game = Arc::new(FakeGame {
            broken: true,
            ..FakeGame::up()
        });
        let (p, hub, _) = pipeline(game);
        let err = p.handle_command(&user(&["COMMAND_say"]), "say hi").await.unwrap_err();
        assert_eq!(err, CommandRejection::Unavailable);
        assert!(hub.history().is_empty());
    }

    #[tokio::test]
    async fn unknown_frames_are_invalid() {
        let (p, _, _) = pipeline(Arc::new(FakeGame::up()));
        let err = p.handle_inbound(&user(&[]), InboundMessage::Unknown).await.unwrap_err();
        assert_eq!(err, CommandRejection::Validation);
    }

    #[test]
    fn expired_token_strips_binding() {
        let (p, _, tokens) = pipeline(Arc::new(FakeGame::up()));
        let mut binding = Some(user(&["COMMAND_say"]));

        assert!(p.revalidate(&mut binding));
        assert!(binding.is_some());

        tokens.expire("alice-token");
        assert!(!p.revalidate(&mut binding));
        assert!(binding.is_none());
        assert!(!p.revalidate(&mut binding));
    }
}
