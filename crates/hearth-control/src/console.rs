use std::sync::Arc;

use hearth_agent::OutputHistory;
use hearth_process::ProcessStatus;
use tokio::sync::broadcast;

use crate::messages::{BroadcastKind, BroadcastMessage, ReplyMessage, Source};

const BROADCAST_CAPACITY: usize = 1024;

/// Fan-out point for console traffic: keeps the history ring and pushes every
/// line to subscribed sessions.
#[derive(Clone)]
pub struct ConsoleHub {
    history: Arc<OutputHistory>,
    tx: broadcast::Sender<BroadcastMessage>,
}

impl ConsoleHub {
    pub fn new(history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            history: Arc::new(OutputHistory::new(history_capacity)),
            tx,
        }
    }

    pub fn history(&self) -> &Arc<OutputHistory> {
        &self.history
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }

    pub fn history_reply(&self) -> ReplyMessage {
        ReplyMessage::history(&self.history.snapshot())
    }

    /// A line printed by the game.
    pub fn publish_game_line(&self, line: &str) {
        self.history.push(line);
        self.send(Source::Game, BroadcastKind::Log, line.to_string());
    }

    /// A command accepted from a client, echoed verbatim.
    pub fn publish_server_line(&self, line: &str) {
        self.history.push(line);
        self.send(Source::Server, BroadcastKind::Log, line.to_string());
    }

    pub fn publish_lifecycle(&self, status: ProcessStatus) {
        self.send(Source::Server, BroadcastKind::Lifecycle, status.as_str().to_string());
    }

    fn send(&self, source: Source, kind: BroadcastKind, data: String) {
        // No subscribers is the normal idle state.
        let _ = self.tx.send(BroadcastMessage { source, kind, data });
    }
}
