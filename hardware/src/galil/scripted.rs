//! Scripted command channel for tests.
//!
//! [`ScriptedChannel`] answers each command with a closure and records every
//! command it was sent, so tests can assert exact wire traffic.

use std::sync::{Arc, Mutex, PoisonError};

use super::channel::{ChannelResult, CommandChannel};

type Responder = Box<dyn FnMut(&str) -> ChannelResult<String> + Send>;

/// Shared record of every command sent through a [`ScriptedChannel`].
#[derive(Debug, Clone, Default)]
pub struct SentLog {
    commands: Arc<Mutex<Vec<String>>>,
}

impl SentLog {
    fn push(&self, command: &str) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());
    }

    /// Snapshot of all commands sent so far.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sent commands equal to `command`.
    pub fn count(&self, command: &str) -> usize {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }
}

/// Command channel driven by a closure.
pub struct ScriptedChannel {
    responder: Responder,
    sent: SentLog,
}

impl ScriptedChannel {
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> ChannelResult<String> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            sent: SentLog::default(),
        }
    }

    /// Channel that acknowledges every command with `:`.
    pub fn accept_all() -> Self {
        Self::new(|_| Ok(":".to_string()))
    }

    /// Handle to the sent-command log; stays valid after the channel is moved.
    pub fn sent_log(&self) -> SentLog {
        self.sent.clone()
    }
}

impl CommandChannel for ScriptedChannel {
    fn send(&mut self, command: &str) -> ChannelResult<String> {
        self.sent.push(command);
        (self.responder)(command)
    }
}
