//! Format probing: find the command spelling the controller accepts.
//!
//! [`SyntaxProbe::execute`] renders every candidate of an [`Operation`] and
//! sends them in priority order until one is accepted. The index of the
//! winner is cached per (operation kind, axis) in a [`FormatCache`], so later
//! calls cost a single round trip. A cached spelling that stops working is
//! dropped and the full list is probed again from the top.
//!
//! Every round trip is recorded as a [`ProbeAttempt`] in a bounded journal
//! that callers drain to report rejected spellings with their literal text.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tracing::{debug, warn};

use super::axis::Axis;
use super::channel::{ChannelResult, CommandChannel};
use super::syntax::{is_rejection, Operation, OperationKind};

/// Maximum attempts retained in the journal between drains.
const JOURNAL_CAPACITY: usize = 256;

/// Cache key: operation kind plus addressed axis (`None` for axis-less operations).
pub type CacheKey = (OperationKind, Option<Axis>);

/// How a single candidate fared on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Controller accepted the command; carries the reply.
    Accepted(String),
    /// Round trip succeeded but the reply was a rejection token.
    Rejected(String),
    /// Transport failure; carries the error text.
    Failed(String),
}

/// One candidate sent to the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeAttempt {
    pub axis: Option<Axis>,
    pub command: String,
    pub outcome: AttemptOutcome,
}

impl ProbeAttempt {
    /// Whether this attempt was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Accepted(_))
    }
}

impl std::fmt::Display for ProbeAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            AttemptOutcome::Accepted(reply) => write!(f, "{:?} -> accepted {:?}", self.command, reply),
            AttemptOutcome::Rejected(reply) => write!(f, "{:?} -> rejected {:?}", self.command, reply),
            AttemptOutcome::Failed(error) => write!(f, "{:?} -> failed ({error})", self.command),
        }
    }
}

/// Every candidate for an operation was rejected or failed.
#[derive(Error, Debug, Clone)]
#[error("{operation}{} not accepted in any syntax: {}", axis_suffix(.axis), format_attempts(.attempts))]
pub struct ProtocolError {
    pub operation: OperationKind,
    pub axis: Option<Axis>,
    /// Attempts in the order they were sent, including a stale cached spelling.
    pub attempts: Vec<ProbeAttempt>,
}

impl ProtocolError {
    /// Literal command texts that were tried.
    pub fn attempted_commands(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.command.as_str()).collect()
    }
}

fn axis_suffix(axis: &Option<Axis>) -> String {
    axis.map(|a| format!(" on axis {a}")).unwrap_or_default()
}

fn format_attempts(attempts: &[ProbeAttempt]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Winning candidate index per (operation kind, axis).
///
/// Entries are only removed explicitly: by the probe when a cached spelling
/// fails, or by [`clear`](Self::clear) on reconnect.
#[derive(Debug, Clone, Default)]
pub struct FormatCache {
    entries: HashMap<CacheKey, usize>,
}

impl FormatCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached candidate index for a key.
    pub fn get(&self, key: &CacheKey) -> Option<usize> {
        self.entries.get(key).copied()
    }

    /// Record a winner. An existing entry is kept; callers invalidate first.
    fn insert(&mut self, key: CacheKey, index: usize) {
        self.entries.entry(key).or_insert(index);
    }

    /// Drop one entry. Returns the index that was cached.
    pub fn invalidate(&mut self, key: &CacheKey) -> Option<usize> {
        self.entries.remove(key)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Executes logical operations by probing candidate spellings.
pub struct SyntaxProbe<C> {
    channel: C,
    cache: FormatCache,
    journal: VecDeque<ProbeAttempt>,
}

impl<C: CommandChannel> SyntaxProbe<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            cache: FormatCache::new(),
            journal: VecDeque::with_capacity(JOURNAL_CAPACITY),
        }
    }

    /// Execute an operation, returning the accepted reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] carrying every attempted rendering when no
    /// candidate is accepted. Transport failures count as a failed candidate and
    /// move on to the next spelling.
    pub fn execute(&mut self, operation: &Operation) -> Result<String, ProtocolError> {
        let key = (operation.kind(), operation.axis());
        let renderings = operation.candidates();
        let mut attempts = Vec::new();

        if let Some(index) = self.cache.get(&key) {
            if let Some(command) = renderings.get(index) {
                let attempt = self.attempt(operation.axis(), command);
                if let AttemptOutcome::Accepted(reply) = &attempt.outcome {
                    return Ok(reply.clone());
                }
                warn!(
                    "Cached syntax for {} stopped working: {attempt}; re-probing",
                    key.0
                );
                attempts.push(attempt);
            }
            self.cache.invalidate(&key);
        }

        for (index, command) in renderings.iter().enumerate() {
            let attempt = self.attempt(operation.axis(), command);
            if let AttemptOutcome::Accepted(reply) = &attempt.outcome {
                debug!("{} accepted as {:?} (candidate {})", key.0, command, index + 1);
                let reply = reply.clone();
                self.cache.insert(key, index);
                return Ok(reply);
            }
            debug!("{} candidate {}: {attempt}", key.0, index + 1);
            attempts.push(attempt);
        }

        Err(ProtocolError {
            operation: key.0,
            axis: key.1,
            attempts,
        })
    }

    /// Send a raw command without probing or caching.
    pub fn send_raw(&mut self, command: &str) -> ChannelResult<String> {
        self.channel.send(command)
    }

    /// Send one candidate and classify the reply.
    fn attempt(&mut self, axis: Option<Axis>, command: &str) -> ProbeAttempt {
        let outcome = match self.channel.send(command) {
            Ok(reply) if is_rejection(&reply) => AttemptOutcome::Rejected(reply.trim().to_string()),
            Ok(reply) => AttemptOutcome::Accepted(reply),
            Err(e) => AttemptOutcome::Failed(e.to_string()),
        };
        let attempt = ProbeAttempt {
            axis,
            command: command.to_string(),
            outcome,
        };

        if self.journal.len() == JOURNAL_CAPACITY {
            self.journal.pop_front();
        }
        self.journal.push_back(attempt.clone());
        attempt
    }

    /// Take every attempt recorded since the last drain.
    pub fn drain_journal(&mut self) -> Vec<ProbeAttempt> {
        self.journal.drain(..).collect()
    }

    pub fn cache(&self) -> &FormatCache {
        &self.cache
    }

    /// Forget every learned spelling.
    pub fn reset_cache(&mut self) {
        self.cache.clear();
    }

    /// Swap in a new link (reconnect). Learned spellings are discarded.
    pub fn replace_channel(&mut self, channel: C) -> C {
        self.cache.clear();
        self.journal.clear();
        std::mem::replace(&mut self.channel, channel)
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}
