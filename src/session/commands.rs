//! # Command Correlation
//!
//! Devices answer commands in order and carry no correlation id, so a
//! response always resolves the oldest pending command. Every pending
//! command is resolved exactly once: by a response, by its deadline, or by
//! the session closing. A command that timed out still owes a response; the
//! next one that arrives is consumed as that late answer.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::codec::protocol::{CommandResponse, MessageKind};
use crate::error::{GatewayError, Result};

/// Command awaiting its response
#[derive(Debug)]
pub struct PendingCommand {
    pub text: String,
    pub sent_at: Instant,
    pub deadline: Instant,
    responder: oneshot::Sender<Result<CommandResponse>>,
}

/// How a pending command was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Completed { command: String, response: String },
    Failed { command: String, error: String },
}

/// FIFO of in-flight commands for one session
#[derive(Debug)]
pub struct CommandQueue {
    pending: VecDeque<PendingCommand>,
    window: Duration,
    /// Timed-out commands whose answer has not arrived yet
    late_responses: usize,
}

impl CommandQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            window,
            late_responses: 0,
        }
    }

    /// Register a command written to the device at `now`
    pub fn push(&mut self, text: String, now: Instant, responder: oneshot::Sender<Result<CommandResponse>>) {
        self.pending.push_back(PendingCommand {
            text,
            sent_at: now,
            deadline: now + self.window,
            responder,
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest deadline among pending commands
    pub fn next_deadline(&self) -> Option<Instant> {
        // Same window for every entry, so the front expires first
        self.pending.front().map(|p| p.deadline)
    }

    /// Resolve the oldest pending command with a device response
    ///
    /// # Returns
    ///
    /// * `Option<Resolution>` - `None` for the late answer of a timed-out
    ///   command, or when nothing was pending
    pub fn resolve_oldest(&mut self, response: CommandResponse) -> Option<Resolution> {
        if self.late_responses > 0 {
            self.late_responses -= 1;
            debug!("Dropping late response {:?}", response.text);
            return None;
        }

        let pending = self.pending.pop_front()?;

        let resolution = if response.kind == MessageKind::Rejected {
            let error = GatewayError::CommandRejected(pending.text.clone());
            let resolution = Resolution::Failed {
                command: pending.text.clone(),
                error: error.to_string(),
            };
            let _ = pending.responder.send(Err(error));
            resolution
        } else {
            let resolution = Resolution::Completed {
                command: pending.text.clone(),
                response: response.text.clone(),
            };
            let _ = pending.responder.send(Ok(response));
            resolution
        };

        Some(resolution)
    }

    /// Time out every command whose deadline is at or before `now`
    pub fn expire(&mut self, now: Instant) -> Vec<Resolution> {
        let mut expired = Vec::new();
        while self.pending.front().map_or(false, |p| p.deadline <= now) {
            if let Some(pending) = self.pending.pop_front() {
                let error = GatewayError::CommandTimeout(self.window);
                expired.push(Resolution::Failed {
                    command: pending.text,
                    error: error.to_string(),
                });
                let _ = pending.responder.send(Err(error));
                self.late_responses += 1;
            }
        }
        expired
    }

    /// Fail everything still pending with `SessionClosed`
    pub fn fail_all(&mut self) -> Vec<Resolution> {
        self.late_responses = 0;
        self.pending
            .drain(..)
            .map(|pending| {
                let resolution = Resolution::Failed {
                    command: pending.text,
                    error: GatewayError::SessionClosed.to_string(),
                };
                let _ = pending.responder.send(Err(GatewayError::SessionClosed));
                resolution
            })
            .collect()
    }
}
