//! Handshake-wide deadline

use std::time::Duration;
use tokio::time::Instant;

/// Bounds a whole handshake
///
/// Started when the Hello goes out (or comes in) and stopped once a
/// definitive answer arrives, or while a human is answering prompts.
/// Individual waits are capped with [`AuthTimer::bound`].
#[derive(Debug, Clone)]
pub struct AuthTimer {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl AuthTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    pub fn start(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Deadline for one wait of at most `wait`
    pub fn bound(&self, wait: Duration) -> Instant {
        let own = Instant::now() + wait;
        match self.deadline {
            Some(deadline) if deadline < own => deadline,
            _ => own,
        }
    }
}
