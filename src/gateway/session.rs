use std::time::Duration;

use super::heartbeat::MAX_MISSED_ACKS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Identifying,
    Ready,
    Resuming,
}

/// What a RESUME frame needs besides the credential. Valid for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken {
    pub session_id: String,
    pub seq: Option<u64>,
}

/// Bookkeeping for one logical gateway session. Shared between the worker
/// and the manager's accessors behind a single lock.
#[derive(Debug)]
pub struct Session {
    phase: Phase,
    session_id: Option<String>,
    resume_url: Option<String>,
    resume_armed: bool,
    sequence: Option<u64>,
    heartbeat_interval: Option<Duration>,
    ack_outstanding: bool,
    missed_acks: u32,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Disconnected,
            session_id: None,
            resume_url: None,
            resume_armed: false,
            sequence: None,
            heartbeat_interval: None,
            ack_outstanding: false,
            missed_acks: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "gateway phase change");
            self.phase = phase;
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    /// Called on every new transport. Heartbeat accounting starts over.
    pub fn on_hello(&mut self, interval: Duration) {
        self.heartbeat_interval = Some(interval);
        self.ack_outstanding = false;
        self.missed_acks = 0;
    }

    /// Records a dispatch sequence number. Returns `false` for a frame the
    /// session has already seen, which the caller must drop.
    pub fn record_sequence(&mut self, seq: u64) -> bool {
        match self.sequence {
            Some(last) if seq <= last => false,
            _ => {
                self.sequence = Some(seq);
                true
            }
        }
    }

    pub fn on_ready(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
        self.resume_armed = true;
        self.set_phase(Phase::Ready);
    }

    pub fn on_resumed(&mut self) {
        self.resume_armed = true;
        self.set_phase(Phase::Ready);
    }

    /// Takes the resume token for one attempt. Returns `None` when the next
    /// handshake has to be a fresh IDENTIFY.
    pub fn take_resume(&mut self) -> Option<ResumeToken> {
        if !self.resume_armed {
            return None;
        }
        self.resume_armed = false;
        self.session_id.clone().map(|session_id| ResumeToken {
            session_id,
            seq: self.sequence,
        })
    }

    /// The server still accepts this session id for one more attempt.
    pub fn rearm_resume(&mut self) {
        if self.session_id.is_some() {
            self.resume_armed = true;
        }
    }

    /// Drops the session id, resume token and sequence so the next handshake
    /// identifies from scratch.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.resume_url = None;
        self.resume_armed = false;
        self.sequence = None;
    }

    /// Accounts for one heartbeat timer tick and returns the sequence to send.
    ///
    /// # Errors
    ///
    /// Returns the number of consecutive unacknowledged heartbeats once it
    /// reaches [`MAX_MISSED_ACKS`].
    pub fn beat(&mut self) -> Result<Option<u64>, u32> {
        if self.ack_outstanding {
            self.missed_acks += 1;
            if self.missed_acks >= MAX_MISSED_ACKS {
                return Err(self.missed_acks);
            }
        } else {
            self.missed_acks = 0;
        }
        self.ack_outstanding = true;
        Ok(self.sequence)
    }

    pub fn ack(&mut self) {
        self.ack_outstanding = false;
        self.missed_acks = 0;
    }

    pub fn ack_outstanding(&self) -> bool {
        self.ack_outstanding
    }
}
