//! Outbox job records, typed payloads and the retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use escrowbox_core::{Amount, Digest32, EnvelopeId, JobId, WorkerId};

use super::registry::HandlerError;

pub const ESCROW_FUND: &str = "ESCROW_FUND";
pub const EMAIL_SEND: &str = "EMAIL_SEND";
pub const PUSH_SEND: &str = "PUSH_SEND";

/// Lifecycle position of a job row, derived from its columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Unlocked and not terminal (may still be waiting for `run_after`).
    Pending,
    /// Locked by a worker.
    InFlight,
    Processed,
    Failed,
}

/// One outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Kind tag (`ESCROW_FUND`, `EMAIL_SEND`, ...). Unknown tags are kept and
    /// fail at dispatch.
    pub job_type: String,
    pub payload: serde_json::Value,
    pub run_after: DateTime<Utc>,
    pub attempts: u32,
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn state(&self) -> JobState {
        if self.processed_at.is_some() {
            JobState::Processed
        } else if self.failed_at.is_some() {
            JobState::Failed
        } else if self.locked_by.is_some() {
            JobState::InFlight
        } else {
            JobState::Pending
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), JobState::Processed | JobState::Failed)
    }

    /// Whether `claim_batch` may pick this row up at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.state() == JobState::Pending && self.run_after <= now && self.attempts < max_attempts
    }
}

/// A job waiting to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    /// Defaults to the insert time.
    pub run_after: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            run_after: None,
        }
    }

    pub fn from_kind(kind: &JobKind) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind.job_type(), kind.to_payload()?))
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    /// Materialize the row as inserted at `now`.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            job_type: self.job_type,
            payload: self.payload,
            run_after: self.run_after.unwrap_or(now),
            attempts: 0,
            locked_by: None,
            locked_at: None,
            processed_at: None,
            failed_at: None,
            last_error: None,
            created_at: now,
        }
    }
}

/// Payload of `ESCROW_FUND`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowFundPayload {
    pub envelope_id: EnvelopeId,
    pub sender_wallet_id: String,
    pub recipient_hash: Digest32,
    pub amount_atomic: Amount,
    pub asset_code: String,
    /// Unix milliseconds.
    pub expiry_ts: i64,
}

/// Payload of `EMAIL_SEND`. `data` is template specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSendPayload {
    pub template: String,
    pub to: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Payload of `PUSH_SEND`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSendPayload {
    pub token: String,
    pub title: String,
    pub body: String,
}

/// Typed view of a job, decoded from `(job_type, payload)`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    EscrowFund(EscrowFundPayload),
    EmailSend(EmailSendPayload),
    PushSend(PushSendPayload),
}

impl JobKind {
    pub fn job_type(&self) -> &'static str {
        match self {
            JobKind::EscrowFund(_) => ESCROW_FUND,
            JobKind::EmailSend(_) => EMAIL_SEND,
            JobKind::PushSend(_) => PUSH_SEND,
        }
    }

    pub fn decode(job_type: &str, payload: &serde_json::Value) -> Result<Self, HandlerError> {
        let invalid = |source| HandlerError::InvalidPayload {
            job_type: job_type.to_string(),
            source,
        };
        match job_type {
            ESCROW_FUND => serde_json::from_value(payload.clone())
                .map(JobKind::EscrowFund)
                .map_err(invalid),
            EMAIL_SEND => serde_json::from_value(payload.clone())
                .map(JobKind::EmailSend)
                .map_err(invalid),
            PUSH_SEND => serde_json::from_value(payload.clone())
                .map(JobKind::PushSend)
                .map_err(invalid),
            other => Err(HandlerError::UnknownJobType(other.to_string())),
        }
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            JobKind::EscrowFund(p) => serde_json::to_value(p),
            JobKind::EmailSend(p) => serde_json::to_value(p),
            JobKind::PushSend(p) => serde_json::to_value(p),
        }
    }
}

/// Retry policy: `delay = min(base * 2^attempts, cap)` until `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Executions allowed before the job is marked failed.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next run, given the attempts recorded so far.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
