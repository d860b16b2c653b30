//! Job queue with a logical clock.
//!
//! Time only moves through `advance`. Scheduled jobs are released into the
//! queue, ordered by due time then scheduling order, when the clock reaches
//! them.

use serde::Serialize;
use weft::ir::{ScheduleKind, Span};
use weft::runtime::error_reporting::build_guidance_message;
use weft::{RuntimeError, RuntimeResult, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedJob {
    pub name: String,
    pub payload: Value,
    pub enqueued_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledJob {
    pub name: String,
    pub payload: Value,
    pub due_at: u64,
    seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogicalClock {
    now: u64,
}

impl LogicalClock {
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn advance(&mut self, amount: u64) -> u64 {
        self.now = self.now.saturating_add(amount);
        self.now
    }
}

pub fn non_negative_int(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(i) if *i >= 0 => Some(*i as u64),
        Value::Float(f) if *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64 => Some(*f as u64),
        _ => None,
    }
}

pub fn require_non_negative_int(value: &Value, label: &str, span: Span) -> RuntimeResult<u64> {
    non_negative_int(value).ok_or_else(|| {
        RuntimeError::domain(build_guidance_message(
            &format!("{} must be a non-negative integer.", label),
            &format!("Got {} ({}).", value, value.kind_name()),
            "Use a whole number that is zero or greater.",
            "advance time by 5",
        ))
        .at(span)
    })
}

#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    clock: LogicalClock,
    queued: Vec<QueuedJob>,
    scheduled: Vec<ScheduledJob>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn queued(&self) -> &[QueuedJob] {
        &self.queued
    }

    pub fn scheduled(&self) -> &[ScheduledJob] {
        &self.scheduled
    }

    pub fn enqueue(&mut self, name: &str, payload: Value) {
        log::debug!("Enqueue job '{}' at t={}", name, self.clock.now());
        self.queued.push(QueuedJob {
            name: name.to_string(),
            payload,
            enqueued_at: self.clock.now(),
        });
    }

    pub fn schedule(
        &mut self,
        name: &str,
        payload: Value,
        kind: ScheduleKind,
        when: &Value,
        span: Span,
    ) -> RuntimeResult<u64> {
        let amount = require_non_negative_int(when, "Job schedule", span)?;
        let due_at = match kind {
            ScheduleKind::After => self.clock.now().saturating_add(amount),
            ScheduleKind::At => amount.max(self.clock.now()),
        };
        self.next_seq += 1;
        self.scheduled.push(ScheduledJob {
            name: name.to_string(),
            payload,
            due_at,
            seq: self.next_seq,
        });
        Ok(due_at)
    }

    /// Move the clock forward and release due jobs. Returns how many were released.
    pub fn advance(&mut self, amount: u64) -> usize {
        let now = self.clock.advance(amount);
        let (mut due, pending): (Vec<ScheduledJob>, Vec<ScheduledJob>) =
            self.scheduled.drain(..).partition(|job| job.due_at <= now);
        self.scheduled = pending;
        due.sort_by_key(|job| (job.due_at, job.seq));
        let released = due.len();
        for job in due {
            self.queued.push(QueuedJob {
                name: job.name,
                payload: job.payload,
                enqueued_at: job.due_at,
            });
        }
        if released > 0 {
            log::debug!("Released {} scheduled job(s) at t={}", released, now);
        }
        released
    }
}
