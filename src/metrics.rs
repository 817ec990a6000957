//! Server-wide counters for the tris server
//!
//! Counters are collected per server (not per database) and reported by
//! INFO. Everything on the hot path is a relaxed atomic increment; only slow
//! commands take a lock.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tris::metrics::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.request_started();
//! metrics.record_command("ADD", true, Duration::from_micros(40));
//! metrics.request_finished();
//!
//! let snap = metrics.snapshot();
//! assert_eq!(snap.commands_processed, 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// Only the most recent slow commands are kept.
const MAX_SLOW_COMMANDS: usize = 10;

/// Commands taking at least this long are logged and tracked.
pub const SLOW_COMMAND_THRESHOLD: Duration = Duration::from_millis(100);

pub struct Metrics {
    // ========================================================================
    // Command Metrics
    // ========================================================================
    /// Command lines executed, including unknown and failed ones
    commands_processed: AtomicU64,

    /// Commands that produced a FAIL reply
    failed_commands: AtomicU64,

    /// Commands exceeding SLOW_COMMAND_THRESHOLD
    slow_command_count: AtomicU64,

    /// Sum of command latencies, for the average
    command_time_us: AtomicU64,

    // ========================================================================
    // Request Metrics
    // ========================================================================
    /// Requests dispatched and not yet replied to
    requests_running: AtomicU64,

    /// Requests dispatched since start
    requests_total: AtomicU64,

    // ========================================================================
    // Slow Command Tracking
    // ========================================================================
    slow_commands: Mutex<VecDeque<SlowCommand>>,

    started_at: Instant,
}

/// A command that exceeded SLOW_COMMAND_THRESHOLD.
#[derive(Clone, Debug, PartialEq)]
pub struct SlowCommand {
    pub command: String,
    pub duration_us: u64,
    /// Milliseconds since the server started
    pub timestamp_ms: u64,
}

/// Point-in-time copy of all counters.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub commands_processed: u64,
    pub failed_commands: u64,
    pub slow_command_count: u64,
    pub command_avg_us: u64,
    pub requests_running: u64,
    pub requests_total: u64,
    pub recent_slow_commands: Vec<SlowCommand>,
    pub uptime_secs: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            commands_processed: AtomicU64::new(0),
            failed_commands: AtomicU64::new(0),
            slow_command_count: AtomicU64::new(0),
            command_time_us: AtomicU64::new(0),
            requests_running: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            slow_commands: Mutex::new(VecDeque::with_capacity(MAX_SLOW_COMMANDS)),
            started_at: Instant::now(),
        }
    }

    /// Count a request as in flight. Called by the reactor before the
    /// request is handed to a worker.
    pub fn request_started(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_running.fetch_add(1, Ordering::SeqCst);
    }

    pub fn request_finished(&self) {
        let _ = self.requests_running.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            n.checked_sub(1)
        });
    }

    pub fn requests_running(&self) -> u64 {
        self.requests_running.load(Ordering::SeqCst)
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed.load(Ordering::Relaxed)
    }

    /// Record one executed command line.
    pub fn record_command(&self, command: &str, ok: bool, elapsed: Duration) {
        let duration_us = elapsed.as_micros() as u64;
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        self.command_time_us.fetch_add(duration_us, Ordering::Relaxed);
        if !ok {
            self.failed_commands.fetch_add(1, Ordering::Relaxed);
        }

        if elapsed >= SLOW_COMMAND_THRESHOLD {
            self.slow_command_count.fetch_add(1, Ordering::Relaxed);
            warn!(command, duration_ms = duration_us / 1000, "slow command");

            let mut slow = self.slow_commands.lock();
            if slow.len() >= MAX_SLOW_COMMANDS {
                slow.pop_front();
            }
            slow.push_back(SlowCommand {
                command: command.to_string(),
                duration_us,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            });
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let commands_processed = self.commands_processed.load(Ordering::Relaxed);
        let command_avg_us = if commands_processed > 0 {
            self.command_time_us.load(Ordering::Relaxed) / commands_processed
        } else {
            0
        };

        MetricsSnapshot {
            commands_processed,
            failed_commands: self.failed_commands.load(Ordering::Relaxed),
            slow_command_count: self.slow_command_count.load(Ordering::Relaxed),
            command_avg_us,
            requests_running: self.requests_running(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            recent_slow_commands: self.slow_commands.lock().iter().cloned().collect(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
