//! # Client Metrics
//!
//! Process-wide counters for proxy traffic: connections, handshakes, calls,
//! bytes on the wire and the failures seen along the way.
//!
//! Counters are relaxed atomics; a [`MetricsSnapshot`] is a consistent-enough
//! copy for logging, not a transactional view.

use crate::error::ProtocolError;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
        /// Atomic counters shared by every proxy in the process.
        #[derive(Debug)]
        pub struct Metrics {
            $($(#[$doc])* pub $name: AtomicU64,)+
            started: Instant,
        }

        impl Metrics {
            pub fn new() -> Self {
                Self {
                    $($name: AtomicU64::new(0),)+
                    started: Instant::now(),
                }
            }

            /// Copy every counter at once.
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                    uptime_seconds: self.started.elapsed().as_secs(),
                }
            }
        }

        /// Plain copy of [`Metrics`] at one point in time.
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct MetricsSnapshot {
            $(pub $name: u64,)+
            pub uptime_seconds: u64,
        }

        impl MetricsSnapshot {
            /// `(name, value)` pairs in declaration order.
            pub fn entries(&self) -> Vec<(&'static str, u64)> {
                vec![$((stringify!($name), self.$name),)+ ("uptime_seconds", self.uptime_seconds)]
            }
        }
    };
}

counters! {
    connections_total,
    /// Currently open connections
    connections_active,
    /// Reconnects performed after a connection-level failure
    reconnects,
    handshakes_total,
    /// Handshakes rejected by the daemon or the validator
    handshakes_failed,
    /// Calls that wait for a reply
    calls_total,
    oneway_calls,
    /// Calls answered with a remote exception
    remote_errors,
    messages_sent,
    messages_received,
    bytes_sent,
    bytes_received,
    /// Requests whose payload went out deflated
    compressed_sent,
    /// HMAC mismatches and key asymmetries
    authentication_errors,
    connection_errors,
    protocol_errors,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Metrics {
    pub fn connection_established(&self) {
        bump(&self.connections_total, 1);
        bump(&self.connections_active, 1);
    }

    /// Never underflows, even when a connection is closed twice.
    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn reconnect(&self) {
        bump(&self.reconnects, 1);
    }

    pub fn handshake_attempt(&self) {
        bump(&self.handshakes_total, 1);
    }

    pub fn handshake_failed(&self) {
        bump(&self.handshakes_failed, 1);
    }

    pub fn call(&self, oneway: bool) {
        bump(if oneway { &self.oneway_calls } else { &self.calls_total }, 1);
    }

    pub fn message_sent(&self, bytes: u64, compressed: bool) {
        bump(&self.messages_sent, 1);
        bump(&self.bytes_sent, bytes);
        if compressed {
            bump(&self.compressed_sent, 1);
        }
    }

    pub fn message_received(&self, bytes: u64) {
        bump(&self.messages_received, 1);
        bump(&self.bytes_received, bytes);
    }

    /// Count a failure under the counter matching its kind.
    ///
    /// Decode and call-validation errors are the caller's business and are
    /// not counted.
    pub fn record_error(&self, err: &ProtocolError) {
        let counter = match err {
            ProtocolError::Authentication(_) => &self.authentication_errors,
            ProtocolError::Remote(_) => &self.remote_errors,
            e if e.is_retryable() => &self.connection_errors,
            e if e.closes_connection() => &self.protocol_errors,
            _ => return,
        };
        bump(counter, 1);
    }

    /// Emit the current snapshot as one `info` event.
    pub fn log_metrics(&self) {
        let snap = self.snapshot();
        info!(
            connections = snap.connections_total,
            active = snap.connections_active,
            reconnects = snap.reconnects,
            handshakes = snap.handshakes_total,
            handshakes_failed = snap.handshakes_failed,
            calls = snap.calls_total,
            oneway = snap.oneway_calls,
            remote_errors = snap.remote_errors,
            bytes_out = snap.bytes_sent,
            bytes_in = snap.bytes_received,
            auth_errors = snap.authentication_errors,
            connection_errors = snap.connection_errors,
            protocol_errors = snap.protocol_errors,
            uptime_s = snap.uptime_seconds,
            "pyro client metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Logs how long the enclosing scope took when dropped.
pub struct Timer {
    operation: &'static str,
    began: Instant,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            began: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            elapsed_us = self.began.elapsed().as_micros() as u64,
            "timed"
        );
    }
}
