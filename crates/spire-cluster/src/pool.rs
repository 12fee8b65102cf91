//! Per-node pool of reusable blocking connections.
//!
//! The pool never creates connections itself. `checkout` either hands back
//! an idle connection or reserves a slot for the caller to fill with a fresh
//! one, so connect failures and transport choice stay with the caller.
//! Idle connections are reused LIFO: the most recently returned socket is
//! the warmest and the least likely to have been closed by the server.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A blocking transport that can sit in a pool between commands.
pub trait PooledConnection: Read + Write + Send {
    /// Checks that the socket is still usable before handing it out.
    ///
    /// Returns false when the peer closed the connection or left unread
    /// bytes behind, either of which means the stream position is unknown.
    fn is_reusable(&mut self) -> bool;

    /// Bounds how long a single read or write may block.
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

/// Errors returned by `checkout`.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every connection is in use and the wait deadline passed.
    #[error("connection pool exhausted ({max} in use)")]
    Exhausted { max: usize },

    /// The pool was closed because its node left the cluster.
    #[error("connection pool closed")]
    Closed,
}

/// Bounds for a node's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections kept even when they exceed the idle timeout.
    pub min_size: usize,
    /// Upper bound on open connections, idle plus in use.
    pub max_size: usize,
    /// Idle connections older than this are closed on checkout or trim.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 100,
            idle_timeout: Some(Duration::from_secs(55)),
        }
    }
}

/// Result of a successful checkout.
pub enum Checkout {
    /// An idle connection, validated and ready.
    Pooled(Box<dyn PooledConnection>),
    /// A slot was reserved; the caller must open a connection and either
    /// `checkin` it or call `cancel_reservation` if the connect fails.
    Reserved,
}

struct Idle {
    conn: Box<dyn PooledConnection>,
    since: Instant,
}

struct PoolState {
    idle: Vec<Idle>,
    /// Open connections, idle plus checked out plus reserved.
    total: usize,
    closed: bool,
}

/// A bounded LIFO pool.
pub struct ConnectionPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("idle", &state.idle.len())
            .field("total", &state.total)
            .field("max", &self.config.max_size)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Takes an idle connection or reserves room for a new one.
    ///
    /// When the pool is at capacity this blocks until another command
    /// returns a connection or `deadline` passes. With no deadline it waits
    /// until a connection comes back.
    pub fn checkout(&self, deadline: Option<Instant>) -> Result<Checkout, PoolError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }

            while let Some(mut idle) = state.idle.pop() {
                if self.expired(&idle, Instant::now()) || !idle.conn.is_reusable() {
                    state.total -= 1;
                    drop(idle);
                    continue;
                }
                return Ok(Checkout::Pooled(idle.conn));
            }

            if state.total < self.config.max_size {
                state.total += 1;
                return Ok(Checkout::Reserved);
            }

            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        return Err(PoolError::Exhausted {
                            max: self.config.max_size,
                        });
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Gives back a slot reserved by `checkout` whose connect failed.
    pub fn cancel_reservation(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        self.available.notify_one();
    }

    /// Returns a connection after use.
    ///
    /// Unhealthy connections (protocol errors, timeouts, aborted commands)
    /// are closed instead of pooled, as is anything returned after `close`.
    pub fn checkin(&self, conn: Box<dyn PooledConnection>, healthy: bool) {
        let mut state = self.state.lock();
        if healthy && !state.closed && state.idle.len() < self.config.max_size {
            state.idle.push(Idle {
                conn,
                since: Instant::now(),
            });
        } else {
            state.total = state.total.saturating_sub(1);
            drop(conn);
        }
        self.available.notify_one();
    }

    /// Closes idle connections past the idle timeout, keeping `min_size`.
    /// Returns how many were closed.
    pub fn trim_idle(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let min = self.config.min_size;
        let mut closed = 0;
        // oldest entries sit at the front
        while state.idle.len() > min {
            if !self.expired(&state.idle[0], now) {
                break;
            }
            state.idle.remove(0);
            state.total -= 1;
            closed += 1;
        }
        closed
    }

    /// Drops every idle connection and fails all future checkouts.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let n = state.idle.len();
        state.idle.clear();
        state.total -= n;
        self.available.notify_all();
    }

    /// Idle connections currently pooled.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Connections open (idle, in use or reserved).
    pub fn total_count(&self) -> usize {
        self.state.lock().total
    }

    fn expired(&self, idle: &Idle, now: Instant) -> bool {
        match self.config.idle_timeout {
            Some(timeout) => now.saturating_duration_since(idle.since) > timeout,
            None => false,
        }
    }
}
