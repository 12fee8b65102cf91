//! Retry bookkeeping shared by the sync executor and the async state
//! machine.
//!
//! Both execution models feed the same `RetryState` and `Router`, so given
//! the same failures they pick the same replicas, sleep the same amounts
//! and give up at the same point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use spire_cluster::{ClusterError, Node, PartitionMap, ReplicaPolicy, Route};
use tracing::debug;

use crate::command::Command;
use crate::config::PolicyConfig;
use crate::error::ClientError;

/// What to do after a failed attempt.
#[derive(Debug)]
pub(crate) enum Decision {
    Retry { sleep: Duration },
    Fail(ClientError),
}

/// Per-command retry state.
#[derive(Debug)]
pub(crate) struct RetryState {
    max_retries: u32,
    socket_timeout: Duration,
    sleep_between_retries: Duration,
    deadline: Instant,
    /// Attempts started so far.
    iteration: u32,
    replica_index: usize,
    is_read: bool,
    sent: bool,
}

impl RetryState {
    pub fn new(policy: &PolicyConfig, is_read: bool, now: Instant) -> Self {
        Self {
            max_retries: policy.max_retries,
            socket_timeout: policy.socket_timeout,
            sleep_between_retries: policy.sleep_between_retries,
            deadline: now + policy.total_timeout,
            iteration: 0,
            replica_index: 0,
            is_read,
            sent: false,
        }
    }

    /// Starts the replica scan at `index` instead of the master.
    pub fn starting_at(mut self, index: usize) -> Self {
        self.replica_index = index;
        self
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn replica_index(&self) -> usize {
        self.replica_index
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Starts the next attempt, failing once the deadline has passed.
    pub fn begin_attempt(&mut self, now: Instant) -> Result<(), ClientError> {
        if self.remaining(now).is_zero() {
            return Err(self.timeout(true));
        }
        self.iteration += 1;
        Ok(())
    }

    /// Longest a single socket operation may block right now.
    pub fn socket_timeout(&self, now: Instant) -> Result<Duration, ClientError> {
        let remaining = self.remaining(now);
        if remaining.is_zero() {
            return Err(self.timeout(true));
        }
        Ok(self.socket_timeout.min(remaining))
    }

    /// Remaining time in milliseconds, sent as the server-side deadline.
    pub fn ttl_ms(&self, now: Instant) -> u32 {
        let ms = self.remaining(now).as_millis();
        u32::try_from(ms).unwrap_or(u32::MAX).max(1)
    }

    /// Records that a request was fully written.
    pub fn mark_sent(&mut self) {
        self.sent = true;
    }

    /// A write that reached the socket may have been applied.
    pub fn in_doubt(&self) -> bool {
        !self.is_read && self.sent
    }

    /// A timeout error for this command. `client` is false when the server
    /// started answering the failing attempt.
    pub fn timeout(&self, client: bool) -> ClientError {
        ClientError::Timeout {
            client,
            iterations: self.iteration,
            in_doubt: self.in_doubt(),
        }
    }

    /// Classifies a failed attempt.
    ///
    /// Reads, and any attempt that failed on the way to the node, move to
    /// the next replica. Writes that reached the server stay on the same
    /// replica. The first retry runs immediately to react quickly to a
    /// topology change.
    pub fn on_failure(&mut self, err: ClientError, can_retry: bool, now: Instant) -> Decision {
        let err = match err {
            ClientError::Timeout { client, .. } => self.timeout(client),
            other => other.with_in_doubt(self.in_doubt()),
        };
        if !err.is_retryable() || !can_retry || self.iteration > self.max_retries {
            return Decision::Fail(err);
        }

        let remaining = self.remaining(now);
        if remaining.is_zero() {
            return Decision::Fail(match err {
                ClientError::Timeout { .. } => err,
                _ => self.timeout(true),
            });
        }

        if self.is_read || err.is_transport() {
            self.replica_index = self.replica_index.wrapping_add(1);
        }
        let sleep = if self.iteration <= 1 {
            Duration::ZERO
        } else {
            self.sleep_between_retries.min(remaining)
        };
        Decision::Retry { sleep }
    }
}

/// Node selection inputs that stay fixed for a command's lifetime.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Router<'a> {
    pub map: &'a PartitionMap,
    pub policy: ReplicaPolicy,
    pub racks: &'a [i32],
    pub max_error_rate: u32,
}

impl Router<'_> {
    /// Replica index a new command starts from: the master, except under
    /// `ReplicaPolicy::Any`, which rotates over the replicas.
    pub fn start_index(&self, cmd: &dyn Command) -> usize {
        match self.policy {
            ReplicaPolicy::Any => self.map.next_replica_start(cmd.namespace()),
            _ => 0,
        }
    }

    /// Node serving `(namespace, partition)` at `replica_index`.
    pub fn locate(
        &self,
        namespace: &str,
        partition: u32,
        replica_index: usize,
        previous: Option<&Arc<Node>>,
    ) -> Result<Arc<Node>, ClientError> {
        let route = Route {
            policy: self.policy,
            replica_index,
            previous,
            racks: self.racks,
        };
        Ok(self.map.get_node(namespace, partition, &route)?)
    }

    /// Picks the node for the current attempt. A node over its error
    /// budget is refused without touching the network.
    pub fn select(
        &self,
        cmd: &dyn Command,
        retry: &RetryState,
        previous: Option<&Arc<Node>>,
    ) -> Result<Arc<Node>, ClientError> {
        let node = match cmd.target() {
            Some(node) if node.is_active() => Arc::clone(node),
            Some(_) => {
                return Err(ClusterError::no_node(cmd.namespace(), cmd.partition()).into());
            }
            None => self.locate(
                cmd.namespace(),
                cmd.partition(),
                retry.replica_index(),
                previous,
            )?,
        };
        if !node.is_usable(self.max_error_rate) {
            return Err(ClientError::MaxErrorRate {
                node: node.name().to_string(),
            });
        }
        Ok(node)
    }
}

/// Charges a failed attempt to the node's error-rate window when the
/// failure says something about the node itself.
pub(crate) fn charge_failure(node: &Node, err: &ClientError) {
    let counts = match err {
        ClientError::Connection { .. }
        | ClientError::Timeout { .. }
        | ClientError::Tls(_)
        | ClientError::Protocol(_) => true,
        ClientError::Server { code, .. } => code.is_retryable(),
        _ => false,
    };
    if counts {
        node.record_failure();
    }
}

/// Books a failed attempt against its node and decides what comes next.
pub(crate) fn settle_failure(
    node: Option<&Arc<Node>>,
    err: ClientError,
    cmd: &dyn Command,
    retry: &mut RetryState,
) -> Decision {
    if let Some(node) = node {
        charge_failure(node, &err);
    }
    debug!(
        ns = cmd.namespace(),
        partition = cmd.partition(),
        iteration = retry.iteration(),
        node = node.map(|n| n.name()),
        error = %err,
        "command attempt failed"
    );
    retry.on_failure(err, cmd.can_retry(), Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use spire_protocol::ResultCode;
    use std::io;

    fn policy(max_retries: u32) -> PolicyConfig {
        PolicyConfig {
            max_retries,
            sleep_between_retries: Duration::from_millis(50),
            ..PolicyConfig::default()
        }
    }

    fn conn_err() -> ClientError {
        ClientError::connection(io::ErrorKind::ConnectionReset.into())
    }

    #[test]
    fn budget_allows_max_retries_plus_one_attempts() {
        let now = Instant::now();
        let mut retry = RetryState::new(&policy(2), true, now);
        let mut attempts = 0;
        loop {
            retry.begin_attempt(now).unwrap();
            attempts += 1;
            match retry.on_failure(conn_err(), true, now) {
                Decision::Retry { .. } => continue,
                Decision::Fail(e) => {
                    assert!(matches!(e, ClientError::Connection { .. }));
                    break;
                }
            }
        }
        assert_eq!(attempts, 3);
    }

    #[test]
    fn first_retry_does_not_sleep() {
        let now = Instant::now();
        let mut retry = RetryState::new(&policy(3), true, now);
        retry.begin_attempt(now).unwrap();
        assert!(matches!(
            retry.on_failure(conn_err(), true, now),
            Decision::Retry { sleep } if sleep.is_zero()
        ));
        retry.begin_attempt(now).unwrap();
        assert!(matches!(
            retry.on_failure(conn_err(), true, now),
            Decision::Retry { sleep } if sleep == Duration::from_millis(50)
        ));
    }

    #[test]
    fn reads_rotate_replicas_on_every_retry() {
        let now = Instant::now();
        let mut retry = RetryState::new(&policy(3), true, now);
        retry.begin_attempt(now).unwrap();
        retry.on_failure(ClientError::server(ResultCode::Timeout), true, now);
        assert_eq!(retry.replica_index(), 1);
    }

    #[test]
    fn writes_stay_on_the_master_after_a_server_timeout() {
        let now = Instant::now();
        let mut retry = RetryState::new(&policy(3), false, now);
        retry.begin_attempt(now).unwrap();
        retry.on_failure(ClientError::server(ResultCode::Timeout), true, now);
        assert_eq!(retry.replica_index(), 0);

        retry.begin_attempt(now).unwrap();
        retry.on_failure(conn_err(), true, now);
        assert_eq!(retry.replica_index(), 1);
    }

    #[test]
    fn terminal_errors_fail_immediately() {
        let now = Instant::now();
        let mut retry = RetryState::new(&policy(5), true, now);
        retry.begin_attempt(now).unwrap();
        assert!(matches!(
            retry.on_failure(ClientError::server(ResultCode::GenerationMismatch), true, now),
            Decision::Fail(ClientError::Server { .. })
        ));
        assert!(matches!(
            retry.on_failure(ClientError::Aborted, true, now),
            Decision::Fail(ClientError::Aborted)
        ));
    }

    #[test]
    fn commands_can_refuse_retries() {
        let now = Instant::now();
        let mut retry = RetryState::new(&policy(5), true, now);
        retry.begin_attempt(now).unwrap();
        assert!(matches!(
            retry.on_failure(conn_err(), false, now),
            Decision::Fail(_)
        ));
    }

    #[test]
    fn sent_writes_fail_in_doubt() {
        let now = Instant::now();
        let mut retry = RetryState::new(&policy(0), false, now);
        retry.begin_attempt(now).unwrap();
        retry.mark_sent();
        match retry.on_failure(conn_err(), true, now) {
            Decision::Fail(e) => assert!(e.in_doubt()),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn reads_are_never_in_doubt() {
        let now = Instant::now();
        let mut retry = RetryState::new(&policy(0), true, now);
        retry.begin_attempt(now).unwrap();
        retry.mark_sent();
        assert!(!retry.in_doubt());
    }

    #[test]
    fn expired_deadline_becomes_a_client_timeout() {
        let start = Instant::now();
        let mut retry = RetryState::new(&policy(5), true, start);
        retry.begin_attempt(start).unwrap();
        let late = start + Duration::from_secs(10);
        match retry.on_failure(conn_err(), true, late) {
            Decision::Fail(ClientError::Timeout { client, iterations, .. }) => {
                assert!(client);
                assert_eq!(iterations, 1);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(retry.begin_attempt(late).is_err());
    }

    proptest! {
        /// No attempt starts after `start + T`, and no socket operation is
        /// allowed to block past `min(S, remaining)`.
        #[test]
        fn deadline_law(
            total_ms in 1u64..5_000,
            socket_frac in 1u64..=100,
            steps in proptest::collection::vec(0u64..2_000, 1..20),
        ) {
            let start = Instant::now();
            let total = Duration::from_millis(total_ms);
            let socket = Duration::from_millis((total_ms * socket_frac / 100).max(1));
            let p = PolicyConfig {
                max_retries: 100,
                total_timeout: total,
                socket_timeout: socket,
                sleep_between_retries: Duration::from_millis(10),
                ..PolicyConfig::default()
            };
            let mut retry = RetryState::new(&p, true, start);
            let mut now = start;

            for step in steps {
                if retry.begin_attempt(now).is_err() {
                    prop_assert!(now >= start + total);
                    break;
                }
                prop_assert!(now < start + total);

                let limit = retry.socket_timeout(now).unwrap();
                prop_assert!(limit <= socket);
                prop_assert!(now + limit <= start + total);

                now += Duration::from_millis(step).min(limit);
                match retry.on_failure(conn_err(), true, now) {
                    Decision::Retry { sleep } => {
                        prop_assert!(now + sleep <= start + total);
                        now += sleep;
                    }
                    Decision::Fail(_) => break,
                }
            }
        }
    }
}
