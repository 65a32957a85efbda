// Copyright 2020 Joyent, Inc.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;
use tokio::sync::Notify;

use crate::connection::{Connection, ConnectionId};
use crate::retry::RetryPolicy;

/// The connection counts for the connection pool
#[derive(Copy, Clone, Debug)]
pub struct PoolStats {
    /// The total number of connections, including those being connected
    pub total_connections: ConnectionCount,
    /// The count of idle connections in the pool
    pub idle_connections: ConnectionCount,
    /// The number of reserved, but not yet connected connections. This
    /// includes the replacement for an idle connection that failed its
    /// liveness check.
    pub pending_connections: ConnectionCount,
}

impl PoolStats {
    /// Create a new instance of `PoolStats`
    pub fn new() -> Self {
        PoolStats {
            total_connections: ConnectionCount::from(0),
            idle_connections: ConnectionCount::from(0),
            pending_connections: ConnectionCount::from(0),
        }
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The configuration options for a bounded connection pool.
#[derive(Debug, Default)]
pub struct BoundedPoolOptions {
    /// An optional number of connections kept open and idle for reuse. If not
    /// specified the default is 5.
    pub pool_size: Option<u32>,
    /// An optional number of connections that may be opened beyond
    /// `pool_size` while the pool is saturated. Overflow connections are
    /// closed when they are returned. If not specified the default is 10.
    pub max_overflow: Option<u32>,
    /// An optional timeout in milliseconds for `acquire` to wait for an idle
    /// connection or spare capacity. If not specified the default is 30
    /// seconds.
    pub acquire_timeout: Option<u64>,
    /// Check that an idle connection is still alive before handing it out
    /// and replace it if it is not.
    pub pre_ping: bool,
    /// An optional connect retry policy. If not specified
    /// `RetryPolicy::default()` is used.
    pub retry_policy: Option<RetryPolicy>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

// An idle connection and the identifier the pool assigned to it.
#[doc(hidden)]
#[derive(Debug)]
pub struct ConnectionIdPair<C>(pub ConnectionId, pub C);

impl<C> From<(ConnectionId, C)> for ConnectionIdPair<C>
where
    C: Connection,
{
    fn from(pair: (ConnectionId, C)) -> Self {
        ConnectionIdPair(pair.0, pair.1)
    }
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

// The internal data structures used to manage the connection pool.
#[doc(hidden)]
#[derive(Debug)]
pub struct ConnectionData<C> {
    pub idle: VecDeque<ConnectionIdPair<C>>,
    pub stats: PoolStats,
    pub state: PoolState,
}

impl<C> ConnectionData<C>
where
    C: Connection,
{
    #[doc(hidden)]
    pub fn new(pool_size: usize) -> Self {
        ConnectionData {
            idle: VecDeque::with_capacity(pool_size),
            stats: PoolStats::new(),
            state: PoolState::Running,
        }
    }
}

// Protected access to the internal connection pool data structures. Blocking
// waiters park on the condvar, async waiters on the `Notify`; every
// notification reaches both.
#[doc(hidden)]
#[derive(Debug)]
pub struct ProtectedData<C>(Arc<(Mutex<ConnectionData<C>>, Condvar, Notify)>);

impl<C> ProtectedData<C>
where
    C: Connection,
{
    pub fn new(connection_data: ConnectionData<C>) -> Self {
        ProtectedData(Arc::new((
            Mutex::new(connection_data),
            Condvar::new(),
            Notify::new(),
        )))
    }

    // A panic while holding the lock leaves the counters as they were last
    // written, so a poisoned lock is still usable.
    pub fn connection_data_lock(&self) -> MutexGuard<ConnectionData<C>> {
        (self.0).0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, ConnectionData<C>>,
        timeout: Duration,
    ) -> MutexGuard<'a, ConnectionData<C>> {
        match (self.0).1.wait_timeout(g, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    // Create the future before checking the pool state: it is woken by any
    // notification sent after this call, even before it is first polled.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        (self.0).2.notified()
    }

    pub fn condvar_notify(&self) {
        (self.0).1.notify_one();
        (self.0).2.notify_waiters()
    }

    pub fn condvar_notify_all(&self) {
        (self.0).1.notify_all();
        (self.0).2.notify_waiters()
    }
}

impl<C> Clone for ProtectedData<C>
where
    C: Connection,
{
    fn clone(&self) -> ProtectedData<C> {
        ProtectedData(Arc::clone(&self.0))
    }
}

/// Sum type representing the current state of the connection pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolState {
    /// The pool is running and able to service acquire requests.
    Running,
    /// The connection pool is stopped and is no longer accepting acquire
    /// requests.
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolState::Running => write!(fmt, "running"),
            PoolState::Stopped => write!(fmt, "stopped"),
        }
    }
}
