// Copyright 2020 Joyent, Inc.

pub mod types;

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, info, o, trace, warn, Drain, Logger};

use crate::bounded_pool::types::{
    BoundedPoolOptions, ConnectionCount, ConnectionData, ConnectionIdPair,
    PoolState, PoolStats, ProtectedData,
};
use crate::connection::{AsyncConnection, Connection, ConnectionId};
use crate::delay::{ThreadSleep, TokioSleep};
use crate::error::Error;
use crate::retry::{InvalidationEvent, InvalidationHook, RetryingConnector};

// Default number of connections kept idle for reuse
const DEFAULT_POOL_SIZE: u32 = 5;
// Default number of connections allowed beyond the pool size
const DEFAULT_MAX_OVERFLOW: u32 = 10;
// Acquire timeout in milliseconds
const DEFAULT_ACQUIRE_TIMEOUT: u64 = 30_000;

// What a caller was granted while holding the pool lock
enum Checkout<C> {
    // An idle connection to hand out, pending the liveness check
    Idle(ConnectionId, C),
    // Capacity for a new connection that the caller must establish
    Vacant,
}

/// A pool of at most `pool_size + max_overflow` reusable connections.
pub struct BoundedPool<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    protected_data: ProtectedData<C>,
    create_connection: Arc<F>,
    connector: RetryingConnector,
    next_connection_id: Arc<AtomicU64>,
    pool_size: u32,
    max_overflow: u32,
    acquire_timeout: Duration,
    pre_ping: bool,
    log: Logger,
}

impl<C: Debug, F> Debug for BoundedPool<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("BoundedPool")
            .field("protected_data", &self.protected_data)
            .field("connector", &self.connector)
            .field("next_connection_id", &self.next_connection_id)
            .field("pool_size", &self.pool_size)
            .field("max_overflow", &self.max_overflow)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("pre_ping", &self.pre_ping)
            .field("log", &self.log)
            .finish()
    }
}

impl<C, F> Clone for BoundedPool<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    fn clone(&self) -> BoundedPool<C, F> {
        BoundedPool {
            protected_data: self.protected_data.clone(),
            create_connection: Arc::clone(&self.create_connection),
            connector: self.connector.clone(),
            next_connection_id: Arc::clone(&self.next_connection_id),
            pool_size: self.pool_size,
            max_overflow: self.max_overflow,
            acquire_timeout: self.acquire_timeout,
            pre_ping: self.pre_ping,
            log: self.log.clone(),
        }
    }
}

impl<C, F> BoundedPool<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    /// Create a pool. No connections are opened until they are first
    /// acquired.
    pub fn new(bpo: BoundedPoolOptions, create_connection: F) -> Self {
        let pool_size = bpo.pool_size.unwrap_or(DEFAULT_POOL_SIZE);
        let max_overflow = bpo.max_overflow.unwrap_or(DEFAULT_MAX_OVERFLOW);
        let acquire_timeout = Duration::from_millis(
            bpo.acquire_timeout.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
        );

        let logger = bpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let connector = RetryingConnector::new(
            bpo.retry_policy.unwrap_or_default(),
            Some(logger.new(o!("component" => "connector"))),
        );

        debug!(
            logger,
            "creating bounded pool";
            "pool_size" => pool_size,
            "max_overflow" => max_overflow,
            "acquire_timeout_ms" => acquire_timeout.as_millis() as u64,
            "pre_ping" => bpo.pre_ping
        );

        BoundedPool {
            protected_data: ProtectedData::new(ConnectionData::new(
                pool_size as usize,
            )),
            create_connection: Arc::new(create_connection),
            connector,
            next_connection_id: Arc::new(AtomicU64::new(1)),
            pool_size,
            max_overflow,
            acquire_timeout,
            pre_ping: bpo.pre_ping,
            log: logger,
        }
    }

    /// Acquire a connection, reusing an idle one if there is one and opening
    /// a new one otherwise. Blocks for up to the acquire timeout when the
    /// pool is at capacity. The connection returns to the pool when the
    /// `PoolConnection` is dropped.
    pub fn acquire(&self) -> Result<PoolConnection<C, F>, Error<C::Error>> {
        let (reservation, mut reused) = Reservation::new(self, self.reserve()?);

        let result = self.connector.connect(&ThreadSleep, |hook| {
            if let Some((id, conn)) = reused.take() {
                match self.check_idle(id, conn, hook) {
                    Some(pair) => return Ok(pair),
                    None => reservation.mark_pending(),
                }
            }
            self.establish()
        });

        self.hand_out(reservation, result)
    }

    /// Hand out an idle connection without blocking or connecting. Returns
    /// `None` if no idle connection is available.
    pub fn try_acquire(&self) -> Option<PoolConnection<C, F>> {
        loop {
            let (id, mut conn) = {
                let mut connection_data =
                    self.protected_data.connection_data_lock();
                if connection_data.state == PoolState::Stopped {
                    return None;
                }
                let ConnectionIdPair(id, conn) =
                    connection_data.idle.pop_front()?;
                connection_data.stats.idle_connections -= 1.into();
                (id, conn)
            };

            if self.pre_ping {
                if let Err(cause) = conn.ping() {
                    warn!(
                        self.log,
                        "discarding idle connection {}: {}", id, cause
                    );
                    close_connection(&self.log, id, conn);
                    self.settle(false, false);
                    continue;
                }
            }

            return Some(PoolConnection {
                connection_pool: self.clone(),
                connection_pair: Some((id, conn).into()),
            });
        }
    }

    /// Return a connection to the pool. Equivalent to dropping it.
    pub fn release(&self, connection: PoolConnection<C, F>) {
        drop(connection)
    }

    pub fn get_stats(&self) -> Option<PoolStats> {
        let connection_data = self.protected_data.connection_data_lock();
        match connection_data.state {
            PoolState::Running => Some(connection_data.stats),
            PoolState::Stopped => None,
        }
    }

    pub fn get_state(&self) -> PoolState {
        self.protected_data.connection_data_lock().state
    }

    /// Stop the pool. Idle connections are closed immediately, connections in
    /// use are closed as they are returned, and all current and future
    /// `acquire` calls fail with `Error::PoolStopped`.
    pub fn stop(&self) -> Result<(), Error<C::Error>> {
        let drained: Vec<ConnectionIdPair<C>> = {
            let mut connection_data =
                self.protected_data.connection_data_lock();
            if connection_data.state == PoolState::Stopped {
                trace!(self.log, "stop called on stopped pool");
                return Ok(());
            }
            connection_data.state = PoolState::Stopped;

            let drained: Vec<_> = connection_data.idle.drain(..).collect();
            let count = ConnectionCount::from(drained.len() as u32);
            connection_data.stats.idle_connections -= count;
            connection_data.stats.total_connections -= count;
            drained
        };
        self.protected_data.condvar_notify_all();

        info!(
            self.log,
            "stopping pool, closing {} idle connections",
            drained.len()
        );
        drained.into_iter().for_each(|ConnectionIdPair(id, conn)| {
            close_connection(&self.log, id, conn)
        });
        Ok(())
    }

    fn capacity(&self) -> ConnectionCount {
        ConnectionCount::from(self.pool_size.saturating_add(self.max_overflow))
    }

    // Wait for an idle connection or spare capacity. Capacity is claimed
    // under the lock so that concurrent callers never exceed it.
    fn reserve(&self) -> Result<Checkout<C>, Error<C::Error>> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        let mut connection_data = self.protected_data.connection_data_lock();

        loop {
            if let Some(checkout) = self.checkout(&mut connection_data)? {
                return Ok(checkout);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.exhausted(now - started));
            }

            trace!(self.log, "pool at capacity, waiting");
            connection_data = self
                .protected_data
                .condvar_wait(connection_data, deadline - now);
        }
    }

    // Take an idle connection or claim a vacant slot. `None` means the pool
    // is at capacity.
    fn checkout(
        &self,
        connection_data: &mut ConnectionData<C>,
    ) -> Result<Option<Checkout<C>>, Error<C::Error>> {
        if connection_data.state == PoolState::Stopped {
            return Err(Error::PoolStopped);
        }

        if let Some(ConnectionIdPair(id, conn)) = connection_data.idle.pop_front()
        {
            connection_data.stats.idle_connections -= 1.into();
            debug!(self.log, "found idle connection {}", id);
            return Ok(Some(Checkout::Idle(id, conn)));
        }

        if connection_data.stats.total_connections < self.capacity() {
            connection_data.stats.total_connections += 1.into();
            connection_data.stats.pending_connections += 1.into();
            if connection_data.stats.total_connections > self.pool_size.into() {
                debug!(
                    self.log,
                    "opening overflow connection ({} of {})",
                    connection_data.stats.total_connections,
                    self.capacity()
                );
            }
            return Ok(Some(Checkout::Vacant));
        }

        Ok(None)
    }

    fn exhausted(&self, waited: Duration) -> Error<C::Error> {
        warn!(
            self.log,
            "pool exhausted, no connection after {}ms",
            waited.as_millis()
        );
        Error::PoolExhaustion(waited)
    }

    // With pre-ping enabled, close an idle connection that fails its
    // liveness check and report it to the hook. `None` means a replacement
    // is needed.
    fn check_idle(
        &self,
        id: ConnectionId,
        mut conn: C,
        hook: &InvalidationHook,
    ) -> Option<(ConnectionId, C)> {
        if !self.pre_ping {
            return Some((id, conn));
        }
        match conn.ping() {
            Ok(()) => Some((id, conn)),
            Err(cause) => {
                close_connection(&self.log, id, conn);
                hook.fire(InvalidationEvent {
                    connection: id,
                    cause,
                });
                None
            }
        }
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId::from(
            self.next_connection_id.fetch_add(1, AtomicOrdering::Relaxed),
        )
    }

    fn hand_out(
        &self,
        mut reservation: Reservation<C, F>,
        result: Result<(ConnectionId, C), C::Error>,
    ) -> Result<PoolConnection<C, F>, Error<C::Error>> {
        reservation.connected = result.is_ok();
        drop(reservation);

        match result {
            Ok((id, conn)) => {
                trace!(self.log, "acquired connection {}", id);
                Ok(PoolConnection {
                    connection_pool: self.clone(),
                    connection_pair: Some((id, conn).into()),
                })
            }
            Err(err) => Err(Error::ConnectFailure(err)),
        }
    }

    // Settle the accounting for a checkout once its connect attempts are
    // over. A failed checkout gives its slot back to waiting callers.
    fn settle(&self, pending: bool, connected: bool) {
        let mut connection_data = self.protected_data.connection_data_lock();
        if pending {
            connection_data.stats.pending_connections -= 1.into();
        }
        if !connected {
            connection_data.stats.total_connections -= 1.into();
            drop(connection_data);
            self.protected_data.condvar_notify();
        }
    }

    fn establish(&self) -> Result<(ConnectionId, C), C::Error> {
        let id = self.next_id();
        let mut conn = (*self.create_connection)();
        debug!(self.log, "establishing connection {}", id);
        conn.connect()?;
        Ok((id, conn))
    }

    fn replace(&self, connection_pair: ConnectionIdPair<C>) {
        let ConnectionIdPair(id, conn) = connection_pair;
        let mut connection_data = self.protected_data.connection_data_lock();

        let discard_reason = if connection_data.state == PoolState::Stopped {
            Some("pool is stopped")
        } else if conn.has_broken() {
            Some("connection is broken")
        } else if connection_data.stats.idle_connections
            >= self.pool_size.into()
        {
            Some("pool is full")
        } else {
            None
        };

        match discard_reason {
            Some(reason) => {
                connection_data.stats.total_connections -= 1.into();
                drop(connection_data);
                self.protected_data.condvar_notify();
                debug!(self.log, "not returning connection {}: {}", id, reason);
                close_connection(&self.log, id, conn);
            }
            None => {
                connection_data.idle.push_back((id, conn).into());
                connection_data.stats.idle_connections += 1.into();
                drop(connection_data);
                self.protected_data.condvar_notify();
            }
        }
    }
}

impl<C, F> BoundedPool<C, F>
where
    C: AsyncConnection,
    F: Fn() -> C + Send + Sync + 'static,
{
    /// The suspending counterpart of `acquire`. Waiting for capacity and
    /// backing off between connect attempts only suspend the calling task.
    /// Dropping the returned future abandons the acquisition and gives any
    /// claimed slot back to the pool.
    pub async fn acquire_async(
        &self,
    ) -> Result<PoolConnection<C, F>, Error<C::Error>> {
        let checkout = self.reserve_async().await?;
        let (reservation, mut reused) = Reservation::new(self, checkout);

        let result = {
            let reservation = &reservation;
            self.connector
                .connect_async(&TokioSleep, move |hook| {
                    let reused = reused.take();
                    async move {
                        if let Some((id, conn)) = reused {
                            match self.check_idle(id, conn, &hook) {
                                Some(pair) => return Ok(pair),
                                None => reservation.mark_pending(),
                            }
                        }
                        self.establish_async().await
                    }
                })
                .await
        };

        self.hand_out(reservation, result)
    }

    async fn reserve_async(&self) -> Result<Checkout<C>, Error<C::Error>> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;

        loop {
            let notified = self.protected_data.notified();
            {
                let mut connection_data =
                    self.protected_data.connection_data_lock();
                if let Some(checkout) = self.checkout(&mut connection_data)? {
                    return Ok(checkout);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.exhausted(now - started));
            }

            trace!(self.log, "pool at capacity, waiting");
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn establish_async(&self) -> Result<(ConnectionId, C), C::Error> {
        let id = self.next_id();
        let mut conn = (*self.create_connection)();
        debug!(self.log, "establishing connection {}", id);
        conn.connect_async().await?;
        Ok((id, conn))
    }
}

// Slot accounting for one acquisition. It is settled when dropped, so an
// acquisition that panics or is abandoned still gives its slot back.
struct Reservation<'a, C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    pool: &'a BoundedPool<C, F>,
    pending: AtomicBool,
    connected: bool,
}

impl<'a, C, F> Reservation<'a, C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    fn new(
        pool: &'a BoundedPool<C, F>,
        checkout: Checkout<C>,
    ) -> (Self, Option<(ConnectionId, C)>) {
        let (pending, reused) = match checkout {
            Checkout::Idle(id, conn) => (false, Some((id, conn))),
            Checkout::Vacant => (true, None),
        };
        let reservation = Reservation {
            pool,
            pending: AtomicBool::new(pending),
            connected: false,
        };
        (reservation, reused)
    }

    // The reused connection failed its liveness check and its slot now
    // waits for a replacement.
    fn mark_pending(&self) {
        if !self.pending.swap(true, AtomicOrdering::SeqCst) {
            let mut connection_data =
                self.pool.protected_data.connection_data_lock();
            connection_data.stats.pending_connections += 1.into();
        }
    }
}

impl<'a, C, F> Drop for Reservation<'a, C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let pending = *self.pending.get_mut();
        self.pool.settle(pending, self.connected);
    }
}

/// A connection checked out of a [`BoundedPool`](struct.BoundedPool.html)
pub struct PoolConnection<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    connection_pool: BoundedPool<C, F>,
    connection_pair: Option<ConnectionIdPair<C>>,
}

impl<C: Debug, F> Debug for PoolConnection<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("PoolConnection")
            .field("connection_pool", &self.connection_pool)
            .field("connection_pair", &self.connection_pair)
            .finish()
    }
}

impl<C, F> PoolConnection<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    pub fn id(&self) -> Option<ConnectionId> {
        self.connection_pair.as_ref().map(|pair| pair.0)
    }
}

impl<C, F> Drop for PoolConnection<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    fn drop(&mut self) {
        match self.connection_pair.take() {
            Some(pair) => self.connection_pool.replace(pair),
            None => {
                // If we arrive here then the connection is no longer available
                // and cannot be returned to the pool
                warn!(
                    self.connection_pool.log,
                    "Connection is no longer available. Cannot return to pool."
                );
            }
        }
    }
}

impl<C, F> Deref for PoolConnection<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    type Target = C;

    fn deref(&self) -> &C {
        match &self.connection_pair {
            Some(pair) => &pair.1,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl<C, F> DerefMut for PoolConnection<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.connection_pair {
            Some(pair) => &mut pair.1,
            None => unreachable!("connection taken before drop"),
        }
    }
}

fn close_connection<C>(log: &Logger, id: ConnectionId, mut conn: C)
where
    C: Connection,
{
    debug!(log, "closing connection {}", id);
    if let Err(err) = conn.close() {
        warn!(
            log,
            "Failed to properly close connection {}. Reason: {}", id, err
        );
    }
}
