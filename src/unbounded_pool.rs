// Copyright 2020 Joyent, Inc.

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use slog::{debug, o, warn, Drain, Logger};

use crate::connection::{AsyncConnection, Connection};
use crate::delay::{ThreadSleep, TokioSleep};
use crate::error::Error;
use crate::retry::{RetryPolicy, RetryingConnector};

/// The configuration options for an unbounded pool.
#[derive(Debug, Default)]
pub struct UnboundedPoolOptions {
    /// An optional connect retry policy. If not specified
    /// `RetryPolicy::default()` is used.
    pub retry_policy: Option<RetryPolicy>,
    /// An optional `slog` logger instance. Falls back to `slog-stdlog`.
    pub log: Option<Logger>,
}

/// A "pool" that opens a new connection for every acquisition and closes it
/// on release. There is no capacity limit and no waiting; concurrency is up
/// to the callers.
pub struct UnboundedPool<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    create_connection: Arc<F>,
    connector: RetryingConnector,
    log: Logger,
    _connection: PhantomData<fn() -> C>,
}

impl<C, F> Debug for UnboundedPool<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("UnboundedPool")
            .field("connector", &self.connector)
            .field("log", &self.log)
            .finish()
    }
}

impl<C, F> Clone for UnboundedPool<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    fn clone(&self) -> UnboundedPool<C, F> {
        UnboundedPool {
            create_connection: Arc::clone(&self.create_connection),
            connector: self.connector.clone(),
            log: self.log.clone(),
            _connection: PhantomData,
        }
    }
}

impl<C, F> UnboundedPool<C, F>
where
    C: Connection,
    F: Fn() -> C + Send + Sync + 'static,
{
    pub fn new(upo: UnboundedPoolOptions, create_connection: F) -> Self {
        let logger = upo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let connector = RetryingConnector::new(
            upo.retry_policy.unwrap_or_default(),
            Some(logger.new(o!("component" => "connector"))),
        );

        UnboundedPool {
            create_connection: Arc::new(create_connection),
            connector,
            log: logger,
            _connection: PhantomData,
        }
    }

    /// Open a new connection, blocking the calling thread during backoff.
    pub fn acquire(&self) -> Result<UnpooledConnection<C>, Error<C::Error>> {
        let conn = self.connector.connect(
            &ThreadSleep,
            |_| -> Result<C, C::Error> {
                let mut conn = (*self.create_connection)();
                conn.connect()?;
                Ok(conn)
            },
        )?;
        debug!(self.log, "opened unpooled connection");
        Ok(self.wrap(conn))
    }

    /// Close a connection. Equivalent to dropping it.
    pub fn release(&self, connection: UnpooledConnection<C>) {
        drop(connection)
    }

    fn wrap(&self, conn: C) -> UnpooledConnection<C> {
        UnpooledConnection {
            connection: Some(conn),
            log: self.log.clone(),
        }
    }
}

impl<C, F> UnboundedPool<C, F>
where
    C: AsyncConnection,
    F: Fn() -> C + Send + Sync + 'static,
{
    /// Open a new connection from an async context. Backoff suspends only
    /// the calling task, and dropping the returned future abandons the
    /// acquisition, including any backoff in progress.
    pub async fn acquire_async(
        &self,
    ) -> Result<UnpooledConnection<C>, Error<C::Error>> {
        let create_connection: &F = &self.create_connection;
        let conn = self
            .connector
            .connect_async(&TokioSleep, |_| async move {
                let mut conn = create_connection();
                conn.connect_async().await?;
                Ok::<C, C::Error>(conn)
            })
            .await?;
        debug!(self.log, "opened unpooled connection");
        Ok(self.wrap(conn))
    }
}

/// A connection opened by an [`UnboundedPool`](struct.UnboundedPool.html).
/// It is closed when dropped.
#[derive(Debug)]
pub struct UnpooledConnection<C>
where
    C: Connection,
{
    connection: Option<C>,
    log: Logger,
}

impl<C> Drop for UnpooledConnection<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            if let Err(err) = conn.close() {
                warn!(
                    self.log,
                    "Failed to properly close connection. Reason: {}", err
                );
            }
        }
    }
}

impl<C> Deref for UnpooledConnection<C>
where
    C: Connection,
{
    type Target = C;

    fn deref(&self) -> &C {
        match &self.connection {
            Some(conn) => conn,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl<C> DerefMut for UnpooledConnection<C>
where
    C: Connection,
{
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.connection {
            Some(conn) => conn,
            None => unreachable!("connection taken before drop"),
        }
    }
}
