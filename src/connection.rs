// Copyright 2020 Joyent, Inc.

use std::error;

use async_trait::async_trait;
use derive_more::{Display, From, Into};

/// Pooled connection
///
/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in a connection pool. A connection need not be
/// limited to a TCP socket, but could be any logical notion of a connection
/// to a database that implements the `Connection` trait.
///
/// Connections are handed to the pool unconnected by a user supplied
/// `create_connection` function and the pool calls `connect` on them, retrying
/// failures according to its [`RetryPolicy`](../retry/struct.RetryPolicy.html).
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by the `connect`, `ping`, or `close`
    /// functions. This is an associated type for the trait meaning each
    /// specific implementation of the `Connection` trait may choose the
    /// appropriate concrete error type to return. A pool surfaces this error
    /// verbatim once its retry budget is spent.
    type Error: error::Error + Send + 'static;
    /// Attempt to establish the connection. Any connect level timeout is the
    /// responsibility of the implementation; the pool only observes success
    /// or failure.
    fn connect(&mut self) -> Result<(), Self::Error>;
    /// Liveness check run by a bounded pool with `pre_ping` enabled before an
    /// idle connection is handed out. An `Err` causes the connection to be
    /// invalidated and replaced.
    fn ping(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
    /// Cheap, non-blocking check for a connection that is known to be
    /// unusable. Broken connections are not returned to the idle set.
    fn has_broken(&self) -> bool {
        false
    }
    /// Close the connection
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// A `Connection` that can also be established from an async context without
/// blocking the executor thread.
#[async_trait]
pub trait AsyncConnection: Connection {
    async fn connect_async(&mut self) -> Result<(), Self::Error>;
}

/// Identifier a pool assigns to each physical connection it creates. Used to
/// correlate log records and invalidation events.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct ConnectionId(u64);
