// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Errors returned when acquiring a connection from a pool. `E` is the error
/// type of the pool's [`Connection`](../connection/trait.Connection.html).
#[derive(Debug)]
pub enum Error<E> {
    /// The connection could not be established. This is the error from the
    /// final connect attempt, unchanged.
    ConnectFailure(E),
    /// No idle connection or spare capacity became available within the
    /// acquire timeout. Carries the time spent waiting.
    PoolExhaustion(Duration),
    /// The pool has been stopped and is no longer handing out connections.
    PoolStopped,
}

impl<E> Error<E> {
    /// Return the underlying connect failure, if that is what this is.
    pub fn into_connect_failure(self) -> Option<E> {
        match self {
            Error::ConnectFailure(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_pool_exhaustion(&self) -> bool {
        matches!(self, Error::PoolExhaustion(_))
    }
}

impl<E> From<E> for Error<E>
where
    E: StdError,
{
    fn from(error: E) -> Self {
        Error::ConnectFailure(error)
    }
}

impl<E> fmt::Display for Error<E>
where
    E: fmt::Display,
{
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ConnectFailure(err) => err.fmt(fmt),
            Error::PoolExhaustion(waited) => write!(
                fmt,
                "no connection available after waiting {}ms",
                waited.as_millis()
            ),
            Error::PoolStopped => write!(fmt, "connection pool is stopped"),
        }
    }
}

impl<E> StdError for Error<E>
where
    E: StdError + 'static,
{
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::ConnectFailure(err) => Some(err),
            Error::PoolExhaustion(_) | Error::PoolStopped => None,
        }
    }
}
