// Copyright 2020 Joyent, Inc.

//! A fault tolerant database connection pool
//!
//! Connecting to a database fails for all sorts of transient reasons: a
//! failover in progress, a restarting proxy, a briefly saturated listen
//! queue. This crate wraps connection establishment in a small, fixed retry
//! budget so that callers see either a working connection or the real error
//! from the last attempt, and never an unbounded stall.
//!
//! ## Connections
//!
//! A *connection* is anything that implements the
//! [`Connection`](connection/trait.Connection.html) trait. It is created
//! unconnected by a user supplied function and then connected by the pool:
//! ```rust,ignore
//! Fn() -> C + Send + Sync + 'static
//! where C: Connection
//! ```
//! The purpose of this function is to capture application level
//! configuration required to establish a connection, such as a database name,
//! a user name, or a connect timeout. Connect level timeouts are always the
//! business of the connection implementation, never of the pool.
//!
//! ## Retries
//!
//! Both pools delegate connection establishment to a
//! [`RetryingConnector`](retry/struct.RetryingConnector.html). With the
//! default [`RetryPolicy`](retry/struct.RetryPolicy.html) a connection is
//! attempted at most three times. After the first failure the caller waits
//! 200 milliseconds, after the second 400 milliseconds, each stretched by up
//! to 10% of random jitter so that many callers failing at once do not retry
//! in lockstep. The jitter is only ever added. When the last attempt fails
//! its error is returned unchanged; there is no separate "retries exhausted"
//! error.
//!
//! Every acquisition gets its own budget. Concurrent callers never share
//! backoff state, so one caller's bad luck does not delay another.
//!
//! ## Pools
//!
//! The [`BoundedPool`](bounded_pool/struct.BoundedPool.html) keeps up to
//! `pool_size` idle connections for reuse and will open up to
//! `max_overflow` more while it is saturated. A caller that finds neither an
//! idle connection nor spare capacity waits for up to `acquire_timeout` and
//! then fails with `Error::PoolExhaustion`. Waiting for capacity is not a
//! connect failure and is never retried.
//!
//! With `pre_ping` enabled the bounded pool checks an idle connection with
//! [`Connection::ping`](connection/trait.Connection.html#method.ping) before
//! handing it out. A dead connection is closed and a replacement is
//! connected in the same attempt. Because that replacement already is a
//! retry, the invalidation spends one extra unit of the acquisition's retry
//! budget, keeping the worst case number of connects the same with or
//! without the liveness check.
//!
//! For connections implementing
//! [`AsyncConnection`](connection/trait.AsyncConnection.html) the bounded
//! pool also offers `acquire_async`, which waits for capacity and backs off
//! without blocking the executor thread.
//!
//! The [`UnboundedPool`](unbounded_pool/struct.UnboundedPool.html) opens a
//! new connection for every acquisition and closes it on release. It can be
//! used from blocking code and, for connections implementing
//! [`AsyncConnection`](connection/trait.AsyncConnection.html), from async
//! code. An async acquisition waits out its backoff on the tokio timer, so a
//! retrying caller never stalls the event loop it runs on.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Mutex;
//! use std::thread;
//!
//! use slog::{o, Drain, Logger};
//!
//! use resilient_pool::bounded_pool::types::BoundedPoolOptions;
//! use resilient_pool::bounded_pool::BoundedPool;
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let pool_opts = BoundedPoolOptions {
//!     pool_size: Some(1),
//!     max_overflow: Some(10),
//!     acquire_timeout: Some(2000),
//!     pre_ping: true,
//!     retry_policy: None,
//!     log: Some(log),
//! };
//!
//! let pool = BoundedPool::new(pool_opts, || DbConnection::new(&db_config));
//!
//! for _ in 0..10 {
//!     let pool = pool.clone();
//!     thread::spawn(move || {
//!         let conn = pool.acquire()?;
//!         // Do stuff here
//!         // The connection is returned to the pool when it falls out of scope.
//!     })
//! }
//! ```
//!
//! ## [`Connection`](connection/trait.Connection.html) trait implementers
//!
//! * `resilient-pool-tcp-stream-connection`
//! * `resilient-pool-postgres-connection`

#![allow(missing_docs)]

pub mod bounded_pool;
pub mod connection;
pub mod delay;
pub mod error;
pub mod retry;
pub mod unbounded_pool;
