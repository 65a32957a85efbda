// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::cell::Cell;
use std::io::{Error as IOError, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use slog::{o, Drain, Logger};

use resilient_pool::connection::{AsyncConnection, Connection};
use resilient_pool::retry::RetryPolicy;

thread_local! {
    static FAILED_ON_THIS_THREAD: Cell<bool> = Cell::new(false);
}

/// Shared state of a pretend database server that test connections talk to.
#[derive(Debug, Default)]
pub struct FakeServer {
    /// Number of connect calls, successful or not
    pub connects: AtomicUsize,
    /// Number of close calls
    pub closes: AtomicUsize,
    /// Refuse every connect
    pub refuse: AtomicBool,
    /// Refuse the first connect made on every thread
    pub refuse_once_per_thread: AtomicBool,
    /// Panic in the next connect
    pub panic_once: AtomicBool,
    // Bumped on restart; connections from an older epoch are dead
    epoch: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeServer::default())
    }

    /// Kill every connection established so far.
    pub fn restart(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakeConnection {
    server: Arc<FakeServer>,
    epoch: Option<usize>,
    pub broken: bool,
}

impl FakeConnection {
    pub fn new(server: &Arc<FakeServer>) -> Self {
        FakeConnection {
            server: Arc::clone(server),
            epoch: None,
            broken: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.epoch.is_some()
    }
}

impl Connection for FakeConnection {
    type Error = IOError;

    fn connect(&mut self) -> Result<(), IOError> {
        let attempt = self.server.connects.fetch_add(1, Ordering::SeqCst) + 1;

        if self.server.panic_once.swap(false, Ordering::SeqCst) {
            panic!("driver bug in connect #{}", attempt);
        }

        if self.server.refuse.load(Ordering::SeqCst) {
            return Err(IOError::new(
                ErrorKind::ConnectionRefused,
                format!("connection refused (connect #{})", attempt),
            ));
        }

        if self.server.refuse_once_per_thread.load(Ordering::SeqCst)
            && !FAILED_ON_THIS_THREAD.with(|failed| failed.replace(true))
        {
            return Err(IOError::new(
                ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }

        self.epoch = Some(self.server.epoch.load(Ordering::SeqCst));
        Ok(())
    }

    fn ping(&mut self) -> Result<(), IOError> {
        if self.epoch == Some(self.server.epoch.load(Ordering::SeqCst)) {
            Ok(())
        } else {
            Err(IOError::new(
                ErrorKind::BrokenPipe,
                "server closed the connection unexpectedly",
            ))
        }
    }

    fn has_broken(&self) -> bool {
        self.broken
    }

    fn close(&mut self) -> Result<(), IOError> {
        self.server.closes.fetch_add(1, Ordering::SeqCst);
        self.epoch = None;
        Ok(())
    }
}

#[async_trait]
impl AsyncConnection for FakeConnection {
    async fn connect_async(&mut self) -> Result<(), IOError> {
        self.connect()
    }
}

/// A retry policy with short delays to keep tests quick.
pub fn quick_retry_policy(base_delay_ms: u64) -> RetryPolicy {
    RetryPolicy {
        base_delay_ms,
        ..RetryPolicy::default()
    }
}

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}
