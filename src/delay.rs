// Copyright 2020 Joyent, Inc.

//! Suspension primitives used between connect attempts.
//!
//! The retry algorithm never sleeps on its own. A blocking caller supplies a
//! [`Delay`](trait.Delay.html) and a caller running on an event loop supplies
//! an [`AsyncDelay`](trait.AsyncDelay.html), so a backoff only ever parks the
//! thread or the task that asked for the connection.

use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// Suspend the calling thread.
pub trait Delay {
    fn sleep(&self, duration: Duration);
}

/// Suspend the calling task, yielding to the executor.
#[async_trait]
pub trait AsyncDelay: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Blocking delay backed by `std::thread::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleep;

impl Delay for ThreadSleep {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

/// Cooperative delay backed by the tokio timer. Dropping the future cancels
/// the sleep.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleep;

#[async_trait]
impl AsyncDelay for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Stretch `delay` by a random fraction in `[0, factor)` of itself, with
/// `factor` capped at 1. The result is never shorter than `delay`.
pub fn jittered<R>(delay: Duration, factor: f64, rng: &mut R) -> Duration
where
    R: Rng + ?Sized,
{
    // also rejects NaN
    if !(factor > 0.0) {
        return delay;
    }
    let extra = delay.as_secs_f64() * factor.min(1.0) * rng.gen::<f64>();
    if !extra.is_finite() || extra >= u64::MAX as f64 {
        return delay;
    }
    delay
        .checked_add(Duration::from_secs_f64(extra))
        .unwrap_or(delay)
}
