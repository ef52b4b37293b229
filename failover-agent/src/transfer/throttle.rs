//! Bandwidth shaping for the sending side.
//!
//! The limiter keeps a byte debt that drains at the configured rate. Each
//! write adds to the debt and, once the debt exceeds what the elapsed time
//! paid for, the next write waits until it is paid off.

use std::future::Future;
use std::io;
use std::num::NonZeroU64;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::time::{Instant, Sleep};

const MICROS_PER_SECOND: u128 = 1_000_000;

/// Waits shorter than this are folded into the next write.
const MINIMUM_SLEEP_MICROS: u128 = 10_000;

const MIN_WRITE_MAX: usize = 512;

#[derive(Debug, Clone)]
pub struct BandwidthLimiter {
    limit_bytes: NonZeroU64,
    write_max: usize,
    debt: u128,
    last_instant: Option<Instant>,
}

impl BandwidthLimiter {
    pub fn new(limit: NonZeroU64) -> Self {
        let kib = (limit.get() / 1024).max(1);
        let write_max = usize::try_from(kib.saturating_mul(128)).unwrap_or(usize::MAX).max(MIN_WRITE_MAX);
        Self {
            limit_bytes: limit,
            write_max,
            debt: 0,
            last_instant: None,
        }
    }

    /// Largest single write the limiter lets through.
    pub fn write_max(&self) -> usize {
        self.write_max
    }

    /// Record a completed write at `now` and return how long to pause.
    pub fn register(&mut self, bytes: usize, now: Instant) -> Duration {
        let rate = u128::from(self.limit_bytes.get());
        self.debt = self.debt.saturating_add(bytes as u128);
        if let Some(previous) = self.last_instant {
            let paid = now.duration_since(previous).as_micros().saturating_mul(rate) / MICROS_PER_SECOND;
            self.debt = self.debt.saturating_sub(paid);
        }
        self.last_instant = Some(now);

        let wait_us = self.debt.saturating_mul(MICROS_PER_SECOND) / rate;
        if wait_us < MINIMUM_SLEEP_MICROS {
            Duration::ZERO
        } else {
            Duration::from_micros(u64::try_from(wait_us).unwrap_or(u64::MAX))
        }
    }
}

/// Writer that paces its inner writer through a [`BandwidthLimiter`].
pub struct ThrottledWriter<W> {
    inner: W,
    limiter: BandwidthLimiter,
    pause: Option<Pin<Box<Sleep>>>,
}

impl<W> ThrottledWriter<W> {
    pub fn new(inner: W, limit: NonZeroU64) -> Self {
        Self {
            inner,
            limiter: BandwidthLimiter::new(limit),
            pause: None,
        }
    }

    fn poll_pause(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(pause) = self.pause.as_mut() {
            ready!(pause.as_mut().poll(cx));
            self.pause = None;
        }
        Poll::Ready(())
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ThrottledWriter<W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_pause(cx));

        let allowed = buf.len().min(this.limiter.write_max());
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed]))?;
        let wait = this.limiter.register(written, Instant::now());
        if !wait.is_zero() {
            this.pause = Some(Box::pin(tokio::time::sleep(wait)));
        }
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pause(cx));
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
