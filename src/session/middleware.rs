//! Capability middlewares around a [`Client`].
//!
//! A middleware turns a client into another client. Bootstrap folds the
//! configured list so that the first middleware is the outermost wrapper,
//! i.e. it sees each request first and each reply last.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::Cancellation;

use super::client::{Client, ClientError, Credentials, Request, Response};

/// Decorator applied to every client built by bootstrap.
pub trait Middleware: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Wraps `next`.
    fn wrap(&self, next: Arc<dyn Client>) -> Arc<dyn Client>;
}

/// Folds `middlewares` around `client`, first entry outermost.
pub fn compose(client: Arc<dyn Client>, middlewares: &[Arc<dyn Middleware>]) -> Arc<dyn Client> {
    middlewares
        .iter()
        .rev()
        .fold(client, |next, middleware| middleware.wrap(next))
}

// ---------------------------------------------------------------------------
// RateLimit
// ---------------------------------------------------------------------------

/// Token bucket limiter for outgoing requests.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// One token is added per interval.
    pub every: Duration,
    /// Bucket capacity.
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            every: Duration::from_millis(400),
            burst: 2,
        }
    }
}

impl RateLimit {
    /// Creates a limiter. A zero burst is treated as one.
    #[must_use]
    pub fn new(every: Duration, burst: u32) -> Self {
        Self {
            every,
            burst: burst.max(1),
        }
    }
}

impl Middleware for RateLimit {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn wrap(&self, next: Arc<dyn Client>) -> Arc<dyn Client> {
        let burst = f64::from(self.burst.max(1));
        Arc::new(RateLimited {
            next,
            every: self.every,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                capacity: burst,
                refilled_at: Instant::now(),
            }),
        })
    }
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refilled_at: Instant,
}

impl Bucket {
    /// Takes a token, or returns how long until one is available.
    fn take(&mut self, every: Duration, now: Instant) -> Option<Duration> {
        if every.is_zero() {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.refilled_at);
        self.tokens = (self.tokens + elapsed.as_secs_f64() / every.as_secs_f64()).min(self.capacity);
        self.refilled_at = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            Some(every.mul_f64(1.0 - self.tokens))
        }
    }
}

struct RateLimited {
    next: Arc<dyn Client>,
    every: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimited {
    fn acquire(&self, cancel: &Cancellation) -> Result<(), ClientError> {
        loop {
            let wait = {
                let mut bucket = self
                    .bucket
                    .lock()
                    .map_err(|_| ClientError::Transport("poisoned lock: rate limiter".into()))?;
                bucket.take(self.every, Instant::now())
            };
            match wait {
                None => return Ok(()),
                Some(wait) => cancel.sleep(wait)?,
            }
        }
    }
}

impl Client for RateLimited {
    fn resume(&self, credentials: &Credentials, cancel: &Cancellation) -> Result<bool, ClientError> {
        self.next.resume(credentials, cancel)
    }

    fn invoke(&self, request: &Request, cancel: &Cancellation) -> Result<Response, ClientError> {
        self.acquire(cancel)?;
        self.next.invoke(request, cancel)
    }
}

// ---------------------------------------------------------------------------
// FloodWait
// ---------------------------------------------------------------------------

/// Retries requests the server asked to delay.
#[derive(Debug, Clone, Copy)]
pub struct FloodWait {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Longer server-mandated waits are returned to the caller as errors.
    pub max_wait: Duration,
}

impl Default for FloodWait {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_wait: Duration::from_secs(60),
        }
    }
}

impl Middleware for FloodWait {
    fn name(&self) -> &'static str {
        "flood_wait"
    }

    fn wrap(&self, next: Arc<dyn Client>) -> Arc<dyn Client> {
        Arc::new(FloodWaiting {
            next,
            policy: *self,
        })
    }
}

struct FloodWaiting {
    next: Arc<dyn Client>,
    policy: FloodWait,
}

impl Client for FloodWaiting {
    fn resume(&self, credentials: &Credentials, cancel: &Cancellation) -> Result<bool, ClientError> {
        self.next.resume(credentials, cancel)
    }

    fn invoke(&self, request: &Request, cancel: &Cancellation) -> Result<Response, ClientError> {
        let mut retries = 0;
        loop {
            match self.next.invoke(request, cancel) {
                Err(ClientError::FloodWait(wait))
                    if retries < self.policy.max_retries && wait <= self.policy.max_wait =>
                {
                    retries += 1;
                    tracing::warn!(
                        method = %request.method,
                        wait_ms = wait.as_millis() as u64,
                        retries,
                        "flood wait, retrying"
                    );
                    cancel.sleep(wait)?;
                }
                other => return other,
            }
        }
    }
}
