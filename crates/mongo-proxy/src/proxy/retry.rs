//! The retry loop behind every proxied call
//!
//! One invocation makes at most `max_retries + 1` attempts. Only errors the
//! predicate accepts are retried; anything else is returned on the spot.
//! When the last attempt fails the root client may be reset before the
//! error is handed back unchanged.
//!
//! The functions here run the same loop without a proxy:
//!
//! ```
//! use mongo_proxy::RetryPolicy;
//! use mongo_proxy::proxy::retry::autoretry;
//! use std::io;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(2).with_delay(Duration::ZERO);
//! let mut calls = 0;
//! let result = autoretry(&policy, || {
//!     calls += 1;
//!     if calls < 3 {
//!         Err(io::Error::from(io::ErrorKind::ConnectionReset))
//!     } else {
//!         Ok("done")
//!     }
//! });
//!
//! assert_eq!(result.unwrap(), "done");
//! assert_eq!(calls, 3);
//! ```

use std::future::Future;
use std::time::Duration;

use crate::disconnect::disconnect_quietly;
use crate::{Backoff, Disconnect, RetryPolicy, Transient};

use super::{EventHook, RetryEvent};

/// Everything one invocation needs besides the operation itself
pub(crate) struct Context<'a> {
    pub(crate) policy: &'a RetryPolicy,
    pub(crate) reset: Option<&'a dyn Disconnect>,
    pub(crate) hook: Option<EventHook>,
}

impl<'a> Context<'a> {
    fn detached(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            reset: None,
            hook: None,
        }
    }

    fn emit(&self, event: RetryEvent) {
        if let Some(hook) = &self.hook {
            (**hook)(&event);
        }
    }

    /// Final step once every attempt failed transiently.
    fn exhausted(&self, total_attempts: u32) {
        tracing::error!(
            total_attempts,
            max_retries = self.policy.max_retries(),
            "AutoReconnect retries exhausted"
        );
        self.emit(RetryEvent::Exhausted { total_attempts });

        if !self.policy.disconnect_on_timeout() {
            return;
        }
        if let Some(reset) = self.reset {
            let succeeded = disconnect_quietly(reset);
            self.emit(RetryEvent::Disconnected { succeeded });
        }
    }
}

/// Per-invocation counter; starts over for every call.
struct Attempts {
    attempt: u32,
    backoff: Backoff,
}

impl Attempts {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            backoff: policy.backoff(),
        }
    }

    /// Record a transient failure. Returns the pause before the next
    /// attempt, or `None` when the retry budget is spent.
    fn fail(&mut self, ctx: &Context<'_>) -> Option<Duration> {
        let max_retries = ctx.policy.max_retries();
        if self.attempt >= max_retries {
            ctx.exhausted(self.attempt.saturating_add(1));
            return None;
        }

        let delay = self.backoff.next().unwrap_or_default();
        tracing::warn!(
            attempt = self.attempt,
            max_retries,
            delay = ?delay,
            "AutoReconnecting, try {}",
            self.attempt
        );
        ctx.emit(RetryEvent::Retrying {
            attempt: self.attempt,
            max_retries,
            delay,
        });
        self.attempt += 1;
        Some(delay)
    }
}

pub(crate) fn run_blocking<R, E, F, P>(ctx: &Context<'_>, is_transient: P, mut op: F) -> Result<R, E>
where
    F: FnMut() -> Result<R, E>,
    P: Fn(&E) -> bool,
{
    let mut attempts = Attempts::new(ctx.policy);
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => match attempts.fail(ctx) {
                Some(delay) => std::thread::sleep(delay),
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

pub(crate) async fn run_async<R, E, F, Fut, P>(
    ctx: &Context<'_>,
    is_transient: P,
    mut op: F,
) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempts = Attempts::new(ctx.policy);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => match attempts.fail(ctx) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

/// Run `op` under `policy`, retrying errors classified as transient.
///
/// There is no client to reset here, so `disconnect_on_timeout` is ignored.
pub fn autoretry<R, E, F>(policy: &RetryPolicy, op: F) -> Result<R, E>
where
    F: FnMut() -> Result<R, E>,
    E: Transient,
{
    run_blocking(&Context::detached(policy), E::is_transient_reconnect, op)
}

/// Like `autoretry`, with a caller-supplied classification.
pub fn autoretry_with<R, E, F, P>(policy: &RetryPolicy, is_transient: P, op: F) -> Result<R, E>
where
    F: FnMut() -> Result<R, E>,
    P: Fn(&E) -> bool,
{
    run_blocking(&Context::detached(policy), is_transient, op)
}

/// Async form of `autoretry`.
pub async fn autoretry_async<R, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Transient,
{
    run_async(&Context::detached(policy), E::is_transient_reconnect, op).await
}

/// Async form of `autoretry_with`.
pub async fn autoretry_async_with<R, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_transient: P,
    op: F,
) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    P: Fn(&E) -> bool,
{
    run_async(&Context::detached(policy), is_transient, op).await
}
