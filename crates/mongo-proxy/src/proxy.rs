//! Transparent retry proxy
//!
//! `RetryProxy` wraps a client handle. Nested handles resolved through it
//! (database, collection, ...) come back wrapped in a proxy that shares the
//! same policy, and every operation invoked through a proxy runs inside the
//! retry loop.
//!
//! # Example
//!
//! ```ignore
//! use mongo_proxy::{RetryPolicy, RetryProxy};
//!
//! let client = RetryProxy::with_policy(client, RetryPolicy::new(3));
//!
//! // Plain handle access is forwarded and stays protected
//! let users = client
//!     .member(|c| c.database("app"))
//!     .member(|db| db.collection("users"));
//!
//! // A bound method that can be called repeatedly
//! let insert = users.method(|coll, doc: Document| coll.insert_one(doc));
//! insert.call(doc)?;
//!
//! let find = users.method_async(|coll, id: ObjectId| async move {
//!     coll.find_one(doc! { "_id": id }).await
//! });
//! let found = find.call_async(id).await?;
//!
//! // Async clients receive an owned handle for each attempt
//! let found = users
//!     .call_async(|coll| async move { coll.find_one(filter).await })
//!     .await?;
//! ```

pub mod retry;

#[cfg(test)]
mod tests;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::{Disconnect, RetryPolicy, Transient};

use retry::Context;

/// Observer for retry activity, installed with `RetryProxy::on_event`.
pub type EventHook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Retry activity reported to an `EventHook`
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    /// A transient failure will be retried after `delay`.
    ///
    /// `attempt` is the zero-based index of the call that just failed.
    Retrying {
        attempt: u32,
        max_retries: u32,
        delay: Duration,
    },
    /// Every attempt failed with a transient error
    Exhausted { total_attempts: u32 },
    /// The client was reset after exhaustion; `succeeded` is false when the
    /// reset itself failed
    Disconnected { succeeded: bool },
}

/// State shared by a root proxy and every proxy derived from it
struct Shared {
    policy: RetryPolicy,
    /// Reset capability of the root handle
    reset: Option<Arc<dyn Disconnect>>,
    hook: RwLock<Option<EventHook>>,
}

impl Shared {
    fn new(policy: RetryPolicy, reset: Option<Arc<dyn Disconnect>>) -> Arc<Self> {
        Arc::new(Self {
            policy,
            reset,
            hook: RwLock::new(None),
        })
    }

    /// Snapshot for one invocation; a hook installed mid-call applies to
    /// the next one.
    fn context(&self) -> Context<'_> {
        Context {
            policy: &self.policy,
            reset: self.reset.as_deref(),
            hook: self.hook.read().clone(),
        }
    }
}

/// Forwarding wrapper that retries AutoReconnect-style failures.
///
/// Cloning a proxy is cheap and shares both the target and the policy.
pub struct RetryProxy<T> {
    target: Arc<T>,
    shared: Arc<Shared>,
}

impl<T> RetryProxy<T> {
    /// Wrap `target` with the default policy.
    pub fn new(target: T) -> Self
    where
        T: Disconnect + 'static,
    {
        Self::with_policy(target, RetryPolicy::default())
    }

    /// Wrap `target` with an explicit policy.
    pub fn with_policy(target: T, policy: RetryPolicy) -> Self
    where
        T: Disconnect + 'static,
    {
        Self::from_arc(Arc::new(target), policy)
    }

    /// Wrap a handle that is already shared elsewhere.
    pub fn from_arc(target: Arc<T>, policy: RetryPolicy) -> Self
    where
        T: Disconnect + 'static,
    {
        let reset: Arc<dyn Disconnect> = target.clone();
        Self {
            target,
            shared: Shared::new(policy, Some(reset)),
        }
    }

    /// Wrap a handle that has no way to reset its connections.
    ///
    /// `disconnect_on_timeout` has no effect for such proxies.
    pub fn without_disconnect(target: T, policy: RetryPolicy) -> Self {
        Self {
            target: Arc::new(target),
            shared: Shared::new(policy, None),
        }
    }

    /// Install an observer for retry activity.
    ///
    /// The observer belongs to the whole chain: every proxy sharing this
    /// proxy's root sees it, including members derived earlier. Installing
    /// another one replaces it.
    pub fn on_event(self, hook: impl Fn(&RetryEvent) + Send + Sync + 'static) -> Self {
        *self.shared.hook.write() = Some(Arc::new(hook));
        self
    }

    /// The wrapped value.
    pub fn get_ref(&self) -> &T {
        &self.target
    }

    /// The shared handle to the wrapped value.
    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    /// Returns `true` when both proxies come from the same root.
    pub fn shares_policy_with<U>(&self, other: &RetryProxy<U>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Resolve a nested handle and wrap it with the same policy.
    ///
    /// Resolution itself runs once and is not retried. Each call builds a
    /// fresh proxy.
    pub fn member<U>(&self, resolve: impl FnOnce(&T) -> U) -> RetryProxy<U> {
        RetryProxy {
            target: Arc::new(resolve(&self.target)),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Resolve a nested handle that may fail to resolve.
    ///
    /// A resolution error is returned unchanged and never retried.
    pub fn try_member<U, E>(
        &self,
        resolve: impl FnOnce(&T) -> Result<U, E>,
    ) -> Result<RetryProxy<U>, E> {
        Ok(RetryProxy {
            target: Arc::new(resolve(&self.target)?),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Bind an operation of the target as a retrying callable.
    ///
    /// `f` receives the target and the arguments given to `Method::call`.
    pub fn method<F, A, R, E>(&self, f: F) -> Method<T, F>
    where
        F: Fn(&T, A) -> Result<R, E>,
    {
        self.bind(f)
    }

    /// Bind an async operation of the target as a retrying callable.
    ///
    /// `f` receives its own handle to the target for every attempt, along
    /// with the arguments given to `Method::call_async`.
    pub fn method_async<F, A, Fut>(&self, f: F) -> Method<T, F>
    where
        F: Fn(Arc<T>, A) -> Fut,
        Fut: Future,
    {
        self.bind(f)
    }

    fn bind<F>(&self, f: F) -> Method<T, F> {
        Method {
            target: Arc::clone(&self.target),
            shared: Arc::clone(&self.shared),
            f,
        }
    }

    /// Invoke `op` against the target under the retry policy.
    pub fn call<R, E>(&self, mut op: impl FnMut(&T) -> Result<R, E>) -> Result<R, E>
    where
        E: Transient,
    {
        let target = &*self.target;
        retry::run_blocking(&self.shared.context(), E::is_transient_reconnect, || {
            op(target)
        })
    }

    /// Invoke an async operation under the retry policy.
    ///
    /// `op` receives its own handle to the target for every attempt, and
    /// pauses use the tokio timer.
    pub async fn call_async<R, E, F, Fut>(&self, mut op: F) -> Result<R, E>
    where
        F: FnMut(Arc<T>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Transient,
    {
        retry::run_async(&self.shared.context(), E::is_transient_reconnect, || {
            op(Arc::clone(&self.target))
        })
        .await
    }
}

impl<T> Clone for RetryProxy<T> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RetryProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryProxy")
            .field("target", &self.target)
            .field("policy", &self.shared.policy)
            .finish()
    }
}

/// An operation bound to a proxied target.
///
/// Every call runs the retry loop from scratch, cloning the arguments for
/// each attempt.
pub struct Method<T, F> {
    target: Arc<T>,
    shared: Arc<Shared>,
    f: F,
}

impl<T, F> Method<T, F> {
    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    /// Call the operation with `args`.
    pub fn call<A, R, E>(&self, args: A) -> Result<R, E>
    where
        F: Fn(&T, A) -> Result<R, E>,
        A: Clone,
        E: Transient,
    {
        let target = &*self.target;
        retry::run_blocking(&self.shared.context(), E::is_transient_reconnect, || {
            (self.f)(target, args.clone())
        })
    }

    /// Call an async operation with `args`.
    pub async fn call_async<A, R, E, Fut>(&self, args: A) -> Result<R, E>
    where
        F: Fn(Arc<T>, A) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        A: Clone,
        E: Transient,
    {
        retry::run_async(&self.shared.context(), E::is_transient_reconnect, || {
            (self.f)(Arc::clone(&self.target), args.clone())
        })
        .await
    }
}

impl<T: fmt::Debug, F> fmt::Debug for Method<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}
