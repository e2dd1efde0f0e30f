//! mongo-proxy - Automatic AutoReconnect handling for replica-set clients
//!
//! Wraps a database client handle so that calls failing because the replica
//! set is between primaries are retried with exponential backoff instead of
//! surfacing to the caller.
//!
//! - `RetryProxy` - Transparent wrapper around a client, database or collection
//!   handle. Nested handles reached through it stay wrapped.
//! - `RetryPolicy` - Immutable retry configuration shared by a proxy chain
//! - `Transient` - Classifies the errors that are worth retrying
//! - `DurableCursor` - Cursor that resumes where it left off after a failover
//!
//! # Example
//!
//! ```ignore
//! use mongo_proxy::{RetryPolicy, RetryProxy};
//!
//! let client = RetryProxy::with_policy(client, RetryPolicy::default());
//! let users = client.member(|c| c.database("app").collection("users"));
//!
//! // Retried on AutoReconnect-style failures, up to five times
//! let inserted = users.call(|coll| coll.insert_one(&doc))?;
//! ```

mod backoff;
mod classify;
mod disconnect;
pub mod durable;
mod error;
mod millis;
#[cfg(feature = "mongodb")]
pub mod mongodb;
mod policy;
pub mod proxy;

pub use backoff::Backoff;
pub use classify::Transient;
pub use disconnect::{BoxError, Disconnect};
pub use durable::{DurableConfig, DurableCursor, ResumableQuery};
pub use error::{DurableError, PolicyError};
pub use policy::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_DELAY, DEFAULT_DISCONNECT_ON_TIMEOUT, DEFAULT_MAX_RETRIES,
    RetryPolicy,
};
pub use proxy::retry::{autoretry, autoretry_async, autoretry_async_with, autoretry_with};
pub use proxy::{EventHook, Method, RetryEvent, RetryProxy};
