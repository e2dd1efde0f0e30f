//! Cursor that survives replica-set failovers
//!
//! A `DurableCursor` iterates the results of a `ResumableQuery`. When the live
//! cursor dies because the primary went away (or the server dropped the
//! cursor), it re-runs the query skipping the records it has already yielded
//! and carries on as if nothing happened.
//!
//! Re-running the query is only equivalent to resuming when the query has a
//! stable order and the matched documents do not change in the meantime.
//!
//! # Example
//!
//! ```ignore
//! use mongo_proxy::{DurableConfig, DurableCursor};
//!
//! let config = DurableConfig::default().with_limit(1_000);
//! for record in DurableCursor::new(EventsSince(checkpoint), config)? {
//!     process(record?);
//! }
//! ```


use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::disconnect::disconnect_quietly;
use crate::{Backoff, Disconnect, DurableError, Transient};

/// A query that can be re-opened at an offset.
pub trait ResumableQuery {
    type Record;
    type Error: Transient;
    type Cursor: Iterator<Item = Result<Self::Record, Self::Error>>;

    /// Open a cursor that skips the first `skip` results and returns at
    /// most `limit` of them. A `limit` of 0 means no limit.
    fn open(&self, skip: u64, limit: u64) -> Result<Self::Cursor, Self::Error>;

    /// Number of results `open(skip, limit)` would return.
    ///
    /// The default walks a fresh cursor; override it when the server can
    /// count on its own.
    fn count(&self, skip: u64, limit: u64) -> Result<u64, Self::Error> {
        let mut total = 0;
        for item in self.open(skip, limit)? {
            item?;
            total += 1;
        }
        Ok(total)
    }
}

/// Reconnect behavior of a `DurableCursor`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableConfig {
    /// How long to keep re-opening the query before giving up
    #[serde(rename = "max_reconnect_time_ms", with = "crate::millis")]
    max_reconnect_time: Duration,
    /// First pause between reconnect attempts
    #[serde(rename = "initial_reconnect_interval_ms", with = "crate::millis")]
    initial_reconnect_interval: Duration,
    /// Upper bound for the doubling pause
    #[serde(rename = "max_interval_ms", with = "crate::millis")]
    max_interval: Duration,
    /// Results to skip before the first one yielded
    skip: u64,
    /// Maximum number of results to yield (0 = unlimited)
    limit: u64,
    /// Reset the client and allow a second round once the budget runs out
    disconnect_on_timeout: bool,
}

impl DurableConfig {
    pub fn with_max_reconnect_time(mut self, time: Duration) -> Self {
        self.max_reconnect_time = time;
        self
    }

    pub fn with_initial_reconnect_interval(mut self, interval: Duration) -> Self {
        self.initial_reconnect_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_disconnect_on_timeout(mut self, disconnect: bool) -> Self {
        self.disconnect_on_timeout = disconnect;
        self
    }

    pub fn max_reconnect_time(&self) -> Duration {
        self.max_reconnect_time
    }

    pub fn initial_reconnect_interval(&self) -> Duration {
        self.initial_reconnect_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn skip(&self) -> u64 {
        self.skip
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn disconnect_on_timeout(&self) -> bool {
        self.disconnect_on_timeout
    }
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            max_reconnect_time: Duration::from_secs(60),
            initial_reconnect_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
            skip: 0,
            limit: 0,
            disconnect_on_timeout: true,
        }
    }
}

/// Iterator over a query's results that resumes after failovers.
pub struct DurableCursor<Q: ResumableQuery> {
    query: Q,
    config: DurableConfig,
    /// Absolute offset of the next record, `skip` included
    counter: u64,
    /// `None` once the limit is used up
    cursor: Option<Q::Cursor>,
    reset: Option<Arc<dyn Disconnect>>,
    /// Set after a reconnect failure; the cursor yields nothing afterwards
    failed: bool,
}

impl<Q: ResumableQuery> DurableCursor<Q> {
    /// Open the query and position the cursor at `config.skip()`.
    ///
    /// Errors opening the first cursor are returned as-is.
    pub fn new(query: Q, config: DurableConfig) -> Result<Self, Q::Error> {
        let mut cursor = Self {
            query,
            counter: config.skip,
            config,
            cursor: None,
            reset: None,
            failed: false,
        };
        cursor.cursor = cursor.fetch_cursor()?;
        Ok(cursor)
    }

    /// Client handle to reset when the reconnect budget runs out.
    pub fn with_reset(mut self, reset: Arc<dyn Disconnect>) -> Self {
        self.reset = Some(reset);
        self
    }

    pub fn config(&self) -> &DurableConfig {
        &self.config
    }

    /// Number of records yielded so far.
    pub fn yielded(&self) -> u64 {
        self.counter - self.config.skip
    }

    /// Open a cursor positioned after everything yielded so far.
    fn fetch_cursor(&self) -> Result<Option<Q::Cursor>, Q::Error> {
        let limit = if self.config.limit > 0 {
            let remaining = self.config.limit.saturating_sub(self.yielded());
            if remaining == 0 {
                return Ok(None);
            }
            remaining
        } else {
            0
        };

        self.query.open(self.counter, limit).map(Some)
    }

    fn reload_and_next(&mut self) -> Result<Option<Q::Record>, Q::Error> {
        self.cursor = self.fetch_cursor()?;
        match self.cursor.as_mut() {
            Some(cursor) => cursor.next().transpose(),
            None => Ok(None),
        }
    }

    /// Count the query's results, recovering from failovers the same way
    /// iteration does.
    ///
    /// Counts from the start of the query unless `with_limit_and_skip` is
    /// set, in which case the configured skip and limit apply. Records
    /// already yielded make no difference.
    pub fn count_documents(
        &mut self,
        with_limit_and_skip: bool,
    ) -> Result<u64, DurableError<Q::Error>> {
        let (skip, limit) = if with_limit_and_skip {
            (self.config.skip, self.config.limit)
        } else {
            (0, 0)
        };

        match self.query.count(skip, limit) {
            Ok(total) => Ok(total),
            Err(err) if err.is_cursor_resumable() => {
                tracing::info!(with_limit_and_skip, "count failed; attempting recovery");
                let total = self.try_reconnect(|this| {
                    this.cursor = this.fetch_cursor()?;
                    this.query.count(skip, limit)
                })?;
                tracing::info!("count after reload successful");
                Ok(total)
            }
            Err(err) => Err(DurableError::Query(err)),
        }
    }

    /// Run `op` until the replica set answers again.
    fn try_reconnect<R>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> Result<R, Q::Error>,
    ) -> Result<R, DurableError<Q::Error>> {
        let start = Instant::now();
        let mut backoff = Backoff::new(self.config.initial_reconnect_interval(), 2.0)
            .with_max(self.config.max_interval());
        let mut budget = self.config.max_reconnect_time();
        let mut disconnected = false;
        let mut round = 1;
        let mut attempts = 0u32;
        let mut total_attempts = 0u32;

        loop {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient_reconnect() => {
                    if start.elapsed() > budget {
                        if !self.config.disconnect_on_timeout || disconnected {
                            break;
                        }
                        if let Some(reset) = &self.reset {
                            disconnect_quietly(&**reset);
                        }
                        disconnected = true;
                        backoff.reset();
                        round = 2;
                        attempts = 0;
                        budget = budget.saturating_mul(2);
                        tracing::warn!("resetting clock for round 2 after disconnecting");
                    }

                    let delay = backoff.next().unwrap_or_default();
                    tracing::warn!(
                        round,
                        attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "AutoReconnecting, try {}.{}",
                        round,
                        attempts
                    );
                    std::thread::sleep(delay);
                    attempts += 1;
                    total_attempts += 1;
                }
                Err(err) => return Err(DurableError::Query(err)),
            }
        }

        tracing::error!(total_attempts, "replica set reconnect failed");
        Err(DurableError::ReconnectFailure {
            attempts: total_attempts,
            elapsed: start.elapsed(),
        })
    }
}

impl<Q: ResumableQuery> Iterator for DurableCursor<Q> {
    type Item = Result<Q::Record, DurableError<Q::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let step = self.cursor.as_mut()?.next()?;
        let record = match step {
            Ok(record) => record,
            Err(err) if err.is_cursor_resumable() => {
                tracing::info!(position = self.counter, "cursor failed; attempting recovery");
                match self.try_reconnect(Self::reload_and_next) {
                    Ok(Some(record)) => {
                        tracing::info!(position = self.counter, "cursor reload successful");
                        record
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        self.failed = err.is_reconnect_failure();
                        return Some(Err(err));
                    }
                }
            }
            Err(err) => return Some(Err(DurableError::Query(err))),
        };

        // Count before returning so a later failure knows how much to skip.
        self.counter += 1;
        Some(Ok(record))
    }
}
