//! In-memory replica set used by the behavioural tests.
//!
//! `ReplicaSet` keeps collections in memory and counts every operation that
//! reaches it. Tests can make it lose its primary for a number of operations
//! (an election), for an unbounded time (an outage), or kill a live cursor at
//! a given position. Handles mirror a typical driver:
//!
//! ```text
//! Client ──database()──▶ Database ──collection()──▶ Collection ──find()──▶ FindQuery
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use mongo_proxy_tests::fixtures::{connect, fast_policy};
//!
//! let (cluster, client) = connect(fast_policy(3));
//! cluster.hold_election(2);
//!
//! let users = client.member(|c| c.database("app").collection("users"));
//! users.call(|coll| coll.count_documents())?;
//! assert_eq!(cluster.operations(), 3);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mongo_proxy::{BoxError, Disconnect, ResumableQuery, RetryEvent, RetryPolicy, RetryProxy, Transient};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Errors raised by the in-memory replica set
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// No primary is available (election in progress or primary gone)
    #[error("not primary and secondaryOk=false")]
    NotPrimary,
    /// Socket dropped under a live operation
    #[error("connection reset by peer")]
    ConnectionReset,
    /// The server no longer knows a live cursor
    #[error("cursor id {0} not found")]
    CursorNotFound(u64),
    /// Insert of an `_id` that already exists
    #[error("E11000 duplicate key error collection: {namespace} dup key: {{ _id: {id} }}")]
    DuplicateKey {
        /// `db.collection` the insert targeted
        namespace: String,
        /// Conflicting id
        id: u32,
    },
    /// Collection looked up without being created first
    #[error("ns not found: {0}")]
    NamespaceNotFound(String),
}

impl Transient for ClusterError {
    fn is_transient_reconnect(&self) -> bool {
        matches!(self, ClusterError::NotPrimary | ClusterError::ConnectionReset)
    }

    fn is_cursor_resumable(&self) -> bool {
        self.is_transient_reconnect() || matches!(self, ClusterError::CursorNotFound(_))
    }
}

/// A stored document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Primary key
    pub id: u32,
    /// Payload
    pub name: String,
}

impl Record {
    /// Create a record.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Records `0..count` named `user-<id>`.
pub fn sample_records(count: u32) -> Vec<Record> {
    (0..count)
        .map(|id| Record::new(id, format!("user-{}", id)))
        .collect()
}

#[derive(Debug, Default)]
struct State {
    /// Operations left to fail before a new primary is elected
    election_ops: u32,
    /// Primary unreachable until restored
    down: bool,
    /// Position at which the next live cursor dies, with the error it raises
    cursor_fault: Option<(u64, ClusterError)>,
    refuse_disconnect: bool,
    collections: BTreeMap<String, Vec<Record>>,
    operations: u32,
    disconnects: u32,
    next_cursor_id: u64,
}

/// In-memory replica set shared by every handle connected to it.
#[derive(Debug, Default)]
pub struct ReplicaSet {
    state: Mutex<State>,
}

impl ReplicaSet {
    /// Start a healthy replica set with no collections.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `failed_ops` operations with `NotPrimary`.
    pub fn hold_election(&self, failed_ops: u32) {
        self.lock().election_ops = failed_ops;
    }

    /// Lose the primary until `restore` is called.
    pub fn take_down(&self) {
        self.lock().down = true;
    }

    /// Bring the primary back.
    pub fn restore(&self) {
        let mut state = self.lock();
        state.down = false;
        state.election_ops = 0;
    }

    /// Make the next live cursor fail with `error` when it reaches
    /// absolute position `position`.
    pub fn fail_cursor_at(&self, position: u64, error: ClusterError) {
        self.lock().cursor_fault = Some((position, error));
    }

    /// Make client disconnects fail.
    pub fn refuse_disconnect(&self) {
        self.lock().refuse_disconnect = true;
    }

    /// Operations that reached the server, failed or not.
    pub fn operations(&self) -> u32 {
        self.lock().operations
    }

    /// Client disconnects requested so far.
    pub fn disconnects(&self) -> u32 {
        self.lock().disconnects
    }

    /// Store `records` without counting an operation.
    pub fn seed(&self, namespace: &str, records: impl IntoIterator<Item = Record>) {
        self.lock()
            .collections
            .entry(namespace.to_string())
            .or_default()
            .extend(records);
    }

    /// Current contents of `namespace`, ordered by id.
    pub fn documents(&self, namespace: &str) -> Vec<Record> {
        let mut records = self
            .lock()
            .collections
            .get(namespace)
            .cloned()
            .unwrap_or_default();
        records.sort_by_key(|record| record.id);
        records
    }

    /// Run one server operation, failing it while there is no primary.
    fn operate<R>(
        &self,
        f: impl FnOnce(&mut State) -> Result<R, ClusterError>,
    ) -> Result<R, ClusterError> {
        let mut state = self.lock();
        state.operations += 1;
        if state.down {
            return Err(ClusterError::NotPrimary);
        }
        if state.election_ops > 0 {
            state.election_ops -= 1;
            return Err(ClusterError::NotPrimary);
        }
        f(&mut state)
    }
}

/// Root client handle
#[derive(Debug, Clone)]
pub struct Client {
    cluster: Arc<ReplicaSet>,
}

impl Client {
    /// Connect to `cluster`.
    pub fn connect(cluster: &Arc<ReplicaSet>) -> Self {
        Self {
            cluster: Arc::clone(cluster),
        }
    }

    /// Database handle; resolving it does not talk to the server.
    pub fn database(&self, name: &str) -> Database {
        Database {
            cluster: Arc::clone(&self.cluster),
            name: name.to_string(),
        }
    }

    /// Names of databases holding at least one collection.
    pub fn list_database_names(&self) -> Result<Vec<String>, ClusterError> {
        self.cluster.operate(|state| {
            let mut names: Vec<String> = state
                .collections
                .keys()
                .filter_map(|ns| ns.split_once('.').map(|(db, _)| db.to_string()))
                .collect();
            names.dedup();
            Ok(names)
        })
    }
}

impl Disconnect for Client {
    fn disconnect(&self) -> Result<(), BoxError> {
        let mut state = self.cluster.lock();
        state.disconnects += 1;
        if state.refuse_disconnect {
            return Err(ClusterError::ConnectionReset.into());
        }
        Ok(())
    }
}

/// Database handle
#[derive(Debug, Clone)]
pub struct Database {
    cluster: Arc<ReplicaSet>,
    name: String,
}

impl Database {
    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collection handle; resolving it does not talk to the server.
    pub fn collection(&self, name: &str) -> Collection {
        Collection {
            cluster: Arc::clone(&self.cluster),
            namespace: format!("{}.{}", self.name, name),
        }
    }

    /// Collection handle for a collection that must already exist.
    ///
    /// Asks the server, so it fails while there is no primary.
    pub fn existing_collection(&self, name: &str) -> Result<Collection, ClusterError> {
        let collection = self.collection(name);
        self.cluster.operate(|state| {
            if state.collections.contains_key(&collection.namespace) {
                Ok(())
            } else {
                Err(ClusterError::NamespaceNotFound(collection.namespace.clone()))
            }
        })?;
        Ok(collection)
    }
}

/// Collection handle
#[derive(Debug, Clone)]
pub struct Collection {
    cluster: Arc<ReplicaSet>,
    namespace: String,
}

impl Collection {
    /// `db.collection`
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Insert `record`, returning its id.
    pub fn insert_one(&self, record: Record) -> Result<u32, ClusterError> {
        self.cluster.operate(|state| {
            let records = state.collections.entry(self.namespace.clone()).or_default();
            if records.iter().any(|existing| existing.id == record.id) {
                return Err(ClusterError::DuplicateKey {
                    namespace: self.namespace.clone(),
                    id: record.id,
                });
            }
            let id = record.id;
            records.push(record);
            Ok(id)
        })
    }

    /// Look a record up by id.
    pub fn find_one(&self, id: u32) -> Result<Option<Record>, ClusterError> {
        self.cluster.operate(|state| {
            Ok(state
                .collections
                .get(&self.namespace)
                .and_then(|records| records.iter().find(|record| record.id == id))
                .cloned())
        })
    }

    /// Number of stored records.
    pub fn count_documents(&self) -> Result<usize, ClusterError> {
        self.cluster
            .operate(|state| Ok(state.collections.get(&self.namespace).map_or(0, Vec::len)))
    }

    /// Async form of `insert_one`.
    pub async fn insert_one_async(&self, record: Record) -> Result<u32, ClusterError> {
        tokio::task::yield_now().await;
        self.insert_one(record)
    }

    /// Async form of `count_documents`.
    pub async fn count_documents_async(&self) -> Result<usize, ClusterError> {
        tokio::task::yield_now().await;
        self.count_documents()
    }

    /// Query over every record, ordered by id.
    pub fn find(&self) -> FindQuery {
        FindQuery {
            collection: self.clone(),
        }
    }
}

/// Re-runnable `find` over a collection
#[derive(Debug, Clone)]
pub struct FindQuery {
    collection: Collection,
}

impl ResumableQuery for FindQuery {
    type Record = Record;
    type Error = ClusterError;
    type Cursor = Cursor;

    fn open(&self, skip: u64, limit: u64) -> Result<Cursor, ClusterError> {
        let cluster = &self.collection.cluster;
        cluster.operate(|state| {
            let mut records = state
                .collections
                .get(&self.collection.namespace)
                .cloned()
                .unwrap_or_default();
            records.sort_by_key(|record| record.id);

            let take = if limit == 0 { usize::MAX } else { limit as usize };
            let records: VecDeque<Record> =
                records.into_iter().skip(skip as usize).take(take).collect();

            state.next_cursor_id += 1;
            tracing::debug!(
                namespace = %self.collection.namespace,
                skip,
                limit,
                cursor_id = state.next_cursor_id,
                "opened cursor"
            );
            Ok(Cursor {
                cluster: Arc::clone(cluster),
                id: state.next_cursor_id,
                position: skip,
                records,
            })
        })
    }

    /// Counted on the server in one operation.
    fn count(&self, skip: u64, limit: u64) -> Result<u64, ClusterError> {
        let collection = &self.collection;
        collection.cluster.operate(|state| {
            let stored = state
                .collections
                .get(&collection.namespace)
                .map_or(0, Vec::len) as u64;
            let total = stored.saturating_sub(skip);
            Ok(if limit == 0 { total } else { total.min(limit) })
        })
    }
}

/// Live server cursor
#[derive(Debug)]
pub struct Cursor {
    cluster: Arc<ReplicaSet>,
    id: u64,
    position: u64,
    records: VecDeque<Record>,
}

impl Iterator for Cursor {
    type Item = Result<Record, ClusterError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.records.is_empty() {
            return None;
        }

        let mut state = self.cluster.lock();
        if state.down {
            return Some(Err(ClusterError::ConnectionReset));
        }
        let fault_here = matches!(
            &state.cursor_fault,
            Some((position, _)) if *position == self.position
        );
        if fault_here {
            if let Some((_, error)) = state.cursor_fault.take() {
                tracing::debug!(cursor_id = self.id, position = self.position, %error, "cursor failed");
                return Some(Err(error));
            }
        }
        drop(state);

        self.position += 1;
        self.records.pop_front().map(Ok)
    }
}

/// Install a test subscriber once; `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Policy with `max_retries` and no pauses.
pub fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries).with_delay(Duration::ZERO)
}

/// A fresh replica set and a proxied client connected to it.
pub fn connect(policy: RetryPolicy) -> (Arc<ReplicaSet>, RetryProxy<Client>) {
    init_tracing();
    let cluster = ReplicaSet::new();
    let client = RetryProxy::with_policy(Client::connect(&cluster), policy);
    (cluster, client)
}

/// Shared log of retry events.
pub type EventLog = Arc<Mutex<Vec<RetryEvent>>>;

/// Attach an event recorder to `client`.
pub fn record_events(client: RetryProxy<Client>) -> (RetryProxy<Client>, EventLog) {
    let log = EventLog::default();
    let sink = Arc::clone(&log);
    let client = client.on_event(move |event| {
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone())
    });
    (client, log)
}

/// Snapshot of a recorded event log.
pub fn events(log: &EventLog) -> Vec<RetryEvent> {
    log.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Pauses announced by `Retrying` events.
pub fn announced_delays(events: &[RetryEvent]) -> Vec<Duration> {
    events
        .iter()
        .filter_map(|event| match event {
            RetryEvent::Retrying { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect()
}
