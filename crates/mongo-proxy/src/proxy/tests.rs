//! Tests for the retry proxy

use super::*;
use crate::BoxError;
use crate::proxy::retry::{autoretry, autoretry_with};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
enum MockError {
    #[error("not master and slaveOk=false")]
    AutoReconnect,
    #[error("duplicate key")]
    DuplicateKey,
}

impl Transient for MockError {
    fn is_transient_reconnect(&self) -> bool {
        matches!(self, MockError::AutoReconnect)
    }
}

/// Server state shared by every handle derived from a mock client
#[derive(Default)]
struct MockServer {
    script: Mutex<VecDeque<MockError>>,
    calls: AtomicU32,
    disconnects: AtomicU32,
    fail_disconnect: AtomicBool,
}

impl MockServer {
    fn with_failures(failures: impl IntoIterator<Item = MockError>) -> Arc<Self> {
        let server = Self::default();
        server.script.lock().unwrap().extend(failures);
        Arc::new(server)
    }

    fn respond(&self) -> Result<u32, MockError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(call),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct MockClient {
    host: String,
    server: Arc<MockServer>,
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer").finish_non_exhaustive()
    }
}

impl MockClient {
    fn new(server: Arc<MockServer>) -> Self {
        Self {
            host: "rs0/localhost:27017".into(),
            server,
        }
    }

    fn ping(&self) -> Result<u32, MockError> {
        self.server.respond()
    }

    fn database(&self, name: &str) -> MockDatabase {
        MockDatabase {
            name: name.to_string(),
            server: self.server.clone(),
        }
    }
}

impl Disconnect for MockClient {
    fn disconnect(&self) -> Result<(), BoxError> {
        self.server.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.server.fail_disconnect.load(Ordering::SeqCst) {
            Err("socket already closed".into())
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct MockDatabase {
    name: String,
    server: Arc<MockServer>,
}

impl MockDatabase {
    fn collection(&self, name: &str) -> MockCollection {
        MockCollection {
            full_name: format!("{}.{}", self.name, name),
            server: self.server.clone(),
        }
    }

    fn checked_collection(&self, name: &str) -> Result<MockCollection, String> {
        if name.is_empty() {
            return Err("collection names cannot be empty".into());
        }
        Ok(self.collection(name))
    }
}

#[derive(Debug)]
struct MockCollection {
    full_name: String,
    server: Arc<MockServer>,
}

impl MockCollection {
    fn insert(&self, doc: &str) -> Result<String, MockError> {
        let call = self.server.respond()?;
        Ok(format!("{}#{}:{}", self.full_name, call, doc))
    }

    async fn insert_async(&self, doc: String) -> Result<String, MockError> {
        tokio::task::yield_now().await;
        self.insert(&doc)
    }
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries).with_delay(Duration::ZERO)
}

fn recording_proxy(
    server: Arc<MockServer>,
    policy: RetryPolicy,
) -> (RetryProxy<MockClient>, Arc<Mutex<Vec<RetryEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let proxy = RetryProxy::with_policy(MockClient::new(server), policy)
        .on_event(move |event| sink.lock().unwrap().push(event.clone()));
    (proxy, events)
}

mod member_tests {
    use super::*;

    #[test]
    fn test_get_ref_exposes_target() {
        let proxy = RetryProxy::new(MockClient::new(MockServer::with_failures([])));
        assert_eq!(proxy.get_ref().host, "rs0/localhost:27017");
    }

    #[test]
    fn test_member_shares_policy() {
        let proxy = RetryProxy::with_policy(
            MockClient::new(MockServer::with_failures([])),
            fast_policy(7),
        );
        let db = proxy.member(|c| c.database("app"));
        let users = db.member(|db| db.collection("users"));

        assert_eq!(users.get_ref().full_name, "app.users");
        assert_eq!(users.policy().max_retries(), 7);
        assert!(users.shares_policy_with(&proxy));
        assert!(db.shares_policy_with(&users));
    }

    #[test]
    fn test_member_is_not_cached() {
        let proxy = RetryProxy::new(MockClient::new(MockServer::with_failures([])));
        let first = proxy.member(|c| c.database("app"));
        let second = proxy.member(|c| c.database("app"));

        assert!(!Arc::ptr_eq(first.target(), second.target()));
        assert!(first.shares_policy_with(&second));
    }

    #[test]
    fn test_try_member_propagates_resolution_error() {
        let server = MockServer::with_failures([]);
        let proxy = RetryProxy::with_policy(MockClient::new(server.clone()), fast_policy(3));
        let db = proxy.member(|c| c.database("app"));

        let err = db.try_member(|db| db.checked_collection("")).unwrap_err();
        assert_eq!(err, "collection names cannot be empty");
        assert_eq!(server.calls(), 0);

        let users = db.try_member(|db| db.checked_collection("users")).unwrap();
        assert_eq!(users.get_ref().full_name, "app.users");
    }

    #[test]
    fn test_observer_reaches_members_derived_earlier() {
        let server = MockServer::with_failures(vec![MockError::AutoReconnect; 10]);
        let proxy = RetryProxy::with_policy(MockClient::new(server.clone()), fast_policy(1));
        let users = proxy.member(|c| c.database("app").collection("users"));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let proxy = proxy.on_event(move |event| sink.lock().unwrap().push(event.clone()));

        assert!(users.shares_policy_with(&proxy));
        assert_eq!(users.call(|coll| coll.insert("{}")), Err(MockError::AutoReconnect));
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                RetryEvent::Retrying {
                    attempt: 0,
                    max_retries: 1,
                    delay: Duration::ZERO
                },
                RetryEvent::Exhausted { total_attempts: 2 },
                RetryEvent::Disconnected { succeeded: true },
            ]
        );
    }

    #[test]
    fn test_policies_are_independent_between_roots() {
        let a = RetryProxy::with_policy(MockClient::new(MockServer::with_failures([])), fast_policy(1));
        let b = RetryProxy::with_policy(MockClient::new(MockServer::with_failures([])), fast_policy(9));

        assert!(!a.shares_policy_with(&b));
        assert_eq!(a.policy().max_retries(), 1);
        assert_eq!(b.policy().max_retries(), 9);
    }

    #[test]
    fn test_proxy_debug() {
        let proxy = RetryProxy::new(MockClient::new(MockServer::with_failures([])));
        let debug = format!("{:?}", proxy);
        assert!(debug.contains("RetryProxy"));
        assert!(debug.contains("rs0/localhost:27017"));
        assert!(debug.contains("max_retries"));
    }
}

mod call_tests {
    use super::*;

    #[test]
    fn test_success_passthrough() {
        let server = MockServer::with_failures([]);
        let (proxy, events) = recording_proxy(server.clone(), fast_policy(5));

        assert_eq!(proxy.call(|c| c.ping()), Ok(0));
        assert_eq!(server.calls(), 1);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retries_then_succeeds() {
        let server = MockServer::with_failures([MockError::AutoReconnect, MockError::AutoReconnect]);
        let (proxy, events) = recording_proxy(server.clone(), fast_policy(3));

        assert_eq!(proxy.call(|c| c.ping()), Ok(2));
        assert_eq!(server.calls(), 3);
        assert_eq!(server.disconnects(), 0);

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                RetryEvent::Retrying {
                    attempt: 0,
                    max_retries: 3,
                    delay: Duration::ZERO
                },
                RetryEvent::Retrying {
                    attempt: 1,
                    max_retries: 3,
                    delay: Duration::ZERO
                },
            ]
        );
    }

    #[test]
    fn test_exhaustion_disconnects_once_and_returns_last_error() {
        let server = MockServer::with_failures(vec![MockError::AutoReconnect; 10]);
        let (proxy, events) = recording_proxy(server.clone(), fast_policy(4));

        assert_eq!(proxy.call(|c| c.ping()), Err(MockError::AutoReconnect));
        assert_eq!(server.calls(), 5);
        assert_eq!(server.disconnects(), 1);

        let events = events.lock().unwrap();
        assert_eq!(
            &events[events.len() - 2..],
            &[
                RetryEvent::Exhausted { total_attempts: 5 },
                RetryEvent::Disconnected { succeeded: true },
            ]
        );
    }

    #[test]
    fn test_failed_disconnect_is_swallowed() {
        let server = MockServer::with_failures(vec![MockError::AutoReconnect; 10]);
        server.fail_disconnect.store(true, Ordering::SeqCst);
        let (proxy, events) = recording_proxy(server.clone(), fast_policy(2));

        assert_eq!(proxy.call(|c| c.ping()), Err(MockError::AutoReconnect));
        assert_eq!(server.calls(), 3);
        assert_eq!(server.disconnects(), 1);
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&RetryEvent::Disconnected { succeeded: false })
        );
    }

    #[test]
    fn test_no_disconnect_when_disabled() {
        let server = MockServer::with_failures(vec![MockError::AutoReconnect; 10]);
        let policy = fast_policy(2).with_disconnect_on_timeout(false);
        let (proxy, events) = recording_proxy(server.clone(), policy);

        assert_eq!(proxy.call(|c| c.ping()), Err(MockError::AutoReconnect));
        assert_eq!(server.calls(), 3);
        assert_eq!(server.disconnects(), 0);
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&RetryEvent::Exhausted { total_attempts: 3 })
        );
    }

    #[test]
    fn test_without_disconnect_skips_reset() {
        let server = MockServer::with_failures(vec![MockError::AutoReconnect; 10]);
        let proxy = RetryProxy::without_disconnect(MockClient::new(server.clone()), fast_policy(1));

        assert_eq!(proxy.call(|c| c.ping()), Err(MockError::AutoReconnect));
        assert_eq!(server.calls(), 2);
        assert_eq!(server.disconnects(), 0);
    }

    #[test]
    fn test_zero_retries_calls_once() {
        let server = MockServer::with_failures([MockError::AutoReconnect]);
        let (proxy, _events) = recording_proxy(server.clone(), fast_policy(0));

        assert_eq!(proxy.call(|c| c.ping()), Err(MockError::AutoReconnect));
        assert_eq!(server.calls(), 1);
        assert_eq!(server.disconnects(), 1);
    }

    #[test]
    fn test_non_transient_error_is_not_retried() {
        let server = MockServer::with_failures([MockError::DuplicateKey, MockError::AutoReconnect]);
        let (proxy, events) = recording_proxy(server.clone(), fast_policy(5));

        assert_eq!(proxy.call(|c| c.ping()), Err(MockError::DuplicateKey));
        assert_eq!(server.calls(), 1);
        assert_eq!(server.disconnects(), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_counter_resets_between_invocations() {
        let server = MockServer::with_failures(vec![MockError::AutoReconnect; 4]);
        let (proxy, _events) = recording_proxy(server.clone(), fast_policy(2));

        // Three failures exhaust the first call, the fourth is retried by the second.
        assert_eq!(proxy.call(|c| c.ping()), Err(MockError::AutoReconnect));
        assert_eq!(proxy.call(|c| c.ping()), Ok(4));
        assert_eq!(server.calls(), 5);
    }

    #[test]
    fn test_nested_chain_is_protected() {
        let server = MockServer::with_failures([MockError::AutoReconnect, MockError::AutoReconnect]);
        let (proxy, events) = recording_proxy(server.clone(), fast_policy(3));
        let users = proxy
            .member(|c| c.database("app"))
            .member(|db| db.collection("users"));

        assert_eq!(
            users.call(|coll| coll.insert("{name: 'ada'}")),
            Ok("app.users#2:{name: 'ada'}".to_string())
        );
        assert_eq!(server.calls(), 3);
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_nested_exhaustion_resets_root_client() {
        let server = MockServer::with_failures(vec![MockError::AutoReconnect; 10]);
        let (proxy, _events) = recording_proxy(server.clone(), fast_policy(1));
        let users = proxy.member(|c| c.database("app").collection("users"));

        assert_eq!(users.call(|coll| coll.insert("{}")), Err(MockError::AutoReconnect));
        assert_eq!(server.calls(), 2);
        assert_eq!(server.disconnects(), 1);
    }

    #[test]
    fn test_sync_pauses_follow_backoff() {
        let server = MockServer::with_failures([MockError::AutoReconnect, MockError::AutoReconnect]);
        let policy = RetryPolicy::new(3).with_delay(Duration::from_millis(10));
        let proxy = RetryProxy::with_policy(MockClient::new(server.clone()), policy);

        let start = std::time::Instant::now();
        assert_eq!(proxy.call(|c| c.ping()), Ok(2));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}

mod method_tests {
    use super::*;

    #[test]
    fn test_method_forwards_arguments() {
        let server = MockServer::with_failures([MockError::AutoReconnect]);
        let proxy = RetryProxy::with_policy(MockClient::new(server.clone()), fast_policy(3));
        let users = proxy.member(|c| c.database("app").collection("users"));
        let insert = users.method(|coll: &MockCollection, doc: String| coll.insert(&doc));

        assert_eq!(insert.call("a".to_string()), Ok("app.users#1:a".to_string()));
        assert_eq!(insert.call("b".to_string()), Ok("app.users#2:b".to_string()));
        assert_eq!(server.calls(), 3);
        assert_eq!(insert.policy().max_retries(), 3);
    }

    #[test]
    fn test_method_propagates_non_transient() {
        let server = MockServer::with_failures([MockError::DuplicateKey]);
        let proxy = RetryProxy::with_policy(MockClient::new(server.clone()), fast_policy(3));
        let insert = proxy
            .member(|c| c.database("app").collection("users"))
            .method(|coll: &MockCollection, doc: &'static str| coll.insert(doc));

        assert_eq!(insert.call("{}"), Err(MockError::DuplicateKey));
        assert_eq!(server.calls(), 1);
    }

    #[test]
    fn test_method_infers_target_parameter() {
        let server = MockServer::with_failures([MockError::AutoReconnect]);
        let proxy = RetryProxy::with_policy(MockClient::new(server.clone()), fast_policy(1));
        let users = proxy.member(|c| c.database("app").collection("users"));
        let insert = users.method(|coll, doc: String| coll.insert(&doc));

        assert_eq!(insert.call("a".to_string()), Ok("app.users#1:a".to_string()));
        assert_eq!(server.calls(), 2);
    }
}

mod async_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_call_async_backoff_timing() {
        let server = MockServer::with_failures([MockError::AutoReconnect, MockError::AutoReconnect]);
        let policy = RetryPolicy::new(3)
            .with_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0);
        let (proxy, events) = recording_proxy(server.clone(), policy);
        let users = proxy.member(|c| c.database("app").collection("users"));

        let start = tokio::time::Instant::now();
        let result = users
            .call_async(|coll| async move { coll.insert_async("{}".into()).await })
            .await;
        let elapsed = start.elapsed();

        assert_eq!(result, Ok("app.users#2:{}".to_string()));
        assert_eq!(server.calls(), 3);
        assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3_100), "elapsed {:?}", elapsed);

        let delays: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                RetryEvent::Retrying { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_async_exhaustion() {
        let server = MockServer::with_failures(vec![MockError::AutoReconnect; 10]);
        let policy = RetryPolicy::new(2).with_delay(Duration::from_millis(100));
        let (proxy, _events) = recording_proxy(server.clone(), policy);

        let start = tokio::time::Instant::now();
        let result = proxy
            .call_async(|client| async move { client.ping() })
            .await;

        assert_eq!(result, Err(MockError::AutoReconnect));
        assert_eq!(server.calls(), 3);
        assert_eq!(server.disconnects(), 1);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_method_call_async() {
        let server = MockServer::with_failures([MockError::AutoReconnect]);
        let proxy = RetryProxy::with_policy(MockClient::new(server.clone()), fast_policy(2));
        let insert = proxy
            .member(|c| c.database("app").collection("logs"))
            .method_async(|coll, doc: String| async move { coll.insert_async(doc).await });

        assert_eq!(
            insert.call_async("x".to_string()).await,
            Ok("app.logs#1:x".to_string())
        );
    }
}

mod autoretry_tests {
    use super::*;

    #[test]
    fn test_autoretry_without_proxy() {
        let server = MockServer::with_failures([MockError::AutoReconnect]);
        assert_eq!(autoretry(&fast_policy(2), || server.respond()), Ok(1));
        assert_eq!(server.calls(), 2);
    }

    #[test]
    fn test_autoretry_with_custom_predicate() {
        let server = MockServer::with_failures([MockError::DuplicateKey, MockError::DuplicateKey]);
        let result = autoretry_with(
            &fast_policy(3),
            |err: &MockError| *err == MockError::DuplicateKey,
            || server.respond(),
        );

        assert_eq!(result, Ok(2));
        assert_eq!(server.calls(), 3);
    }

    #[test]
    fn test_autoretry_ignores_disconnect_flag() {
        let server = MockServer::with_failures(vec![MockError::AutoReconnect; 5]);
        let result = autoretry(&fast_policy(1), || server.respond());

        assert_eq!(result, Err(MockError::AutoReconnect));
        assert_eq!(server.calls(), 2);
        assert_eq!(server.disconnects(), 0);
    }
}
