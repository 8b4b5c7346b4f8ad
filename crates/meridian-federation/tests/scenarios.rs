//! End-to-end federation flows on the in-process store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use meridian_common::models::{DeliveryReceipt, DeliveryStatus, KeyChangePolicy, MessageKind, PeerStatus};
use meridian_db::memory::MemoryStore;
use meridian_db::PeerStore;
use meridian_federation::{
    registry::PeerContact, signatures::sign_request, AttemptOutcome, DeliveryEngine, DeliveryError,
    DeliveryTransport, FederatedMessage, FederationError, HandshakeRequest, InboundGate, KeyAuditor,
    KeyResolver, PeerRegistry, RetryPolicy, ServerKeyPair, TrustPolicy, TrustStateMachine,
};

const LOCAL: &str = "local.example";

/// Hangs past the attempt timeout on the first `hang_first` calls.
struct SlowThenFast {
    calls: AtomicUsize,
    hang_first: usize,
}

#[async_trait]
impl DeliveryTransport for SlowThenFast {
    async fn deliver(&self, _receipt: &DeliveryReceipt) -> Result<(), DeliveryError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.hang_first {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(())
    }
}

struct NoKeys;

#[async_trait]
impl KeyResolver for NoKeys {
    async fn resolve_key(&self, _server: &str, key_id: &str) -> Result<String, FederationError> {
        Err(FederationError::KeyNotFound(key_id.to_owned()))
    }
}

struct Node {
    store: Arc<MemoryStore>,
    trust: Arc<TrustStateMachine>,
    auditor: Arc<KeyAuditor>,
    registry: PeerRegistry,
    gate: InboundGate,
}

async fn node(policy: KeyChangePolicy) -> Node {
    let store = Arc::new(MemoryStore::new());
    let local = PeerRegistry::register_local(store.as_ref(), LOCAL, &ServerKeyPair::generate())
        .await
        .unwrap();
    let trust = Arc::new(TrustStateMachine::new(store.clone(), local.id));
    let auditor = Arc::new(KeyAuditor::new(store.clone(), store.clone(), policy));
    let registry = PeerRegistry::new(store.clone(), trust.clone(), auditor.clone());
    let gate = InboundGate::new(LOCAL, store.clone(), trust.clone(), auditor.clone(), Arc::new(NoKeys));
    Node { store, trust, auditor, registry, gate }
}

fn engine(node: &Node, transport: Arc<dyn DeliveryTransport>, timeout: Duration) -> DeliveryEngine {
    DeliveryEngine::new(
        node.store.clone(),
        Arc::new(TrustPolicy::new(node.store.clone(), node.trust.clone())),
        transport,
        LOCAL,
        timeout,
        RetryPolicy::default(),
    )
}

fn handshake(domain: &str, kp: &ServerKeyPair) -> HandshakeRequest {
    HandshakeRequest {
        server_name: domain.into(),
        public_key: kp.public_key_base64(),
        software_name: Some("meridian/test".into()),
        protocol_version: "1.0".into(),
        capabilities: vec!["messages".into()],
    }
}

#[tokio::test]
async fn handshake_approve_deliver_with_one_timeout() {
    let n = node(KeyChangePolicy::Block).await;
    let p1 = ServerKeyPair::generate();

    // p1 handshakes and lands in pending.
    let req = handshake("p1.example", &p1);
    let body = serde_json::to_value(&req).unwrap();
    let auth = sign_request(&p1, "p1.example", LOCAL, "POST", "/_meridian/federation/v1/handshake", Some(&body));
    n.gate
        .authenticate_handshake(Some(auth.to_header().as_str()), "POST", "/_meridian/federation/v1/handshake", &body, &req)
        .unwrap();
    let contact = n.registry.record_contact(PeerContact::from(&req)).await.unwrap();
    assert_eq!(contact.relationship.status, PeerStatus::Pending);

    let transport = Arc::new(SlowThenFast { calls: AtomicUsize::new(0), hang_first: 1 });
    let engine = engine(&n, transport, Duration::from_millis(50));
    let payload = serde_json::to_value(FederatedMessage::user_content("m1", None, None, json!({ "body": "hi" }))).unwrap();

    // Not federatable until approved.
    assert!(matches!(
        engine.enqueue("m1", "p1.example", payload.clone()).await.unwrap_err(),
        FederationError::PeerNotFederatable(_)
    ));

    let rel = n.trust.approve(contact.instance.id).await.unwrap();
    assert_eq!(rel.status, PeerStatus::Active);

    let receipt = engine.enqueue("m1", "p1.example", payload).await.unwrap();
    assert_eq!(receipt.status, DeliveryStatus::Pending);

    let AttemptOutcome::Failed { receipt: failed, retry_at } = engine.attempt(receipt.id).await.unwrap() else {
        panic!("timeout should fail the attempt");
    };
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(retry_at.is_some(), "timeouts are transient");

    let retrying = engine.retry(receipt.id).await.unwrap();
    assert_eq!(retrying.status, DeliveryStatus::Retrying);
    assert_eq!(retrying.attempts, 2);

    let AttemptOutcome::Delivered(done) = engine.attempt(receipt.id).await.unwrap() else {
        panic!("second attempt should deliver");
    };
    assert_eq!(done.attempts, 2);
    assert!(done.delivered_at.is_some());
}

#[tokio::test]
async fn changed_key_opens_one_audit_entry_until_acknowledged() {
    let n = node(KeyChangePolicy::Block).await;
    let key_a = ServerKeyPair::generate();
    let key_b = ServerKeyPair::generate();

    let p2 = n.registry.record_contact(PeerContact::from(&handshake("p2.example", &key_a))).await.unwrap();
    n.trust.approve(p2.instance.id).await.unwrap();

    let signed_by_b = meridian_federation::VerifiedOrigin {
        origin: "p2.example".into(),
        key_id: key_b.key_id.clone(),
        public_key: key_b.public_key_base64(),
        fingerprint: key_b.fingerprint(),
    };
    for _ in 0..3 {
        assert!(matches!(
            n.gate.admit(&signed_by_b, MessageKind::UserContent).await.unwrap_err(),
            FederationError::KeyChangePending(_)
        ));
    }

    let open = n.auditor.list(Some(p2.instance.id), true).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].old_fingerprint, key_a.fingerprint());
    assert_eq!(open[0].new_fingerprint, key_b.fingerprint());

    let pinned = n.store.get_instance(p2.instance.id).await.unwrap().unwrap();
    assert_eq!(pinned.public_key_fingerprint, Some(key_a.fingerprint()));

    let admin = uuid::Uuid::now_v7();
    n.auditor.acknowledge(open[0].id, admin).await.unwrap();
    let pinned = n.store.get_instance(p2.instance.id).await.unwrap().unwrap();
    assert_eq!(pinned.public_key_fingerprint, Some(key_b.fingerprint()));

    assert!(n.gate.admit(&signed_by_b, MessageKind::UserContent).await.is_ok());
    assert!(matches!(
        n.auditor.acknowledge(open[0].id, admin).await.unwrap_err(),
        FederationError::AlreadyAcknowledged(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempt_and_retry_never_double_count() {
    let n = node(KeyChangePolicy::Block).await;
    let p1 = n.registry.record_contact(PeerContact::from(&handshake("p1.example", &ServerKeyPair::generate()))).await.unwrap();
    n.trust.approve(p1.instance.id).await.unwrap();

    let transport = Arc::new(SlowThenFast { calls: AtomicUsize::new(0), hang_first: 0 });
    let engine = Arc::new(engine(&n, transport, Duration::from_secs(5)));

    for i in 0..50 {
        let r = engine.enqueue(&format!("m{i}"), "p1.example", json!({})).await.unwrap();

        let mut tasks = Vec::new();
        for j in 0..4 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                if j % 2 == 0 {
                    matches!(engine.attempt(r.id).await, Ok(AttemptOutcome::Delivered(_)))
                } else {
                    let _ = engine.retry(r.id).await;
                    false
                }
            }));
        }
        let mut delivered = 0;
        for t in tasks {
            delivered += usize::from(t.await.unwrap());
        }

        let mut current = engine.get(r.id).await.unwrap();
        if current.status == DeliveryStatus::Retrying {
            if let AttemptOutcome::Delivered(d) = engine.attempt(r.id).await.unwrap() {
                delivered += 1;
                current = d;
            }
        }

        assert_eq!(delivered, 1, "receipt {i} delivered {delivered} times");
        assert_eq!(current.status, DeliveryStatus::Delivered);
        assert_eq!(current.attempts, 1, "one logical try for receipt {i}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_of_a_failure_count_once() {
    let n = node(KeyChangePolicy::Block).await;
    let p1 = n.registry.record_contact(PeerContact::from(&handshake("p1.example", &ServerKeyPair::generate()))).await.unwrap();
    n.trust.approve(p1.instance.id).await.unwrap();

    let transport = Arc::new(SlowThenFast { calls: AtomicUsize::new(0), hang_first: 1 });
    let engine = Arc::new(engine(&n, transport, Duration::from_millis(20)));
    let r = engine.enqueue("m1", "p1.example", json!({})).await.unwrap();
    assert!(matches!(engine.attempt(r.id).await.unwrap(), AttemptOutcome::Failed { .. }));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move { engine.retry(r.id).await.is_ok() }));
    }
    let mut won = 0;
    for t in tasks {
        won += usize::from(t.await.unwrap());
    }
    assert_eq!(won, 1);
    assert_eq!(engine.get(r.id).await.unwrap().attempts, 2);
}

#[tokio::test]
async fn blocking_a_peer_drops_its_pending_receipts() {
    let n = node(KeyChangePolicy::Block).await;
    let p1 = n.registry.record_contact(PeerContact::from(&handshake("p1.example", &ServerKeyPair::generate()))).await.unwrap();
    n.trust.approve(p1.instance.id).await.unwrap();

    let transport = Arc::new(SlowThenFast { calls: AtomicUsize::new(0), hang_first: 0 });
    let engine = engine(&n, transport.clone(), Duration::from_secs(5));
    let r = engine.enqueue("m1", "p1.example", json!({})).await.unwrap();

    n.trust
        .set_control(p1.instance.id, meridian_common::models::ControlAction::Block, None, None)
        .await
        .unwrap();

    let AttemptOutcome::Dropped(dropped) = engine.attempt(r.id).await.unwrap() else {
        panic!("blocked target should be dropped");
    };
    assert!(dropped.permanent_failure);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
}
