//! End-to-end relay scenarios against a scripted in-memory transport.

use async_trait::async_trait;
use forwarder::{
    Admission, ForwardingRule, RelayEngine, RelayError, RelayEvent, RelayEventKind, RelayPolicy,
    RuleStore, SkipReason, TaskState, Transport, TransportError, TransportMeta,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify, Semaphore};

/// Records every call; answers from a script, then with the fallback. With a gate, each
/// call waits for one permit after recording itself.
struct ScriptedTransport {
    calls: Mutex<Vec<(String, String)>>,
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    fallback: Result<(), TransportError>,
    gate: Option<Arc<Semaphore>>,
    entered: Arc<Notify>,
}

impl ScriptedTransport {
    fn ok() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(()),
            gate: None,
            entered: Arc::new(Notify::new()),
        }
    }

    fn failing(code: &str) -> Self {
        Self {
            fallback: Err(TransportError::new(code, "scripted failure")),
            ..Self::ok()
        }
    }

    fn script(self, answers: Vec<Result<(), TransportError>>) -> Self {
        *self.script.lock().unwrap() = answers.into();
        self
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn send(&self, target: &str, body: &str) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((target.to_string(), body.to_string()));
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

fn policy() -> RelayPolicy {
    RelayPolicy {
        workers: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        send_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_millis(200),
        ..RelayPolicy::default()
    }
}

fn raw(sender: &str, body: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "sender": sender, "body": body })).unwrap()
}

fn engine_with(transport: Arc<ScriptedTransport>, policy: RelayPolicy) -> RelayEngine {
    RelayEngine::new(Arc::new(RuleStore::new()), transport, policy)
}

async fn next_event(rx: &mut broadcast::Receiver<RelayEvent>, kind: RelayEventKind) -> RelayEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ev = rx.recv().await.expect("event channel open");
            if ev.kind == kind {
                return ev;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {:?} event within 5s", kind))
}

fn queued_id(admission: Admission) -> String {
    match admission {
        Admission::Queued(id) => id,
        other => panic!("expected queued, got {:?}", other),
    }
}

#[tokio::test]
async fn enabled_rule_delivers_body_to_target() {
    let transport = Arc::new(ScriptedTransport::ok());
    let engine = engine_with(transport.clone(), policy());
    engine.set_rule("+15551234", true, None).unwrap();
    let mut events = engine.subscribe();
    engine.start().await;

    let admission = engine
        .on_message_received(&raw("+15559999", "hello"), TransportMeta::now())
        .await
        .unwrap();
    let id = queued_id(admission);

    let delivered = next_event(&mut events, RelayEventKind::Delivered).await;
    assert_eq!(delivered.task_id.as_deref(), Some(id.as_str()));
    assert_eq!(delivered.target.as_deref(), Some("+15551234"));
    assert_eq!(delivered.sender, "+15559999");
    assert_eq!(
        transport.calls(),
        vec![("+15551234".to_string(), "hello".to_string())]
    );
    assert_eq!(engine.task(&id).await.unwrap().state, TaskState::Delivered);
    engine.shutdown().await;
}

#[tokio::test]
async fn disabled_rule_skips_without_queueing() {
    let transport = Arc::new(ScriptedTransport::ok());
    let engine = engine_with(transport.clone(), policy());
    engine.set_rule("+15551234", false, None).unwrap();
    let mut events = engine.subscribe();
    engine.start().await;

    let admission = engine
        .on_message_received(&raw("+15559999", "hello"), TransportMeta::now())
        .await
        .unwrap();
    assert_eq!(admission, Admission::Skipped(SkipReason::Disabled));
    let skipped = next_event(&mut events, RelayEventKind::Skipped).await;
    assert_eq!(skipped.task_id, None);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let stats = engine.stats().await;
    assert_eq!(stats.queued, 0);
    assert!(engine.tasks().await.is_empty());
    assert!(transport.calls().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn enabled_rule_without_target_skips() {
    let transport = Arc::new(ScriptedTransport::ok());
    let rules = RuleStore::with_rule(ForwardingRule {
        target: "  ".to_string(),
        enabled: true,
        template: None,
        version: 7,
    });
    let engine = RelayEngine::new(Arc::new(rules), transport.clone(), policy());
    engine.start().await;

    let admission = engine
        .on_message_received(&raw("+15559999", "hello"), TransportMeta::now())
        .await
        .unwrap();
    assert_eq!(admission, Admission::Skipped(SkipReason::NoTarget));
    assert!(engine.tasks().await.is_empty());
    assert!(transport.calls().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn decode_errors_are_returned_to_caller() {
    let engine = engine_with(Arc::new(ScriptedTransport::ok()), policy());
    engine.set_rule("+1", true, None).unwrap();
    let err = engine
        .on_message_received(b"garbage", TransportMeta::now())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Decode(_)));
    let err = engine
        .on_message_received(&raw("+2", ""), TransportMeta::now())
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::Decode(forwarder::DecodeError::Empty));
}

#[tokio::test]
async fn concurrent_duplicates_deliver_once() {
    let transport = Arc::new(ScriptedTransport::ok());
    let engine = Arc::new(engine_with(transport.clone(), policy()));
    engine.set_rule("+15551234", true, None).unwrap();
    let mut events = engine.subscribe();
    engine.start().await;

    let payload = raw("+15559999", "same message");
    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        let payload = payload.clone();
        handles.push(tokio::spawn(async move {
            engine
                .on_message_received(&payload, TransportMeta::now())
                .await
                .unwrap()
        }));
    }
    let mut queued = 0;
    let mut duplicates = 0;
    for h in handles {
        match h.await.unwrap() {
            Admission::Queued(_) => queued += 1,
            Admission::Duplicate { .. } => duplicates += 1,
            other => panic!("unexpected admission {:?}", other),
        }
    }
    assert_eq!(queued, 1);
    assert_eq!(duplicates, 9);

    next_event(&mut events, RelayEventKind::Delivered).await;
    // a redelivery after success is still a duplicate
    let again = engine
        .on_message_received(&payload, TransportMeta::now())
        .await
        .unwrap();
    assert!(matches!(again, Admission::Duplicate { .. }));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.calls().len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn same_sender_order_survives_retry() {
    let transport = Arc::new(
        ScriptedTransport::ok().script(vec![Err(TransportError::new("network", "blip"))]),
    );
    let engine = engine_with(transport.clone(), policy());
    engine.set_rule("+15551234", true, None).unwrap();
    let mut events = engine.subscribe();
    engine.start().await;

    engine
        .on_message_received(&raw("+1", "first"), TransportMeta::now())
        .await
        .unwrap();
    engine
        .on_message_received(&raw("+1", "second"), TransportMeta::now())
        .await
        .unwrap();

    let retry = next_event(&mut events, RelayEventKind::Retrying).await;
    assert_eq!(retry.attempt, 1);
    assert_eq!(retry.delay_ms, Some(10));
    next_event(&mut events, RelayEventKind::Delivered).await;
    next_event(&mut events, RelayEventKind::Delivered).await;

    let bodies: Vec<String> = transport.calls().into_iter().map(|(_, b)| b).collect();
    assert_eq!(bodies, vec!["first", "first", "second"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn rule_update_does_not_touch_in_flight_task() {
    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::ok().gated(gate.clone()));
    let engine = engine_with(transport.clone(), policy());
    engine
        .set_rule("+1000", true, Some("A: {body}".to_string()))
        .unwrap();
    let mut events = engine.subscribe();
    engine.start().await;

    let first = queued_id(
        engine
            .on_message_received(&raw("+1", "one"), TransportMeta::now())
            .await
            .unwrap(),
    );
    transport.entered.notified().await;
    engine
        .set_rule("+2000", true, Some("B: {body}".to_string()))
        .unwrap();
    gate.add_permits(1);
    next_event(&mut events, RelayEventKind::Delivered).await;

    let second = queued_id(
        engine
            .on_message_received(&raw("+1", "two"), TransportMeta::now())
            .await
            .unwrap(),
    );
    gate.add_permits(1);
    next_event(&mut events, RelayEventKind::Delivered).await;

    assert_eq!(
        transport.calls(),
        vec![
            ("+1000".to_string(), "A: one".to_string()),
            ("+2000".to_string(), "B: two".to_string()),
        ]
    );
    assert_eq!(engine.task(&first).await.unwrap().rule_version, 1);
    assert_eq!(engine.task(&second).await.unwrap().rule_version, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn transient_failures_exhaust_retries() {
    let transport = Arc::new(ScriptedTransport::failing("timeout"));
    let engine = engine_with(
        transport.clone(),
        RelayPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            ..policy()
        },
    );
    engine.set_rule("+1", true, None).unwrap();
    let mut events = engine.subscribe();
    engine.start().await;
    let id = queued_id(
        engine
            .on_message_received(&raw("+2", "doomed"), TransportMeta::now())
            .await
            .unwrap(),
    );

    let mut delays = Vec::new();
    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ev = events.recv().await.unwrap();
            match ev.kind {
                RelayEventKind::Retrying => delays.push(ev.delay_ms.unwrap()),
                RelayEventKind::Failed => return ev,
                _ => {}
            }
        }
    })
    .await
    .expect("task failed within 5s");

    assert_eq!(delays, vec![5, 10, 20]);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(failed.attempt, 3);
    assert_eq!(transport.calls().len(), 4);
    let snapshot = engine.task(&id).await.unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    assert!(snapshot.last_error.unwrap().starts_with("retries exhausted"));
    assert_eq!(engine.failed_tasks().await.len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let transport = Arc::new(ScriptedTransport::failing("invalid_destination"));
    let engine = engine_with(transport.clone(), policy());
    engine.set_rule("+1", true, None).unwrap();
    let mut events = engine.subscribe();
    engine.start().await;
    engine
        .on_message_received(&raw("+2", "hi"), TransportMeta::now())
        .await
        .unwrap();
    let failed = next_event(&mut events, RelayEventKind::Failed).await;
    assert_eq!(failed.attempt, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls().len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn full_sender_queue_fails_fast_and_spares_other_senders() {
    let transport = Arc::new(ScriptedTransport::ok());
    let engine = engine_with(
        transport.clone(),
        RelayPolicy {
            per_sender_capacity: 2,
            ..policy()
        },
    );
    engine.set_rule("+1", true, None).unwrap();
    let mut events = engine.subscribe();

    // workers not started yet, so everything stays queued
    for body in ["a1", "a2"] {
        engine
            .on_message_received(&raw("+A", body), TransportMeta::now())
            .await
            .unwrap();
    }
    let err = engine
        .on_message_received(&raw("+A", "a3"), TransportMeta::now())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::QueueFull { ref sender, .. } if sender == "+A"));
    let failed = next_event(&mut events, RelayEventKind::Failed).await;
    assert_eq!(failed.reason.as_deref(), Some("queue full"));

    let b = engine
        .on_message_received(&raw("+B", "b1"), TransportMeta::now())
        .await
        .unwrap();
    assert!(matches!(b, Admission::Queued(_)));
    assert_eq!(engine.stats().await.queued, 3);

    engine.start().await;
    for _ in 0..3 {
        next_event(&mut events, RelayEventKind::Delivered).await;
    }
    let failed = engine.failed_tasks().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].last_error.as_deref(), Some("queue full"));
    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_in_flight_after_grace() {
    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::ok().gated(gate));
    let engine = engine_with(
        transport.clone(),
        RelayPolicy {
            shutdown_grace: Duration::from_millis(50),
            ..policy()
        },
    );
    engine.set_rule("+1", true, None).unwrap();
    let mut events = engine.subscribe();
    engine.start().await;
    let id = queued_id(
        engine
            .on_message_received(&raw("+2", "stuck"), TransportMeta::now())
            .await
            .unwrap(),
    );
    transport.entered.notified().await;

    tokio::time::timeout(Duration::from_secs(2), engine.shutdown())
        .await
        .expect("shutdown completes after grace");
    let failed = next_event(&mut events, RelayEventKind::Failed).await;
    assert_eq!(failed.reason.as_deref(), Some("shutdown"));
    let snapshot = engine.task(&id).await.unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(
        engine
            .on_message_received(&raw("+2", "late"), TransportMeta::now())
            .await
            .unwrap_err(),
        RelayError::ShuttingDown
    );
}

#[tokio::test]
async fn shutdown_fails_tasks_waiting_for_retry() {
    let transport = Arc::new(ScriptedTransport::failing("throttled"));
    let engine = engine_with(
        transport.clone(),
        RelayPolicy {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            ..policy()
        },
    );
    engine.set_rule("+1", true, None).unwrap();
    let mut events = engine.subscribe();
    engine.start().await;
    let id = queued_id(
        engine
            .on_message_received(&raw("+2", "later"), TransportMeta::now())
            .await
            .unwrap(),
    );
    next_event(&mut events, RelayEventKind::Retrying).await;

    tokio::time::timeout(Duration::from_secs(2), engine.shutdown())
        .await
        .expect("shutdown does not wait for the backoff timer");
    let snapshot = engine.task(&id).await.unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.last_error.as_deref(), Some("shutdown"));
    assert_eq!(transport.calls().len(), 1);
}
