//! Delivery-path scenarios wired through the public dispatcher and session
//! APIs, with in-process stand-ins for presence, membership and the
//! cross-instance bus.

use async_trait::async_trait;
use chrono::Utc;
use event_schema::{EventEnvelope, EventType, MessageRecord, MessageSentEvent};
use realtime_delivery_service::delivery::{
    Dispatcher, InstanceBus, MembershipCache, MembershipSource, PresenceLookup,
};
use realtime_delivery_service::error::AppResult;
use realtime_delivery_service::session::{Registry, Session};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

struct StaticMembership(Vec<Uuid>);

#[async_trait]
impl MembershipSource for StaticMembership {
    async fn conversation_members(&self, _conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(self.0.clone())
    }
}

struct StaticPresence(HashMap<Uuid, HashMap<String, String>>);

#[async_trait]
impl PresenceLookup for StaticPresence {
    async fn user_devices(&self, user_id: Uuid) -> AppResult<HashMap<String, String>> {
        Ok(self.0.get(&user_id).cloned().unwrap_or_default())
    }
}

/// Records published payloads so a second "instance" can consume them.
#[derive(Default)]
struct CapturingBus {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl InstanceBus for CapturingBus {
    async fn publish(&self, instance_id: &str, payload: &[u8]) -> AppResult<()> {
        self.published
            .lock()
            .unwrap()
            .push((instance_id.to_string(), payload.to_vec()));
        Ok(())
    }
}

fn message_record_bytes(conversation_id: Uuid, sender: Uuid, sequence: i64) -> Vec<u8> {
    let event = MessageSentEvent {
        message: MessageRecord {
            message_id: Uuid::new_v4(),
            conversation_id,
            sender_user_id: sender,
            sequence,
            message_type: "text".into(),
            content: format!("message {sequence}"),
            metadata: None,
            sent_at: Utc::now(),
            deleted_at: None,
        },
    };
    EventEnvelope::new(EventType::MessageSent, Utc::now(), &event)
        .unwrap()
        .to_bytes()
        .unwrap()
}

fn replay_frame(conversation_id: Uuid, sender: Uuid, sequence: i64) -> String {
    String::from_utf8(message_record_bytes(conversation_id, sender, sequence)).unwrap()
}

fn sequence_of(frame: &str) -> i64 {
    EventEnvelope::from_bytes(frame.as_bytes())
        .unwrap()
        .message_sequence()
}

fn dispatcher_for(
    registry: Arc<Registry>,
    members: Vec<Uuid>,
    devices: HashMap<Uuid, HashMap<String, String>>,
    bus: Arc<CapturingBus>,
    instance_id: &str,
) -> Dispatcher {
    Dispatcher::new(
        registry,
        Arc::new(MembershipCache::new()),
        Arc::new(StaticPresence(devices)),
        bus,
        Arc::new(StaticMembership(members)),
        instance_id.to_string(),
    )
}

/// A reconnect after missing 6..=8: the replay path pushes those while live
/// events 9..=11 arrive concurrently and are buffered. After the ready
/// transition the device observes 6..=11 strictly in order.
#[tokio::test]
async fn resume_replays_then_flushes_buffered_live_events_in_order() {
    let conversation = Uuid::new_v4();
    let sender = Uuid::new_v4();
    let receiver = Uuid::new_v4();

    let registry = Arc::new(Registry::new());
    let (session, mut rx) = Session::new(receiver, "d2".into(), 64);
    registry.add(session.clone());

    let mut devices = HashMap::new();
    devices.insert(
        receiver,
        HashMap::from([("d2".to_string(), "inst-a".to_string())]),
    );
    let bus = Arc::new(CapturingBus::default());
    let dispatcher = dispatcher_for(
        registry.clone(),
        vec![receiver],
        devices,
        bus,
        "inst-a",
    );

    // Live events land while the session is still resuming.
    for sequence in [9i64, 10, 11] {
        let record = message_record_bytes(conversation, sender, sequence);
        dispatcher.handle(&record).await;
    }
    assert!(rx.try_recv().is_err(), "nothing delivered before ready");

    // Replay of the missed range, as the resume path emits it.
    for sequence in [6i64, 7, 8] {
        session.try_send(&replay_frame(conversation, sender, sequence));
    }

    session.flush_buffer_sorted();

    let mut observed = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        observed.push(sequence_of(&frame));
    }
    assert_eq!(observed, vec![6, 7, 8, 9, 10, 11]);
}

/// Send on instance A, recipient connected to instance B: A publishes the
/// raw envelope on B's channel exactly once, and B's dispatcher delivers
/// exactly one frame to the device.
#[tokio::test]
async fn cross_instance_event_reaches_remote_device_exactly_once() {
    let conversation = Uuid::new_v4();
    let sender = Uuid::new_v4();
    let receiver = Uuid::new_v4();

    // Instance A: no local sessions; the receiver's device lives on B.
    let mut devices = HashMap::new();
    devices.insert(
        receiver,
        HashMap::from([("d2".to_string(), "inst-b".to_string())]),
    );
    let bus_a = Arc::new(CapturingBus::default());
    let dispatcher_a = dispatcher_for(
        Arc::new(Registry::new()),
        vec![sender, receiver],
        devices,
        bus_a.clone(),
        "inst-a",
    );

    let record = message_record_bytes(conversation, sender, 1);
    dispatcher_a.handle(&record).await;

    let published = bus_a.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "inst-b");

    // Instance B: consumes the bus payload and delivers locally only.
    let registry_b = Arc::new(Registry::new());
    let (session, mut rx) = Session::new(receiver, "d2".into(), 64);
    session.flush_buffer_sorted();
    registry_b.add(session);

    let bus_b = Arc::new(CapturingBus::default());
    let dispatcher_b = dispatcher_for(
        registry_b,
        vec![sender, receiver],
        HashMap::new(),
        bus_b.clone(),
        "inst-b",
    );

    dispatcher_b.deliver_remote(&published[0].1).await;

    let frame = rx.try_recv().expect("device received the frame");
    assert_eq!(sequence_of(&frame), 1);
    assert!(rx.try_recv().is_err(), "exactly one frame");
    // The remote path never forwards again.
    assert!(bus_b.published.lock().unwrap().is_empty());
}

/// Backpressure: a session whose queue fills is closed rather than losing
/// a frame; the client reconnects and resumes.
#[tokio::test]
async fn overflowing_session_is_dropped_not_reordered() {
    let conversation = Uuid::new_v4();
    let sender = Uuid::new_v4();
    let receiver = Uuid::new_v4();

    let registry = Arc::new(Registry::new());
    let (session, mut rx) = Session::new(receiver, "d1".into(), 2);
    session.flush_buffer_sorted();
    registry.add(session.clone());

    let mut devices = HashMap::new();
    devices.insert(
        receiver,
        HashMap::from([("d1".to_string(), "inst-a".to_string())]),
    );
    let dispatcher = dispatcher_for(
        registry,
        vec![receiver],
        devices,
        Arc::new(CapturingBus::default()),
        "inst-a",
    );

    for sequence in 1..=3i64 {
        let record = message_record_bytes(conversation, sender, sequence);
        dispatcher.handle(&record).await;
    }

    assert!(session.is_closed());
    // The frames that made it are a prefix, never a subsequence with gaps.
    let mut delivered = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        delivered.push(sequence_of(&frame));
    }
    assert_eq!(delivered, vec![1, 2]);
}
