//! Per-device delivery session.
//!
//! A session owns the bounded outbound queue feeding one WebSocket writer.
//! Until the resume phase completes (`ready`), live events are parked in the
//! resume buffer; the buffer-vs-send decision and the ready transition share
//! one lock so no event can be both buffered and sent live.

pub mod handler;
pub mod heartbeat;
pub mod registry;

pub use handler::SessionServer;
pub use registry::Registry;

use chrono::{DateTime, Utc};
use event_schema::EventEnvelope;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Close code sent to a connection displaced by a newer one for the same
/// (user, device) pair.
pub const CLOSE_SESSION_REPLACED: u16 = 4000;
/// Standard "internal error" close code, used for backpressure overflow.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Standard normal closure, used on server shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

pub const DEFAULT_QUEUE_SIZE: usize = 128;

/// Waits for a `Session::done()` receiver to become `true`, checking the
/// current value first (so an already-closed session is not missed) without
/// holding the borrowed guard across an `.await` — `watch::Receiver::borrow`
/// is not `Send`, which `wait_for` would otherwise hold live inside a
/// `tokio::select!` future.
pub(crate) async fn wait_closed(done: &mut watch::Receiver<bool>) {
    loop {
        if *done.borrow() {
            return;
        }
        if done.changed().await.is_err() {
            return;
        }
    }
}

struct BufferedEvent {
    sequence: i64,
    occurred_at: DateTime<Utc>,
    payload: String,
}

struct ResumeState {
    ready: bool,
    buffer: Vec<BufferedEvent>,
}

pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,

    outbound: mpsc::Sender<String>,
    resume: Mutex<ResumeState>,
    closed: AtomicBool,
    close_reason: Mutex<Option<(u16, String)>>,
    done_tx: watch::Sender<bool>,
}

impl Session {
    /// Returns the session and the receiving half of its outbound queue;
    /// the caller hands the receiver to the write pump.
    pub fn new(
        user_id: Uuid,
        device_id: String,
        queue_size: usize,
    ) -> (std::sync::Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(queue_size.max(1));
        let (done_tx, _) = watch::channel(false);

        let session = std::sync::Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            device_id,
            outbound,
            resume: Mutex::new(ResumeState {
                ready: false,
                buffer: Vec::new(),
            }),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            done_tx,
        });
        (session, rx)
    }

    /// Observes the close transition. Wait with
    /// [`wait_closed`] — that checks the current value first, so a close
    /// that happened before subscription is not missed.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.resume.lock().unwrap().ready
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Park a live event while the resume phase is still running. Returns
    /// false once the session is ready, in which case the caller sends live.
    pub fn buffer(&self, envelope: &EventEnvelope, payload: &str) -> bool {
        let mut resume = self.resume.lock().unwrap();
        if resume.ready {
            return false;
        }
        resume.buffer.push(BufferedEvent {
            sequence: envelope.message_sequence(),
            occurred_at: envelope.occurred_at,
            payload: payload.to_string(),
        });
        true
    }

    /// Complete the resume phase: sort the parked events (message sequence
    /// first, producer timestamp as tie-break) and drain them into the
    /// outbound queue. The ready flip happens under the same lock that
    /// guards `buffer`, closing the buffered-and-also-sent-live race.
    pub fn flush_buffer_sorted(&self) {
        let mut resume = self.resume.lock().unwrap();
        if resume.ready {
            return;
        }

        resume.buffer.sort_by(|a, b| {
            if a.sequence != 0 && b.sequence != 0 && a.sequence != b.sequence {
                a.sequence.cmp(&b.sequence)
            } else {
                a.occurred_at.cmp(&b.occurred_at)
            }
        });

        resume.ready = true;

        for event in resume.buffer.drain(..) {
            if !self.enqueue(event.payload) {
                tracing::warn!(
                    user_id = %self.user_id,
                    device_id = %self.device_id,
                    "failed to enqueue buffered event"
                );
            }
        }
    }

    /// Enqueue one frame. A full queue closes the session: dropping a frame
    /// would break the ordering contract, so the client is forced to resume.
    pub fn try_send(&self, payload: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        self.enqueue(payload.to_string())
    }

    fn enqueue(&self, payload: String) -> bool {
        match self.outbound.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    device_id = %self.device_id,
                    "session backpressure overflow, dropping connection"
                );
                self.close_with_reason(CLOSE_INTERNAL_ERROR, "backpressure overflow");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn close(&self) {
        self.close_with_reason(CLOSE_NORMAL, "server closing");
    }

    /// Idempotent: only the first close wins and signals `done`.
    pub fn close_with_reason(&self, code: u16, reason: &str) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        tracing::info!(
            user_id = %self.user_id,
            device_id = %self.device_id,
            code,
            reason,
            "session closing"
        );
        *self.close_reason.lock().unwrap() = Some((code, reason.to_string()));
        // send_replace stores the value even with no live receivers; a
        // waiter that subscribes later still observes the close through
        // `wait_for`.
        self.done_tx.send_replace(true);
    }

    /// Close code and reason recorded by the first `close_with_reason`.
    pub fn close_frame(&self) -> (u16, String) {
        self.close_reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or((CLOSE_NORMAL, "server closing".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use event_schema::{EventType, MessageRecord, MessageSentEvent, ReadReceiptUpdatedEvent};

    fn message_envelope(sequence: i64, occurred_at: DateTime<Utc>) -> EventEnvelope {
        let event = MessageSentEvent {
            message: MessageRecord {
                message_id: Uuid::new_v4(),
                conversation_id: Uuid::new_v4(),
                sender_user_id: Uuid::new_v4(),
                sequence,
                message_type: "text".into(),
                content: "hi".into(),
                metadata: None,
                sent_at: occurred_at,
                deleted_at: None,
            },
        };
        EventEnvelope::new(EventType::MessageSent, occurred_at, &event).unwrap()
    }

    #[test]
    fn buffered_events_flush_in_sequence_order() {
        let (session, mut rx) = Session::new(Uuid::new_v4(), "d1".into(), 16);
        let now = Utc::now();

        for seq in [3i64, 1, 2] {
            let env = message_envelope(seq, now + Duration::seconds(seq));
            assert!(session.buffer(&env, &format!("payload-{seq}")));
        }

        session.flush_buffer_sorted();
        assert!(session.is_ready());

        for expected in ["payload-1", "payload-2", "payload-3"] {
            assert_eq!(rx.try_recv().unwrap(), expected);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sequenceless_events_sort_by_occurred_at() {
        let (session, mut rx) = Session::new(Uuid::new_v4(), "d1".into(), 16);
        let t1 = Utc::now();
        let t2 = t1 + Duration::milliseconds(200);

        // Message with sequence 2 at t2, receipt (sequence 0) at t1.
        let msg = message_envelope(2, t2);
        assert!(session.buffer(&msg, "payload-msg"));

        let receipt = EventEnvelope::new(
            EventType::ReadReceiptUpdated,
            t1,
            &ReadReceiptUpdatedEvent {
                conversation_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                read_sequence: 1,
            },
        )
        .unwrap();
        assert!(session.buffer(&receipt, "payload-receipt"));

        session.flush_buffer_sorted();

        assert_eq!(rx.try_recv().unwrap(), "payload-receipt");
        assert_eq!(rx.try_recv().unwrap(), "payload-msg");
    }

    #[test]
    fn ready_session_refuses_to_buffer() {
        let (session, mut rx) = Session::new(Uuid::new_v4(), "d1".into(), 16);
        session.flush_buffer_sorted();

        let env = message_envelope(1, Utc::now());
        assert!(!session.buffer(&env, "live"));
        assert!(session.try_send("live"));
        assert_eq!(rx.try_recv().unwrap(), "live");
    }

    #[test]
    fn queue_overflow_closes_the_session() {
        let (session, _rx) = Session::new(Uuid::new_v4(), "d1".into(), 2);
        session.flush_buffer_sorted();

        assert!(session.try_send("a"));
        assert!(session.try_send("b"));
        // Queue full: frame is refused and the session closes.
        assert!(!session.try_send("c"));
        assert!(session.is_closed());
        assert_eq!(session.close_frame().0, CLOSE_INTERNAL_ERROR);
    }

    #[test]
    fn close_is_idempotent_and_keeps_first_reason() {
        let (session, _rx) = Session::new(Uuid::new_v4(), "d1".into(), 2);
        let mut done = session.done();
        assert!(!*done.borrow());

        session.close_with_reason(CLOSE_SESSION_REPLACED, "session_replaced");
        session.close();

        assert!(done.has_changed().unwrap());
        let (code, reason) = session.close_frame();
        assert_eq!(code, CLOSE_SESSION_REPLACED);
        assert_eq!(reason, "session_replaced");
    }

    #[test]
    fn closed_session_refuses_sends() {
        let (session, _rx) = Session::new(Uuid::new_v4(), "d1".into(), 2);
        session.close();
        assert!(!session.try_send("x"));
    }
}
