//! WebSocket session listener.
//!
//! One long-lived connection per device. The handshake presents `user_id`,
//! `device_id` and (when the service validates tokens itself) a bearer
//! token. The first client frame is the resume request; the server replays
//! missed history, flushes the resume buffer, and from then on the
//! connection only carries liveness frames inbound and envelope frames
//! outbound.

use crate::config::{Config, JwtConfig};
use crate::error::{AppError, AppResult};
use crate::models::Message as ChatMessage;
use crate::presence::Presence;
use crate::services::{ConversationService, MessageService};
use crate::session::{heartbeat, wait_closed, Registry, Session};
use event_schema::{EventEnvelope, EventType, MessageSentEvent};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Time allowed for a single frame write.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Read deadline; any inbound frame (pong included) resets it.
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Pings go out at 9/10 of the pong wait.
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Page size used while replaying missed history.
const SYNC_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    /// Conversation -> last sequence the client has seen. Conversations the
    /// client learned about while offline are absent and default to 0.
    last_sequences: HashMap<Uuid, i64>,
}

#[derive(Debug, Clone)]
struct ConnectParams {
    user_id: Uuid,
    device_id: String,
}

pub struct SessionServer {
    registry: Arc<Registry>,
    presence: Arc<Presence>,
    conversations: Arc<ConversationService>,
    messages: Arc<MessageService>,
    config: Arc<Config>,
}

impl SessionServer {
    pub fn new(
        registry: Arc<Registry>,
        presence: Arc<Presence>,
        conversations: Arc<ConversationService>,
        messages: Arc<MessageService>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            presence,
            conversations,
            messages,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let addr = format!("0.0.0.0:{}", self.config.session_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::StartServer(format!("session listener bind: {e}")))?;
        info!(%addr, "session listener started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("session listener stopping");
                        self.registry.close_all();
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    warn!(error = %e, %peer, "session connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "session accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> AppResult<()> {
        let jwt = self.config.jwt.clone();
        let mut params: Option<ConnectParams> = None;

        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match authorize_handshake(req, jwt.as_ref()) {
                Ok(p) => {
                    params = Some(p);
                    Ok(resp)
                }
                Err((status, reason)) => {
                    warn!(status, reason, "session handshake rejected");
                    let mut resp = ErrorResponse::new(Some(reason.to_string()));
                    *resp.status_mut() = status.try_into().unwrap_or(
                        tokio_tungstenite::tungstenite::http::StatusCode::BAD_REQUEST,
                    );
                    Err(resp)
                }
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|e| AppError::Internal(format!("websocket handshake: {e}")))?;
        let params = params.ok_or_else(|| AppError::Internal("handshake params missing".into()))?;

        let (session, outbound_rx) = Session::new(
            params.user_id,
            params.device_id.clone(),
            self.config.session_queue_size,
        );

        // Registered before resume completes: live events start buffering
        // immediately.
        self.registry.add(Arc::clone(&session));

        if let Err(e) = self.presence.register(params.user_id, &params.device_id).await {
            error!(error = %e, user_id = %params.user_id, "presence register failed");
        }
        heartbeat::start(
            Arc::clone(&self.presence),
            params.user_id,
            params.device_id.clone(),
            self.config.heartbeat_interval,
            session.done(),
        );

        crate::metrics::WS_CONNECTIONS.inc();
        info!(user_id = %params.user_id, device_id = %params.device_id, "session connected");

        let (sink, mut ws_stream) = ws.split();
        let writer = tokio::spawn(write_pump(Arc::clone(&session), outbound_rx, sink));

        // The resume exchange runs before the read loop so there is only
        // ever one reader on the stream.
        if self.handle_resume(&session, &mut ws_stream).await.is_ok() {
            self.read_loop(&session, ws_stream).await;
        }

        self.registry.remove(&session);
        session.close();
        if let Err(e) = self.presence.unregister(params.user_id, &params.device_id).await {
            error!(error = %e, user_id = %params.user_id, "presence unregister failed");
        }
        let _ = writer.await;

        crate::metrics::WS_CONNECTIONS.dec();
        info!(user_id = %params.user_id, device_id = %params.device_id, "session disconnected");
        Ok(())
    }

    /// Read the resume request, replay missed history, then flush the
    /// buffer and mark the session ready.
    async fn handle_resume(
        &self,
        session: &Arc<Session>,
        ws_stream: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
    ) -> Result<(), ()> {
        let first = match timeout(PONG_WAIT, ws_stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text,
            _ => {
                session.close();
                return Err(());
            }
        };

        let request: ResumeRequest = match serde_json::from_str(first.as_str()) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, user_id = %session.user_id, "invalid resume request");
                session.close();
                return Err(());
            }
        };

        let mut to_sync = request.last_sequences;

        // Discover conversations the client learned about while offline.
        match self.conversations.list_conversations(session.user_id).await {
            Ok(conversations) => {
                for conversation in conversations {
                    to_sync.entry(conversation.id).or_insert(0);
                }
            }
            Err(e) => {
                error!(error = %e, user_id = %session.user_id, "resume: conversation discovery failed");
            }
        }

        for (conversation_id, last_sequence) in to_sync {
            self.sync_conversation(session, conversation_id, last_sequence)
                .await;
        }

        session.flush_buffer_sorted();
        Ok(())
    }

    /// Page through history after `last_sequence` until a short page.
    async fn sync_conversation(
        &self,
        session: &Arc<Session>,
        conversation_id: Uuid,
        last_sequence: i64,
    ) {
        let mut current = last_sequence;
        loop {
            let page = match self
                .messages
                .sync_messages(conversation_id, session.user_id, current, SYNC_PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!(error = %e, %conversation_id, "resume: sync failed");
                    return;
                }
            };

            if page.is_empty() {
                return;
            }
            let page_len = page.len();

            for message in page {
                if message.sequence > current {
                    current = message.sequence;
                }
                self.send_message_as_event(session, message);
            }

            if (page_len as i64) < SYNC_PAGE_SIZE {
                return;
            }
        }
    }

    /// Replayed messages wear the same envelope the live dispatcher emits,
    /// so the client cannot tell the phases apart.
    fn send_message_as_event(&self, session: &Arc<Session>, message: ChatMessage) {
        let event = MessageSentEvent {
            message: message.to_record(),
        };
        let envelope = match EventEnvelope::new(EventType::MessageSent, message.sent_at, &event) {
            Ok(env) => env,
            Err(e) => {
                error!(error = %e, "resume: envelope build failed");
                return;
            }
        };
        match envelope.to_bytes().map(String::from_utf8) {
            Ok(Ok(payload)) => {
                session.try_send(&payload);
            }
            _ => error!("resume: envelope encode failed"),
        }
    }

    /// Inbound frames are liveness only. Any frame resets the read
    /// deadline; a quiet connection past the pong wait is dropped.
    async fn read_loop(
        &self,
        session: &Arc<Session>,
        mut ws_stream: (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
    ) {
        let mut done = session.done();
        loop {
            tokio::select! {
                _ = wait_closed(&mut done) => {
                    return;
                }
                frame = timeout(PONG_WAIT, ws_stream.next()) => {
                    match frame {
                        // Read deadline expired without a pong.
                        Err(_) => {
                            warn!(user_id = %session.user_id, "session read deadline expired");
                            session.close();
                            return;
                        }
                        Ok(None) | Ok(Some(Err(_))) => return,
                        Ok(Some(Ok(Message::Close(_)))) => return,
                        Ok(Some(Ok(_))) => {}
                    }
                }
            }
        }
    }
}

/// Send frames from the session queue, ping on schedule, and write the
/// close frame recorded by whoever closed the session. Queued frames drain
/// ahead of the close (the select is biased), so a closing session never
/// truncates an already-accepted ordered prefix.
async fn write_pump<S>(session: Arc<Session>, mut outbound: mpsc::Receiver<String>, mut sink: S)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_PERIOD,
        PING_PERIOD,
    );
    let mut done = session.done();

    loop {
        tokio::select! {
            biased;
            maybe = outbound.recv() => {
                match maybe {
                    Some(payload) => {
                        match timeout(WRITE_WAIT, sink.send(Message::Text(payload.into()))).await {
                            Ok(Ok(())) => {}
                            _ => break,
                        }
                    }
                    None => break,
                }
            }
            _ = wait_closed(&mut done) => {
                break;
            }
            _ = ping.tick() => {
                match timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }

    session.close();
    let (code, reason) = session.close_frame();
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })))
        .await;
}

/// Validate the handshake request: required query parameters plus bearer
/// token when the service is configured to check tokens itself.
fn authorize_handshake(
    req: &Request,
    jwt: Option<&JwtConfig>,
) -> Result<ConnectParams, (u16, &'static str)> {
    let query = parse_query(req.uri().query().unwrap_or(""));

    let user_id = query
        .get("user_id")
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or((400, "missing or invalid user_id"))?;
    let device_id = query
        .get("device_id")
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or((400, "missing device_id"))?;

    if let Some(jwt) = jwt {
        let token = query
            .get("token")
            .cloned()
            .or_else(|| bearer_token(req))
            .ok_or((401, "missing token"))?;
        validate_token(jwt, &token, user_id).map_err(|_| (401, "invalid token"))?;
    }

    Ok(ConnectParams { user_id, device_id })
}

fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

fn validate_token(jwt: &JwtConfig, token: &str, user_id: Uuid) -> AppResult<()> {
    let mut validation = Validation::new(Algorithm::HS256);
    if let Some(issuer) = &jwt.issuer {
        validation.set_issuer(&[issuer]);
    }
    if let Some(audience) = &jwt.audience {
        validation.set_audience(&[audience]);
    }

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt.secret.as_bytes()),
        &validation,
    )
    .map_err(|_| AppError::Unauthenticated)?;

    if data.claims.sub != user_id.to_string() {
        return Err(AppError::Unauthenticated);
    }
    Ok(())
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), parts.next().unwrap_or("").to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: usize,
    }

    fn jwt_config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret".into(),
            issuer: None,
            audience: None,
        }
    }

    fn token_for(sub: &str, secret: &str) -> String {
        encode(
            &Header::default(),
            &TestClaims {
                sub: sub.to_string(),
                exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn parse_query_splits_pairs() {
        let q = parse_query("user_id=abc&device_id=phone&token=");
        assert_eq!(q.get("user_id").unwrap(), "abc");
        assert_eq!(q.get("device_id").unwrap(), "phone");
        assert_eq!(q.get("token").unwrap(), "");
    }

    #[test]
    fn resume_request_parses_uuid_keys() {
        let conv = Uuid::new_v4();
        let json = format!(r#"{{"last_sequences":{{"{conv}":5}}}}"#);
        let req: ResumeRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req.last_sequences.get(&conv), Some(&5));
    }

    #[test]
    fn token_with_matching_subject_is_accepted() {
        let cfg = jwt_config();
        let user = Uuid::new_v4();
        let token = token_for(&user.to_string(), &cfg.secret);
        assert!(validate_token(&cfg, &token, user).is_ok());
    }

    #[test]
    fn token_subject_mismatch_is_rejected() {
        let cfg = jwt_config();
        let token = token_for(&Uuid::new_v4().to_string(), &cfg.secret);
        assert!(validate_token(&cfg, &token, Uuid::new_v4()).is_err());
    }

    #[test]
    fn token_with_wrong_secret_is_rejected() {
        let cfg = jwt_config();
        let user = Uuid::new_v4();
        let token = token_for(&user.to_string(), "other-secret");
        assert!(validate_token(&cfg, &token, user).is_err());
    }

    #[test]
    fn ping_period_is_nine_tenths_of_pong_wait() {
        assert_eq!(PING_PERIOD, PONG_WAIT * 9 / 10);
    }

    #[tokio::test]
    async fn write_pump_drains_frames_then_writes_close_frame() {
        let (session, outbound_rx) = Session::new(Uuid::new_v4(), "d1".into(), 8);
        session.flush_buffer_sorted();
        assert!(session.try_send("frame-1"));
        assert!(session.try_send("frame-2"));
        session.close_with_reason(crate::session::CLOSE_SESSION_REPLACED, "session_replaced");

        let (sink, collected) = futures::channel::mpsc::unbounded::<Message>();
        write_pump(session, outbound_rx, sink).await;

        let frames: Vec<Message> = collected.collect().await;
        assert_eq!(frames.len(), 3);
        match &frames[0] {
            Message::Text(text) => assert_eq!(text.as_str(), "frame-1"),
            other => panic!("expected text frame, got {other:?}"),
        }
        match &frames[1] {
            Message::Text(text) => assert_eq!(text.as_str(), "frame-2"),
            other => panic!("expected text frame, got {other:?}"),
        }
        match &frames[2] {
            Message::Close(Some(close)) => {
                assert_eq!(
                    u16::from(close.code),
                    crate::session::CLOSE_SESSION_REPLACED
                );
                assert_eq!(close.reason.as_str(), "session_replaced");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
