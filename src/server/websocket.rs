use crate::agent::ChatAgent;
use crate::geo::MapView;
use crate::models::websocket::{ ClientMessage, ServerMessage };
use crate::relay::{ DisplaySink, SinkError };

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;

use async_trait::async_trait;
use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use hmac::{ Hmac, Mac };
use sha2::Sha256;
use chrono::Utc;
use url::form_urlencoded;

use log::{ debug, info, warn, error };
use futures::{ Sink, SinkExt, StreamExt };

type HmacSha256 = Hmac<Sha256>;

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;
/// Accepted clock skew between client and server, in seconds.
const MAX_TIMESTAMP_SKEW: i64 = 300;
const CONNECTIONS_PER_SECOND: NonZeroU32 = match NonZeroU32::new(10) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(CONNECTIONS_PER_SECOND));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    Missing,
    Timestamp,
    Signature,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Missing => f.write_str("missing ts/sig"),
            AuthError::Timestamp => f.write_str("timestamp out of range"),
            AuthError::Signature => f.write_str("bad signature"),
        }
    }
}

impl Error for AuthError {}

/// Hex HMAC-SHA256 of the timestamp, keyed by the server API key.
pub fn sign_timestamp(secret: &str, ts: &str) -> Result<String, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::Signature)?;
    mac.update(ts.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(
    secret: &str,
    ts: Option<&str>,
    sig: Option<&str>,
    now: i64
) -> Result<(), AuthError> {
    let (ts, sig) = match (ts, sig) {
        (Some(ts), Some(sig)) => (ts, sig),
        _ => {
            return Err(AuthError::Missing);
        }
    };

    let ts_i: i64 = ts.parse().map_err(|_| AuthError::Timestamp)?;
    if (now - ts_i).abs() > MAX_TIMESTAMP_SKEW {
        return Err(AuthError::Timestamp);
    }

    let provided = hex::decode(sig).map_err(|_| AuthError::Signature)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::Signature)?;
    mac.update(ts.as_bytes());
    mac.verify_slice(&provided).map_err(|_| AuthError::Signature)
}

fn reject(reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    res
}

fn frame(msg: &ServerMessage) -> Result<Message, SinkError> {
    serde_json
        ::to_string(msg)
        .map(Message::Text)
        .map_err(|e| SinkError(format!("failed to encode frame: {}", e)))
}

async fn send_frame<T>(tx: &mut T, msg: &ServerMessage) -> Result<(), SinkError>
    where T: Sink<Message> + Unpin, T::Error: fmt::Display
{
    let message = frame(msg)?;
    tx.send(message).await.map_err(|e| SinkError(e.to_string()))
}

/// Renders a turn as websocket frames on one connection.
pub struct WsSink<'a, T> {
    tx: &'a mut T,
}

impl<'a, T> WsSink<'a, T> {
    pub fn new(tx: &'a mut T) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<'a, T> DisplaySink
    for WsSink<'a, T>
    where T: Sink<Message> + Unpin + Send, T::Error: fmt::Display
{
    async fn partial(&mut self, text: &str) -> Result<(), SinkError> {
        send_frame(&mut *self.tx, &(ServerMessage::Partial { content: text.to_string() })).await
    }

    async fn notice(&mut self, message: &str) -> Result<(), SinkError> {
        send_frame(&mut *self.tx, &(ServerMessage::Notice { message: message.to_string() })).await
    }

    async fn map(&mut self, view: &MapView) -> Result<(), SinkError> {
        send_frame(&mut *self.tx, &(ServerMessage::Map { view: view.clone() })).await
    }

    async fn finish(&mut self, text: &str) -> Result<(), SinkError> {
        let done = ServerMessage::Done {
            content: text.to_string(),
            timestamp: Utc::now().timestamp(),
        };
        send_frame(&mut *self.tx, &done).await
    }
}

pub async fn start_ws_server(
    addr: &str,
    agent: Arc<ChatAgent>,
    api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!("WS server listening on: {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let agent_clone = Arc::clone(&agent);
        let required_api_key = api_key.clone();

        tokio::spawn(async move {
            if let Err(e) = process_connection(peer, stream, agent_clone, required_api_key).await {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    agent: Arc<ChatAgent>,
    required_api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let secret = match &required_api_key {
            Some(k) if !k.is_empty() => k,
            _ => {
                return Ok(response);
            }
        };

        let qs = req.uri().query().unwrap_or("");
        let params: HashMap<String, String> = form_urlencoded
            ::parse(qs.as_bytes())
            .into_owned()
            .collect();

        let ts = params
            .get("ts")
            .or_else(|| params.get("X-Api-Ts"))
            .map(|s| s.as_str());
        let sig = params
            .get("sig")
            .or_else(|| params.get("X-Api-Sign"))
            .map(|s| s.as_str());

        match verify_signature(secret, ts, sig, Utc::now().timestamp()) {
            Ok(()) => {
                info!("{} authenticated", peer);
                Ok(response)
            }
            Err(e) => {
                warn!("{}: {}", peer, e);
                Err(reject(&e.to_string()))
            }
        }
    };

    match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => {
            handle_connection(peer, ws, agent).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

pub async fn handle_connection<S>(peer: SocketAddr, websocket: WebSocketStream<S>, agent: Arc<ChatAgent>)
    where S: AsyncRead + AsyncWrite + Unpin + Send
{
    info!("New WebSocket connection: {}", peer);
    let (mut tx, mut rx) = websocket.split();

    let mut session = match agent.new_session().await {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to load history for {}: {}", peer, e);
            let error_msg = ServerMessage::Error {
                message: format!("Failed to load history: {}", e),
            };
            let _ = send_frame(&mut tx, &error_msg).await;
            return;
        }
    };
    info!("Assigned session ID {} to {}", session.id(), peer);

    let history = ServerMessage::History { messages: session.transcript() };
    if let Err(e) = send_frame(&mut tx, &history).await {
        error!("Error sending history to {}: {}", peer, e);
        return;
    }

    while let Some(msg) = rx.next().await {
        let message = match msg {
            Ok(message) => message,
            Err(e) => {
                match e {
                    | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::Protocol(_)
                    | tokio_tungstenite::tungstenite::Error::Utf8 => {
                        info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                    }
                    tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                        io_err.kind() == std::io::ErrorKind::ConnectionReset
                    => {
                        info!("WebSocket connection reset by peer {}", peer);
                    }
                    _ => {
                        error!("Error receiving message from {}: {}", peer, e);
                    }
                }
                break;
            }
        };

        if message.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Message from {} exceeds size limit ({} > {})",
                peer,
                message.len(),
                MAX_MESSAGE_SIZE
            );
            let error_msg = ServerMessage::Error {
                message: "Message too large".to_string(),
            };
            if send_frame(&mut tx, &error_msg).await.is_err() {
                error!("Failed to send size limit error to {}", peer);
            }
            break;
        }

        match message {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Chat { content }) if content.trim().is_empty() => {
                        Some(ServerMessage::Error { message: "Empty message".to_string() })
                    }
                    Ok(ClientMessage::Chat { content }) => {
                        if let Err(e) = send_frame(&mut tx, &ServerMessage::Processing).await {
                            error!("Error sending processing status to {}: {}", peer, e);
                            break;
                        }

                        let mut sink = WsSink::new(&mut tx);
                        match agent.process_message(&mut session, &content, &mut sink).await {
                            Ok(outcome) => {
                                debug!(
                                    "Turn for {} finished with {} message(s)",
                                    peer,
                                    outcome.messages.len()
                                );
                                None
                            }
                            Err(e) => {
                                let error_message = format!("Error processing message: {}", e);
                                error!("Agent processing error for {}: {}", peer, error_message);
                                Some(ServerMessage::Error { message: error_message })
                            }
                        }
                    }
                    Ok(ClientMessage::Clear) => {
                        info!("Clearing session {} for {}", session.id(), peer);
                        session.clear();
                        Some(ServerMessage::History { messages: Vec::new() })
                    }
                    Err(e) => {
                        error!("Failed to parse message from {}: {}", peer, e);
                        Some(ServerMessage::Error {
                            message: format!("Failed to parse message: {}", e),
                        })
                    }
                };

                if let Some(reply) = reply {
                    if let Err(e) = send_frame(&mut tx, &reply).await {
                        error!("Error sending message to {}: {}", peer, e);
                        break;
                    }
                }
            }
            Message::Close(_) => {
                info!("Received close frame from {}", peer);
                break;
            }
            Message::Ping(ping_data) => {
                if tx.send(Message::Pong(ping_data)).await.is_err() {
                    error!("Failed to send pong to {}", peer);
                    break;
                }
            }
            Message::Pong(_) => {}
            Message::Binary(_) => {
                warn!("Ignoring binary message from {}", peer);
            }
            Message::Frame(_) => {}
        }
    }
    info!("WebSocket connection closed for {} (session {})", peer, session.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{ DEFAULT_FALLBACK, DEFAULT_ZOOM };
    use futures::channel::mpsc;

    const SECRET: &str = "s3cret";

    #[test]
    fn valid_signature_passes() {
        let now = 1_700_000_000;
        let ts = now.to_string();
        let sig = sign_timestamp(SECRET, &ts).unwrap();
        assert_eq!(verify_signature(SECRET, Some(&ts), Some(&sig), now + 10), Ok(()));
    }

    #[test]
    fn stale_or_unparsable_timestamp_is_rejected() {
        let ts = "1700000000";
        let sig = sign_timestamp(SECRET, ts).unwrap();
        assert_eq!(
            verify_signature(SECRET, Some(ts), Some(&sig), 1_700_000_301),
            Err(AuthError::Timestamp)
        );
        assert_eq!(
            verify_signature(SECRET, Some("yesterday"), Some(&sig), 1_700_000_000),
            Err(AuthError::Timestamp)
        );
    }

    #[test]
    fn wrong_key_or_garbage_signature_is_rejected() {
        let ts = "1700000000";
        let sig = sign_timestamp("other", ts).unwrap();
        assert_eq!(
            verify_signature(SECRET, Some(ts), Some(&sig), 1_700_000_000),
            Err(AuthError::Signature)
        );
        assert_eq!(
            verify_signature(SECRET, Some(ts), Some("zz"), 1_700_000_000),
            Err(AuthError::Signature)
        );
    }

    #[test]
    fn missing_params_are_rejected() {
        assert_eq!(verify_signature(SECRET, None, Some("ab"), 0), Err(AuthError::Missing));
        assert_eq!(verify_signature(SECRET, Some("0"), None, 0), Err(AuthError::Missing));
    }

    #[test]
    fn rejection_is_unauthorized() {
        let res = reject("bad signature");
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.body().as_deref(), Some("bad signature"));
    }

    fn decode(message: Message) -> serde_json::Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sink_emits_typed_frames() {
        let (mut tx, rx) = mpsc::unbounded::<Message>();
        {
            let mut sink = WsSink::new(&mut tx);
            sink.partial("Hel").await.unwrap();
            sink.notice("Location not found. Please try another one.").await.unwrap();
            sink.map(&MapView::new("Tainan", DEFAULT_FALLBACK, DEFAULT_ZOOM)).await.unwrap();
            sink.finish("Hello").await.unwrap();
        }
        drop(tx);

        let frames: Vec<serde_json::Value> = rx.map(decode).collect().await;
        assert_eq!(frames[0]["type"], "partial");
        assert_eq!(frames[0]["content"], "Hel");
        assert_eq!(frames[1]["type"], "notice");
        assert_eq!(frames[2]["type"], "map");
        assert_eq!(frames[2]["view"]["marker"]["popup"], "Tainan");
        assert_eq!(frames[3]["type"], "done");
        assert_eq!(frames[3]["content"], "Hello");
    }

    #[tokio::test]
    async fn closed_connection_surfaces_as_sink_error() {
        let (mut tx, rx) = mpsc::unbounded::<Message>();
        drop(rx);
        let mut sink = WsSink::new(&mut tx);
        assert!(sink.partial("x").await.is_err());
    }
}
