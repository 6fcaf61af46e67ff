//! WebSocket transport for the OpenAI Realtime conversation API
//!
//! `RealtimeSession::connect()` performs the handshake, waits for
//! `session.created`, sends the conversation `session.update` and waits for
//! its acknowledgement. Afterwards a reader task decodes server messages onto
//! a channel the caller takes with `take_inbound()`.
//!
//! Only the initial connect is retried (3 attempts, backoff 1s then 2s).
//! Authentication failures and a missing key are returned immediately. A
//! session that drops later is reported as closed, never reconnected.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use super::protocol::{realtime_url, ClientMessage, ErrorInfo, ServerMessage};
use super::RemoteConfig;
use crate::error::RemoteError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SETUP_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const INBOUND_QUEUE: usize = 100;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RealtimeSession {
    sink: SplitSink<Socket, Message>,
    inbound: Option<mpsc::Receiver<ServerMessage>>,
    id: String,
    reader: JoinHandle<()>,
}

/// Delay before connect attempt `attempt` (0-based)
fn backoff(attempt: u32) -> Option<Duration> {
    (attempt > 0).then(|| BACKOFF_BASE * 2u32.pow(attempt - 1))
}

impl RealtimeSession {
    pub async fn connect(api_key: &str, config: &RemoteConfig) -> Result<Self, RemoteError> {
        if api_key.is_empty() {
            return Err(RemoteError::MissingApiKey);
        }

        let mut failure = RemoteError::ConnectionFailed("no connection attempt made".into());
        for attempt in 0..CONNECT_ATTEMPTS {
            if let Some(delay) = backoff(attempt) {
                log::info!(
                    "Realtime connect attempt {}/{} in {:?}",
                    attempt + 1,
                    CONNECT_ATTEMPTS,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            match Self::open(api_key, config).await {
                Ok(session) => return Ok(session),
                Err(e @ RemoteError::AuthenticationFailed(_)) => return Err(e),
                Err(e) => {
                    log::warn!("Realtime connect attempt {} failed: {}", attempt + 1, e);
                    failure = e;
                }
            }
        }
        Err(failure)
    }

    async fn open(api_key: &str, config: &RemoteConfig) -> Result<Self, RemoteError> {
        let socket = handshake(api_key, &config.model).await?;
        let (sink, mut stream) = socket.split();

        let id = tokio::time::timeout(SETUP_TIMEOUT, await_session_created(&mut stream))
            .await
            .map_err(|_| RemoteError::ConnectionFailed("timed out waiting for session.created".into()))??;
        log::info!("Realtime session {} created", id);

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let reader = tokio::spawn(read_loop(stream, tx));

        let mut session = Self {
            sink,
            inbound: Some(rx),
            id,
            reader,
        };
        session.configure(config).await?;
        Ok(session)
    }

    /// Send `session.update` and wait for `session.updated`
    async fn configure(&mut self, config: &RemoteConfig) -> Result<(), RemoteError> {
        self.send_message(&ClientMessage::session_update(config))
            .await?;

        let inbound = self
            .inbound
            .as_mut()
            .ok_or_else(|| RemoteError::Protocol("inbound channel already taken".into()))?;

        let acknowledged = async {
            while let Some(msg) = inbound.recv().await {
                match msg {
                    ServerMessage::SessionUpdated { session } => {
                        log::info!(
                            "Realtime session configured (voice {:?}, modalities {:?})",
                            config.voice,
                            session.modalities
                        );
                        return Ok(());
                    }
                    ServerMessage::Error { error } => {
                        return Err(RemoteError::Protocol(error.message))
                    }
                    other => log::debug!("Skipping {:?} during setup", other),
                }
            }
            Err(RemoteError::Closed("socket closed during setup".into()))
        };

        tokio::time::timeout(SETUP_TIMEOUT, acknowledged)
            .await
            .map_err(|_| RemoteError::ConnectionFailed("timed out configuring session".into()))?
    }

    pub async fn send_message(&mut self, msg: &ClientMessage) -> Result<(), RemoteError> {
        let json = serde_json::to_string(msg).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        self.sink
            .send(Message::Text(json))
            .await
            .map_err(|e| RemoteError::SendFailed(e.to_string()))
    }

    /// Append 24 kHz mono PCM16 to the input buffer
    pub async fn send_audio(&mut self, samples: &[i16]) -> Result<(), RemoteError> {
        self.send_message(&ClientMessage::audio_append(samples)).await
    }

    /// The decoded server messages; `None` once taken
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.inbound.take()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn disconnect(mut self) {
        log::info!("Closing realtime session {}", self.id);
        self.reader.abort();
        if let Err(e) = self.sink.close().await {
            log::warn!("Realtime socket did not close cleanly: {}", e);
        }
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn handshake(api_key: &str, model: &str) -> Result<Socket, RemoteError> {
    let mut request = realtime_url(model)
        .into_client_request()
        .map_err(|e| RemoteError::ConnectionFailed(e.to_string()))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
        .map_err(|e| RemoteError::AuthenticationFailed(e.to_string()))?;
    let headers = request.headers_mut();
    headers.insert("Authorization", bearer);
    headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    log::info!("Opening realtime socket for {}", model);
    let (socket, _response) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        connect_async_with_config(request, None, true),
    )
    .await
    .map_err(|_| RemoteError::ConnectionFailed("handshake timed out".into()))?
    .map_err(classify_handshake_error)?;
    Ok(socket)
}

async fn await_session_created(stream: &mut SplitStream<Socket>) -> Result<String, RemoteError> {
    while let Some(frame) = stream.next().await {
        match frame.map_err(|e| RemoteError::Protocol(e.to_string()))? {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::SessionCreated { session }) => return Ok(session.id),
                Ok(ServerMessage::Error { error }) => {
                    return Err(RemoteError::AuthenticationFailed(error.message))
                }
                Ok(other) => log::debug!("Skipping {:?} before session.created", other),
                Err(e) => log::warn!("Unparseable realtime message: {}", e),
            },
            Message::Close(_) => {
                return Err(RemoteError::Closed("closed before session.created".into()))
            }
            _ => {}
        }
    }
    Err(RemoteError::Closed("stream ended before session.created".into()))
}

/// Decode frames until the socket or the consumer goes away
async fn read_loop(mut stream: SplitStream<Socket>, tx: mpsc::Sender<ServerMessage>) {
    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Unparseable realtime message: {}", e);
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                log::info!("Realtime socket closed by server: {:?}", frame);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                log::warn!("Realtime socket error: {}", e);
                // Surfaced as a session error rather than a silent close
                let _ = tx
                    .send(ServerMessage::Error {
                        error: ErrorInfo {
                            kind: "transport_error".into(),
                            code: None,
                            message: e.to_string(),
                        },
                    })
                    .await;
                break;
            }
        };
        if tx.send(msg).await.is_err() {
            break;
        }
    }
    log::debug!("Realtime reader exiting");
}

fn classify_handshake_error(err: WsError) -> RemoteError {
    match err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            RemoteError::AuthenticationFailed(format!("HTTP {}", response.status()))
        }
        other => RemoteError::ConnectionFailed(other.to_string()),
    }
}
