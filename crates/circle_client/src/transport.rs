use std::time::Duration;

use async_trait::async_trait;
use circle_shared::protocol::{ClientRequest, ServerEvent};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message as WsMessage,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{error::EngineError, types::Credentials};

const SESSION_BUFFER: usize = 256;

/// One authenticated transport session. Dropping the outbound sender closes
/// the session; the inbound receiver yields `None` once the peer goes away.
pub struct TransportSession {
    pub outbound: mpsc::Sender<ClientRequest>,
    pub inbound: mpsc::Receiver<ServerEvent>,
}

impl TransportSession {
    pub fn channel_pair() -> (
        Self,
        mpsc::Receiver<ClientRequest>,
        mpsc::Sender<ServerEvent>,
    ) {
        let (outbound, outbound_rx) = mpsc::channel(SESSION_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel(SESSION_BUFFER);
        (Self { outbound, inbound }, outbound_rx, inbound_tx)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, credentials: &Credentials) -> Result<TransportSession, EngineError>;
}

pub struct MissingTransport;

#[async_trait]
impl Transport for MissingTransport {
    async fn open(&self, _credentials: &Credentials) -> Result<TransportSession, EngineError> {
        Err(EngineError::Network("realtime transport is unavailable".into()))
    }
}

pub struct WsTransport {
    server_url: String,
    handshake_timeout: Duration,
}

impl WsTransport {
    pub fn new(server_url: impl Into<String>, handshake_timeout: Duration) -> Self {
        Self {
            server_url: server_url.into(),
            handshake_timeout,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, credentials: &Credentials) -> Result<TransportSession, EngineError> {
        let ws_url = websocket_url(&self.server_url, credentials)?;
        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|err| EngineError::Config(format!("invalid websocket url {ws_url}: {err}")))?;
        if !credentials.token.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.token))
                .map_err(|_| EngineError::Auth("token is not a valid header value".into()))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);
        }

        let (ws_stream, _) = connect_async(request).await.map_err(classify_ws_error)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = ClientRequest::Authenticate {
            user_id: credentials.user_id.clone(),
            display_name: credentials.display_name.clone(),
        };
        ws_writer
            .send(WsMessage::Text(encode_frame(&hello)?))
            .await
            .map_err(classify_ws_error)?;

        let ack = tokio::time::timeout(self.handshake_timeout, async {
            while let Some(frame) = ws_reader.next().await {
                match frame.map_err(classify_ws_error)? {
                    WsMessage::Text(text) => return decode_frame(&text),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            Err(EngineError::Network(
                "websocket closed during authentication".into(),
            ))
        })
        .await
        .map_err(|_| EngineError::Network("authentication handshake timed out".into()))??;

        match ack {
            ServerEvent::Status { user_id, .. } if user_id == credentials.user_id => {}
            ServerEvent::Status { user_id, .. } => {
                return Err(EngineError::Auth(format!(
                    "server authenticated unexpected user {user_id}"
                )));
            }
            ServerEvent::Error(err) if err.code.is_auth() => {
                return Err(EngineError::Auth(err.message));
            }
            other => {
                return Err(EngineError::Protocol(format!(
                    "expected status after authenticate, got {other:?}"
                )));
            }
        }

        let (session, mut outbound_rx, inbound_tx) = TransportSession::channel_pair();

        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let text = match encode_frame(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = request.event_name(), %err, "transport: dropping unencodable frame");
                        continue;
                    }
                };
                if ws_writer.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match decode_frame(&text) {
                        Ok(event) => {
                            if inbound_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "transport: invalid server event"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(%err, "transport: websocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(session)
    }
}

pub(crate) fn websocket_url(server_url: &str, credentials: &Credentials) -> Result<Url, EngineError> {
    let mut url = Url::parse(server_url)
        .map_err(|err| EngineError::Config(format!("invalid server_url {server_url}: {err}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(EngineError::Config(format!(
                "server_url must use http(s) or ws(s), got {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| EngineError::Config(format!("cannot use {scheme} for {server_url}")))?;

    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", credentials.user_id.as_str());
    Ok(url)
}

fn encode_frame(request: &ClientRequest) -> Result<String, EngineError> {
    serde_json::to_string(request).map_err(|err| EngineError::Protocol(err.to_string()))
}

fn decode_frame(text: &str) -> Result<ServerEvent, EngineError> {
    serde_json::from_str(text).map_err(|err| EngineError::Protocol(err.to_string()))
}

fn classify_ws_error(err: tungstenite::Error) -> EngineError {
    match err {
        tungstenite::Error::Http(response)
            if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
        {
            EngineError::Auth(format!("websocket upgrade rejected: {}", response.status()))
        }
        other => EngineError::Network(other.to_string()),
    }
}
