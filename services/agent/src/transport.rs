//! WebSocket transport to the room server.
//!
//! Connects to `{endpoint}/rtc` with the credential as a bearer token, then
//! performs the room handshake: a `connect` frame carrying the token, answered
//! by `connected` (or `unauthorized`). The whole sequence is bounded by the
//! connect timeout.

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use roomlink_core::{ConnectError, Connection, Credential, ReceiveError, SendError, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, client::IntoClientRequest, http::HeaderValue, http::StatusCode,
        protocol::Message as WsMessage,
    },
};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PROTOCOL_VERSION: &str = "1.0";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct ConnectFrame<'a> {
    #[serde(rename = "type")]
    tag: &'static str,
    payload: ConnectPayload<'a>,
}

#[derive(Serialize)]
struct ConnectPayload<'a> {
    access_token: &'a str,
    room: &'a str,
    participant: &'a str,
    protocol: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct HandshakeReply {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    payload: Option<Value>,
}

pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(
        &self,
        endpoint: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn Connection>, ConnectError> {
        let url = format!("{}/rtc", endpoint.trim_end_matches('/'));
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Refused(format!("invalid endpoint {url}: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token))
            .map_err(|e| ConnectError::Refused(format!("invalid token header: {e}")))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws_stream, _) = connect_async(request).await.map_err(classify_error)?;
        let (mut sink, mut stream) = ws_stream.split();
        debug!(%url, "WebSocket upgraded, sending connect frame");

        let hello = ConnectFrame {
            tag: "connect",
            payload: ConnectPayload {
                access_token: &credential.token,
                room: &credential.room_name,
                participant: &credential.subject_identity,
                protocol: "websocket",
                version: PROTOCOL_VERSION,
            },
        };
        let hello = serde_json::to_string(&hello)
            .map_err(|e| ConnectError::Refused(format!("failed to encode connect frame: {e}")))?;
        sink.send(WsMessage::Text(hello.into()))
            .await
            .map_err(classify_error)?;

        await_handshake_reply(&mut stream).await?;
        info!(%url, room = %credential.room_name, "Connected to room server");

        Ok(Arc::new(WebSocketConnection {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        endpoint: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn Connection>, ConnectError> {
        tokio::time::timeout(self.connect_timeout, self.open(endpoint, credential))
            .await
            .unwrap_or(Err(ConnectError::Timeout))
    }
}

async fn await_handshake_reply(stream: &mut SplitStream<WsStream>) -> Result<(), ConnectError> {
    loop {
        let raw = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(WsMessage::Binary(bytes))) => bytes.to_vec(),
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ConnectError::Refused(
                    "server closed the connection during handshake".to_string(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(classify_error(e)),
        };
        let reply: HandshakeReply = serde_json::from_slice(&raw)
            .map_err(|e| ConnectError::Refused(format!("malformed handshake reply: {e}")))?;
        return match reply.tag.as_str() {
            "connected" => Ok(()),
            "unauthorized" => Err(ConnectError::AuthRejected(reason(reply.payload.as_ref()))),
            other => Err(ConnectError::Refused(format!(
                "unexpected handshake reply `{other}`"
            ))),
        };
    }
}

fn reason(payload: Option<&Value>) -> String {
    payload
        .and_then(|p| p.get("reason").or_else(|| p.get("message")))
        .and_then(Value::as_str)
        .unwrap_or("unauthorized")
        .to_string()
}

fn classify_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                ConnectError::AuthRejected(format!("upgrade rejected with HTTP {status}"))
            } else {
                ConnectError::Refused(format!("upgrade rejected with HTTP {status}"))
            }
        }
        other => ConnectError::Refused(other.to_string()),
    }
}

/// One open WebSocket. Writers and the reader lock separate halves.
struct WebSocketConnection {
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&self, frame: Vec<u8>) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }
        let message = match String::from_utf8(frame) {
            Ok(text) => WsMessage::Text(text.into()),
            Err(e) => WsMessage::Binary(e.into_bytes().into()),
        };
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    SendError::Closed
                }
                other => SendError::Transport(other.to_string()),
            })
    }

    async fn receive(&self) -> Result<Vec<u8>, ReceiveError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(text.as_bytes().to_vec()),
                Some(Ok(WsMessage::Binary(bytes))) => return Ok(bytes.to_vec()),
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "Close frame received");
                    return Err(ReceiveError::Closed);
                }
                Some(Ok(_)) => continue,
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                ))
                | None => return Err(ReceiveError::Closed),
                Some(Err(e)) => return Err(ReceiveError::Transport(e.to_string())),
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let shutdown = async {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(WsMessage::Close(None)).await {
                debug!(error = %e, "Close frame not sent");
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            warn!("Timed out closing WebSocket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlink_core::{Capability, TokenIssuer};
    use secrecy::SecretString;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn credential() -> Credential {
        TokenIssuer::new("devkey", SecretString::from("devsecret".to_string()))
            .issue(
                "test-room",
                "local-agent",
                &Capability::agent_defaults(),
                Duration::from_secs(60),
            )
            .unwrap()
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        (listener, endpoint)
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
        ws.send(WsMessage::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let (listener, endpoint) = bind().await;
        let cred = credential();
        let token = cred.token.clone();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut seen = None;
            let mut ws = accept_hdr_async(tcp, |req: &Request, resp: Response| {
                let auth = req
                    .headers()
                    .get("Authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                seen = Some((req.uri().path().to_string(), auth));
                Ok::<_, ErrorResponse>(resp)
            })
            .await
            .unwrap();

            let hello = next_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "connected"})).await;
            send_json(&mut ws, json!({"type": "data", "payload": {"content": "hi"}})).await;
            let reply = next_json(&mut ws).await;
            ws.close(None).await.unwrap();
            (seen, hello, reply)
        });

        let transport = WebSocketTransport::new(Duration::from_secs(5));
        let conn = transport.connect(&endpoint, &cred).await.unwrap();

        let inbound: Value = serde_json::from_slice(&conn.receive().await.unwrap()).unwrap();
        assert_eq!(inbound["payload"]["content"], "hi");

        conn.send(br#"{"type":"pong","payload":{"timestamp":1}}"#.to_vec())
            .await
            .unwrap();
        assert_eq!(conn.receive().await, Err(ReceiveError::Closed));

        let (seen, hello, reply) = server.await.unwrap();
        let (path, auth) = seen.unwrap();
        assert_eq!(path, "/rtc");
        assert_eq!(auth, Some(format!("Bearer {token}")));
        assert_eq!(hello["type"], "connect");
        assert_eq!(hello["payload"]["access_token"], token.as_str());
        assert_eq!(hello["payload"]["room"], "test-room");
        assert_eq!(hello["payload"]["participant"], "local-agent");
        assert_eq!(hello["payload"]["protocol"], "websocket");
        assert_eq!(hello["payload"]["version"], "1.0");
        assert_eq!(reply, json!({"type": "pong", "payload": {"timestamp": 1}}));

        conn.close().await;
    }

    #[tokio::test]
    async fn test_unauthorized_reply_is_auth_rejected() {
        let (listener, endpoint) = bind().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = next_json(&mut ws).await;
            send_json(
                &mut ws,
                json!({"type": "unauthorized", "payload": {"reason": "token expired"}}),
            )
            .await;
        });

        let err = WebSocketTransport::new(Duration::from_secs(5))
            .connect(&endpoint, &credential())
            .await
            .err()
            .unwrap();
        assert_eq!(err, ConnectError::AuthRejected("token expired".to_string()));
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_refused() {
        let (listener, endpoint) = bind().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = next_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "room_full"})).await;
        });

        let err = WebSocketTransport::new(Duration::from_secs(5))
            .connect(&endpoint, &credential())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Refused(_)));
    }

    #[tokio::test]
    async fn test_http_401_is_auth_rejected() {
        let (listener, endpoint) = bind().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ = accept_hdr_async(tcp, |_req: &Request, _resp: Response| {
                let mut denied = ErrorResponse::new(Some("bad token".to_string()));
                *denied.status_mut() = StatusCode::UNAUTHORIZED;
                Err(denied)
            })
            .await;
        });

        let err = WebSocketTransport::new(Duration::from_secs(5))
            .connect(&endpoint, &credential())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::AuthRejected(_)));
    }

    #[tokio::test]
    async fn test_closed_port_is_refused() {
        let (listener, endpoint) = bind().await;
        drop(listener);

        let err = WebSocketTransport::new(Duration::from_secs(5))
            .connect(&endpoint, &credential())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Refused(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (listener, endpoint) = bind().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = next_json(&mut ws).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = WebSocketTransport::new(Duration::from_millis(200))
            .connect(&endpoint, &credential())
            .await
            .err()
            .unwrap();
        assert_eq!(err, ConnectError::Timeout);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (listener, endpoint) = bind().await;
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = next_json(&mut ws).await;
            send_json(&mut ws, json!({"type": "connected"})).await;
            while let Some(Ok(_)) = ws.next().await {}
        });

        let conn = WebSocketTransport::new(Duration::from_secs(5))
            .connect(&endpoint, &credential())
            .await
            .unwrap();
        conn.close().await;
        conn.close().await;

        assert_eq!(conn.send(b"{}".to_vec()).await, Err(SendError::Closed));
    }
}
