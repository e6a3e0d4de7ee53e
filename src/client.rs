//! WebSocket client for the collaboration gateway.
//!
//! A thin, sequential wrapper over one gateway connection: present the
//! bearer credential on the upgrade request, send typed events, read typed
//! events back. Used by the integration suites and by hosts that need a
//! programmatic participant; transport reconnection is out of scope.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientEvent, ServerEvent};
use crate::server::GatewayError;

type ClientSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type ClientSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// One authenticated gateway connection.
pub struct GatewayClient {
    sink: ClientSink,
    stream: ClientSource,
}

impl GatewayClient {
    /// Connect and authenticate in one step.
    ///
    /// The credential travels as an `Authorization: Bearer` header on the
    /// upgrade request; the gateway closes unauthenticated connections
    /// before any event is processed.
    pub async fn connect(url: &str, token: &str) -> Result<Self, GatewayError> {
        let mut request = url
            .into_client_request()
            .map_err(tokio_tungstenite::tungstenite::Error::from)?;
        let header = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
            tokio_tungstenite::tungstenite::Error::Url(
                tokio_tungstenite::tungstenite::error::UrlError::UnsupportedUrlScheme,
            )
        })?;
        request.headers_mut().insert("authorization", header);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (sink, stream) = ws_stream.split();
        Ok(Self { sink, stream })
    }

    /// Send one event to the gateway.
    pub async fn send(&mut self, event: &ClientEvent) -> Result<(), GatewayError> {
        let frame = event.encode()?;
        self.sink.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    /// Read the next server event, skipping transport-level frames.
    ///
    /// Returns `None` once the gateway closes the connection.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                    Ok(event) => return Some(event),
                    Err(e) => {
                        log::warn!("undecodable server frame skipped: {e}");
                    }
                },
                Ok(Message::Ping(data)) => {
                    let _ = self.sink.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                _ => {}
            }
        }
    }

    /// `recv` bounded by a deadline; `None` on timeout or close.
    pub async fn recv_timeout(&mut self, deadline: Duration) -> Option<ServerEvent> {
        tokio::time::timeout(deadline, self.recv()).await.ok()?
    }

    /// Close the connection cleanly.
    pub async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}
