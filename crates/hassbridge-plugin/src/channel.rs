//! The event channel: one WebSocket session to the remote service.

use crate::plugin::StageError;
use futures_util::{SinkExt, StreamExt};
use hassbridge_core::{Frame, OutboundFrame};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A live session handle. Owned by the connection task only.
pub(crate) struct EventChannel {
    ws: WsStream,
}

impl EventChannel {
    pub(crate) async fn open(
        url: &str,
        tls: Option<Arc<ClientConfig>>,
        timeout: Option<Duration>,
    ) -> Result<Self, StageError> {
        let connector = tls.map(Connector::Rustls);
        let connect = tokio_tungstenite::connect_async_tls_with_config(url, None, false, connector);

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| StageError::ConnectTimeout(url.to_string()))?,
            None => connect.await,
        };

        let (ws, _response) = result.map_err(|source| StageError::Connect {
            url: url.to_string(),
            source,
        })?;
        Ok(Self { ws })
    }

    pub(crate) async fn send(&mut self, frame: &OutboundFrame) -> Result<(), StageError> {
        self.ws.send(Message::Text(frame.encode().into())).await?;
        Ok(())
    }

    /// Read the next frame. Returns [`StageError::Stopped`] as soon as `stop`
    /// fires, without waiting for the service to send anything.
    pub(crate) async fn recv(&mut self, stop: &CancellationToken) -> Result<Frame, StageError> {
        loop {
            let message = tokio::select! {
                biased;
                () = stop.cancelled() => return Err(StageError::Stopped),
                message = self.ws.next() => message,
            };

            match message {
                None | Some(Ok(Message::Close(_))) => return Err(StageError::Closed),
                Some(Err(e)) => return Err(StageError::Socket(e)),
                Some(Ok(Message::Text(text))) => return Ok(Frame::decode(&text)?),
                Some(Ok(Message::Binary(_))) => return Err(StageError::BinaryFrame),
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Close the session, giving the peer a moment to acknowledge.
    pub(crate) async fn close(mut self) {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.ws.close(None)).await;
    }
}
