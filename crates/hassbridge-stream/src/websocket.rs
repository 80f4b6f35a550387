//! WebSocket front end for the multiplexer.

use crate::mux::{Multiplexer, SessionTransport, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

/// Messages queued for one client before it counts as stalled.
const OUTBOUND_QUEUE: usize = 256;

/// Write side of one WebSocket client. Messages are queued to a writer task
/// so a slow client never blocks the sender. A client that lets the queue
/// fill up is disconnected.
struct WsTransport {
    tx: mpsc::Sender<Message>,
    backlogged: CancellationToken,
}

impl SessionTransport for WsTransport {
    fn send(&self, text: String) -> Result<(), TransportError> {
        match self.tx.try_send(Message::Text(text.into())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.backlogged.cancel();
                Err(TransportError::Backlogged)
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        let _ = self.tx.try_send(Message::Close(None));
    }
}

/// Accept WebSocket clients until the multiplexer is stopped.
pub async fn serve(listener: TcpListener, mux: Multiplexer) {
    let stop = mux.stop_token();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("stream listening on ws://{}", addr);
    }

    loop {
        let accepted = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("stream accept failed: {}", e);
                continue;
            }
        };

        let mux = mux.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, mux).await {
                tracing::warn!("stream connection error from {}: {}", addr, e);
            }
        });
    }

    tracing::info!("stream listener stopped");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    mux: Multiplexer,
) -> Result<(), tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let backlogged = CancellationToken::new();
    let transport = Arc::new(WsTransport {
        tx,
        backlogged: backlogged.clone(),
    });
    let Some(id) = mux.open(transport.clone()).await else {
        return Ok(());
    };
    tracing::debug!("{} from {}", id, addr);

    let stop = mux.stop_token();
    loop {
        let message = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = backlogged.cancelled() => break,
            message = source.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => mux.deliver(id, &text).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!("{}: client disconnected unexpectedly: {}", id, e);
                break;
            }
        }
    }

    if backlogged.is_cancelled() {
        // The writer is stuck on a client that stopped reading.
        writer.abort();
    } else if stop.is_cancelled() {
        transport.close();
    }
    mux.close(id).await;
    Ok(())
}
