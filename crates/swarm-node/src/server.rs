//! Local WebSocket control server.
//!
//! Each connection carries one JSON request per text message and gets one
//! reply per request, in order. Only loopback clients are served.

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::network::{NetworkError, Transport};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sent to non-local clients before the socket is closed.
pub const UNAUTHORIZED: &str = "Unauthorized connection";

/// Whether a client address may use the control channel.
pub fn is_authorized(addr: &SocketAddr) -> bool {
    // Dual-stack listeners report IPv4 clients as mapped IPv6 addresses.
    addr.ip().to_canonical().is_loopback()
}

pub struct ControlServer<T: Transport> {
    listener: TcpListener,
    dispatcher: Dispatcher<T>,
}

impl<T: Transport> ControlServer<T> {
    pub async fn bind(addr: SocketAddr, dispatcher: Dispatcher<T>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(NetworkError::from)?;
        Ok(Self { listener, dispatcher })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::from)?)
    }

    /// Accept connections until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "control server listening");
        }
        loop {
            let (stream, addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("control accept failed: {}", e);
                        continue;
                    }
                },
            };
            let dispatcher = self.dispatcher.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, addr, dispatcher, cancel).await {
                    debug!(%addr, "control connection ended: {}", e);
                }
            });
        }
        debug!("control server stopped");
    }
}

async fn serve_connection<T: Transport>(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Dispatcher<T>,
    cancel: CancellationToken,
) -> std::result::Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    if !is_authorized(&addr) {
        warn!(%addr, "refusing non-local control client");
        ws.send(Message::Text(UNAUTHORIZED.to_string())).await?;
        return ws.close(None).await;
    }
    debug!(%addr, "control client connected");

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = ws.next() => match message {
                Some(message) => message?,
                None => break,
            },
        };

        let request = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        let reply = dispatcher.handle_text(&request).await;
        ws.send(Message::Text(reply)).await?;
    }

    let _ = ws.close(None).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_loopback_is_authorized() {
        assert!(is_authorized(&"127.0.0.1:5000".parse().unwrap()));
        assert!(is_authorized(&"[::1]:5000".parse().unwrap()));
        assert!(!is_authorized(&"192.168.1.20:5000".parse().unwrap()));
        assert!(!is_authorized(&"0.0.0.0:5000".parse().unwrap()));
        assert!(is_authorized(&"[::ffff:127.0.0.1]:5000".parse().unwrap()));
        assert!(!is_authorized(&"[::ffff:192.168.1.20]:5000".parse().unwrap()));
    }
}
