//! Network Server
//!
//! TCP server for accepting connections from other nodes.

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::{read_envelope, Envelope};
use crate::error::{Error, Result};

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Channel for incoming envelopes
    incoming_tx: mpsc::UnboundedSender<Envelope>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, incoming_tx: mpsc::UnboundedSender<Envelope>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            incoming_tx,
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until [`stop`](Self::stop) is called
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Network server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let incoming_tx = self.incoming_tx.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, incoming_tx).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single inbound connection
async fn handle_connection(
    mut socket: TcpStream,
    peer_addr: &str,
    incoming_tx: mpsc::UnboundedSender<Envelope>,
) -> Result<()> {
    loop {
        match read_envelope(&mut socket).await {
            Ok(envelope) => {
                tracing::trace!(
                    "Received {} from {} ({})",
                    envelope.message.type_name(),
                    envelope.from,
                    peer_addr
                );

                if incoming_tx.send(envelope).is_err() {
                    break;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{LogId, NodeIdentity};
    use crate::network::{write_envelope, Message};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_server_forwards_envelopes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = Arc::new(NetworkServer::new("127.0.0.1:0".to_string(), tx));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let mut stream = TcpStream::connect(address).await.unwrap();
        let envelope = Envelope::new(
            NodeIdentity::new("id-1", "node-1"),
            Message::Confirm {
                log_id: LogId::new(1),
            },
        );
        write_envelope(&mut stream, &envelope).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), envelope);

        server.stop();
        serving.await.unwrap().unwrap();
    }
}
