use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use crate::protocol::{ClientFrame, ServerFrame};

pub mod memory;

/// Channel capacity between the connection manager and a transport's IO tasks.
const FRAME_BUFFER: usize = 64;

/// One live logical connection: an outbound frame sink and an inbound frame
/// stream. Dropping either end closes the connection; the inbound receiver
/// yielding `None` is how the connection manager observes a peer close.
pub struct TransportPair {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<ServerFrame>,
}

/// Pluggable framed transport. Each successful `connect` yields a fresh
/// `TransportPair`; the client holds at most one live pair at a time.
pub trait Transport: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<TransportPair>>;
}

/// Newline-delimited JSON over TCP.
///
/// The wire format is one serialized frame per line; malformed lines are
/// logged and skipped rather than killing the connection.
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<TransportPair>> {
        let addr = url.to_string();
        Box::pin(async move {
            let stream = TcpStream::connect(&addr)
                .await
                .with_context(|| format!("Failed to connect to {}", addr))?;
            let (read_half, mut write_half) = stream.into_split();

            let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientFrame>(FRAME_BUFFER);
            let (inbound_tx, inbound_rx) = mpsc::channel::<ServerFrame>(FRAME_BUFFER);

            // Writer: serialize outbound frames, one per line
            tokio::spawn(async move {
                while let Some(frame) = outbound_rx.recv().await {
                    let mut line = match serde_json::to_string(&frame) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize outbound frame");
                            continue;
                        }
                    };
                    line.push('\n');
                    if let Err(e) = write_half.write_all(line.as_bytes()).await {
                        debug!(error = %e, "Transport write failed, stopping writer");
                        break;
                    }
                }
            });

            // Reader: parse inbound lines into frames
            tokio::spawn(async move {
                let mut lines = LinesStream::new(BufReader::new(read_half).lines());
                while let Some(result) = lines.next().await {
                    let line = match result {
                        Ok(line) => line,
                        Err(e) => {
                            debug!(error = %e, "Transport read failed, stopping reader");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ServerFrame>(&line) {
                        Ok(frame) => {
                            if inbound_tx.send(frame).await.is_err() {
                                // Connection manager dropped the pair
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed inbound frame");
                        }
                    }
                }
            });

            Ok(TransportPair {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}
