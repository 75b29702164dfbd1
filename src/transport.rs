//! Connection transport: one socket per logical channel, a read-loop task
//! that decodes and routes inbound frames, and a writer task owning the
//! socket's write half.
//!
//! All writes funnel through one mpsc queue into the writer task, which is
//! the single-writer discipline the stream needs; reads and writes never
//! block each other. The read loop routes each decoded frame by serial:
//! 0 goes to the push dispatcher, anything else resolves the pending
//! table. On EOF, I/O error, or a framing error the loop reports a `Down`
//! event and stops; recovery belongs to the channel supervisor, a
//! connection never self-heals.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::EndpointConfig;
use crate::dispatch::PushDispatcher;
use crate::error::{GatelinkError, Result};
use crate::frame;
use crate::pending::PendingTable;
use crate::state::ChannelKind;

/// Events the transport reports to the channel supervisor.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// Any frame arrived; doubles as the liveness signal.
    Inbound { generation: u64 },
    /// The connection is gone. Carries the generation so stale reports
    /// from a replaced connection are ignored.
    Down { generation: u64, reason: String },
}

/// One live physical connection.
pub(crate) struct Conn {
    write_tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Conn {
    /// Dial the endpoint and spawn the I/O tasks for this connection.
    pub(crate) async fn establish(
        channel: ChannelKind,
        endpoint: &EndpointConfig,
        connect_timeout: Duration,
        max_body_len: u32,
        generation: u64,
        pending: Arc<PendingTable>,
        dispatcher: Arc<PushDispatcher>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| GatelinkError::Timeout(connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!(channel = channel.as_str(), %addr, generation, "transport connected");

        let (mut read_half, mut write_half) = stream.into_split();
        let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(1024);

        let writer_events = event_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = write_rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    let _ = writer_events
                        .send(TransportEvent::Down {
                            generation,
                            reason: format!("write failed: {e}"),
                        })
                        .await;
                    return;
                }
            }
            // Sender side dropped: connection replaced or shut down.
            let _ = write_half.shutdown().await;
        });

        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(16 * 1024);
            let reason = loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => break "peer closed connection".to_string(),
                    Ok(_) => {
                        match drain_frames(&mut buf, max_body_len, generation, &pending, &dispatcher, &event_tx) {
                            Ok(()) => {}
                            Err(e) => break e.to_string(),
                        }
                    }
                    Err(e) => break format!("read failed: {e}"),
                }
            };
            let _ = event_tx.send(TransportEvent::Down { generation, reason }).await;
        });

        Ok(Self { write_tx, reader, writer })
    }

    /// Handle on the write queue, shareable with request issuers.
    pub(crate) fn write_handle(&self) -> mpsc::Sender<Bytes> {
        self.write_tx.clone()
    }

    /// Tear the connection down. Idempotent; stops both I/O tasks.
    pub(crate) fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decode and route every complete frame currently in `buf`.
fn drain_frames(
    buf: &mut BytesMut,
    max_body_len: u32,
    generation: u64,
    pending: &PendingTable,
    dispatcher: &PushDispatcher,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> Result<()> {
    while let Some(frame) = frame::decode(buf, max_body_len)? {
        // Liveness notification only; drop it rather than stall framing
        // when the supervisor is busy.
        let _ = event_tx.try_send(TransportEvent::Inbound { generation });
        if frame.is_push() {
            trace!(protocol_id = frame.protocol_id, "push frame received");
            dispatcher.dispatch(&frame);
        } else {
            pending.complete(frame.serial, frame.protocol_id, frame.body);
        }
    }
    Ok(())
}
