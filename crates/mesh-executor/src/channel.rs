//! Control channel seam.
//!
//! The executor only needs reliable in-order command delivery, one reply per
//! command, and one-way notifications. The [`ControlChannel`] trait captures
//! the outbound half; inbound commands arrive as [`Inbound`] values whose
//! reply sender routes the answer back to the originating request.
//!
//! [`JsonLinesChannel`] is the bundled transport: one [`Frame`] per line over
//! a TCP connection to the scheduler. Reconnect policy lives with the
//! scheduler side of the deployment and is not implemented here.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ExecutorResult};
use mesh_proto::{ControlUrl, Frame, Notification};

/// One inbound command and the slot its reply goes into.
#[derive(Debug)]
pub struct Inbound {
    /// Raw command object as received.
    pub request: Value,

    /// Resolves the request; dropping it without sending loses the reply.
    pub reply: oneshot::Sender<Value>,
}

/// Outbound half of the scheduler connection.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Sends a one-way notification.
    async fn notify(&self, notification: &Notification) -> ExecutorResult<()>;

    /// Closes the connection.
    async fn close(&self) -> ExecutorResult<()>;
}

/// Newline-delimited JSON frames over TCP.
pub struct JsonLinesChannel {
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl JsonLinesChannel {
    /// Connects to the scheduler named by `control` and starts the reader
    /// task. Inbound commands are delivered on the returned receiver in
    /// arrival order; the receiver closes when the connection does.
    pub async fn connect(
        control: &ControlUrl,
    ) -> ExecutorResult<(Self, mpsc::UnboundedReceiver<Inbound>)> {
        let stream = TcpStream::connect((control.host(), control.port()))
            .await
            .map_err(|e| ExecutorError::channel(format!("connect {control}: {e}")))?;
        info!(url = %control, "control channel connected");

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(read_half, writer.clone(), inbound_tx));

        Ok((Self { writer }, inbound_rx))
    }
}

async fn read_loop(
    read_half: tokio::net::tcp::OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("control channel closed by peer");
                return;
            }
            Err(e) => {
                warn!(error = %e, "control channel read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match Frame::decode(&line) {
            Ok(Frame::Req { seq, body }) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if inbound_tx
                    .send(Inbound {
                        request: body,
                        reply: reply_tx,
                    })
                    .is_err()
                {
                    return;
                }
                // Responses are matched by seq, so slow handlers must not
                // block the reader.
                let writer = writer.clone();
                tokio::spawn(async move {
                    if let Ok(body) = reply_rx.await {
                        if let Err(e) = write_frame(&writer, &Frame::Rsp { seq, body }).await {
                            warn!(seq = seq, error = %e, "failed to send reply");
                        }
                    }
                });
            }
            Ok(frame) => {
                debug!(?frame, "ignoring non-request frame");
            }
            Err(e) => {
                warn!(error = %e, line = %line, "undecodable frame");
            }
        }
    }
}

async fn write_frame(writer: &Mutex<OwnedWriteHalf>, frame: &Frame) -> ExecutorResult<()> {
    let mut line = frame
        .encode()
        .map_err(|e| ExecutorError::channel(format!("encode frame: {e}")))?;
    line.push('\n');

    let mut writer = writer.lock().await;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ExecutorError::channel(format!("write frame: {e}")))
}

#[async_trait]
impl ControlChannel for JsonLinesChannel {
    async fn notify(&self, notification: &Notification) -> ExecutorResult<()> {
        let body = serde_json::to_value(notification)
            .map_err(|e| ExecutorError::channel(format!("encode notification: {e}")))?;
        write_frame(&self.writer, &Frame::Notify { body }).await
    }

    async fn close(&self) -> ExecutorResult<()> {
        let mut writer = self.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| ExecutorError::channel(format!("close channel: {e}")))
    }
}

/// In-memory channel for tests: records notifications, drops closes.
#[derive(Debug, Default)]
pub struct MockChannel {
    notifications: std::sync::Mutex<Vec<Notification>>,
}

impl MockChannel {
    /// Creates an empty mock channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications sent so far, in order.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().expect("mock lock").clone()
    }
}

#[async_trait]
impl ControlChannel for MockChannel {
    async fn notify(&self, notification: &Notification) -> ExecutorResult<()> {
        self.notifications
            .lock()
            .expect("mock lock")
            .push(notification.clone());
        Ok(())
    }

    async fn close(&self) -> ExecutorResult<()> {
        Ok(())
    }
}
