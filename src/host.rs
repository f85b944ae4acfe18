//! Stdio bridge between the orchestrator and its page/panel peers
//!
//! One JSON object per line. Inbound (stdin):
//! `{"from":"page"|"panel","id"?:n,"message":{...}}`. Outbound (stdout):
//! `{"to":"page"|"panel","id"?:n,"message":{...}}`. An inbound frame with an
//! `id` is a request; its reply goes out with the same `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bus::{decode_value, Context, Mailbox, Message, MessageBus};

#[derive(Error, Debug)]
pub enum HostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Serialize for HostError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    from: Context,
    #[serde(default)]
    id: Option<u64>,
    message: Value,
}

#[derive(Debug, Serialize)]
struct OutboundFrame {
    to: Context,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    message: Message,
}

/// Relay frames until `reader` reaches EOF. The orchestrator mailbox must
/// already be registered and served; page and panel mailboxes are
/// registered here.
pub async fn serve<R, W>(
    bus: MessageBus,
    reader: R,
    writer: W,
    request_timeout: Duration,
) -> Result<(), HostError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let writer_task = tokio::spawn(write_frames(writer, out_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut forwarders = JoinSet::new();
    for context in [Context::Page, Context::Panel] {
        let mailbox = bus.register(context);
        forwarders.spawn(forward(mailbox, out_tx.clone(), shutdown_rx.clone()));
    }

    let mut requests = JoinSet::new();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let frame: InboundFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Malformed frame");
                continue;
            }
        };
        if frame.from == Context::Orchestrator {
            warn!("Frame claims to come from the orchestrator, dropped");
            continue;
        }
        let Some(message) = decode_value(frame.message) else {
            continue;
        };

        let endpoint = bus.endpoint(frame.from);
        match frame.id {
            Some(id) => {
                let out = out_tx.clone();
                requests.spawn(async move {
                    match endpoint.request(Context::Orchestrator, &message, request_timeout).await {
                        Ok(reply) => {
                            let _ = out.send(OutboundFrame {
                                to: endpoint.context(),
                                id: Some(id),
                                message: reply,
                            });
                        }
                        Err(e) => warn!(id, kind = message.kind(), error = %e, "Request failed"),
                    }
                });
            }
            None => {
                if let Err(e) = endpoint.notify(Context::Orchestrator, &message) {
                    warn!(kind = message.kind(), error = %e, "Notification dropped");
                }
            }
        }
    }

    info!("Input closed, shutting down bridge");
    while requests.join_next().await.is_some() {}
    let _ = shutdown_tx.send(true);
    while forwarders.join_next().await.is_some() {}
    drop(out_tx);
    match writer_task.await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Writer task failed");
            Ok(())
        }
    }
}

/// Copy one context's mailbox to the output until shutdown, then drain
async fn forward(
    mut mailbox: Mailbox,
    out: mpsc::UnboundedSender<OutboundFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let to = mailbox.context();
    loop {
        tokio::select! {
            delivery = mailbox.recv() => match delivery {
                Some(delivery) => {
                    let _ = out.send(OutboundFrame { to, id: None, message: delivery.message });
                }
                None => return,
            },
            _ = shutdown.changed() => {
                while let Some(delivery) = mailbox.try_recv() {
                    let _ = out.send(OutboundFrame { to, id: None, message: delivery.message });
                }
                return;
            }
        }
    }
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<OutboundFrame>) -> Result<(), HostError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        debug!(to = frame.to.as_str(), kind = frame.message.kind(), "Frame written");
    }
    Ok(())
}
