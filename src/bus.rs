//! Message bus
//!
//! Connects the isolated execution contexts (page, orchestrator, panel). Only
//! serialized JSON crosses a context boundary; every receiver decodes into the
//! closed `Message` enum and skips shapes it does not recognize.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::model::{ArtifactManifest, BriefMetadata, Segment, Thread};
use crate::orchestrator::progress::CheckpointStage;
use crate::policy::SplitReason;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    #[serde(rename_all = "camelCase")]
    InteractionDetected {
        count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        segment_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SplitTriggered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        segment_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<SplitReason>,
        /// Set when the page knows the conversation but not its segment
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CheckpointStart { segment_id: String },
    #[serde(rename_all = "camelCase")]
    CheckpointProgress {
        stage: CheckpointStage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CheckpointComplete {
        segment_id: String,
        new_segment_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CheckpointError { stage: CheckpointStage, error: String },
    #[serde(rename_all = "camelCase")]
    BriefReady {
        segment_id: String,
        brief: BriefMetadata,
    },
    #[serde(rename_all = "camelCase")]
    ArtifactExtracted {
        segment_id: String,
        manifest: ArtifactManifest,
    },
    #[serde(rename_all = "camelCase")]
    ProjectCreated {
        thread_id: String,
        project_url: String,
    },
    ManualCheckpoint,
    GetThreadState,
    ThreadState {
        thread: Option<Thread>,
        segments: Vec<Segment>,
    },
    #[serde(rename_all = "camelCase")]
    NavigateSegment { segment_id: String },
    TitleDetected {
        title: String,
        /// Segment the page is bound to, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        segment_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_url: Option<String>,
    },
}

impl Message {
    /// Wire discriminant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::InteractionDetected { .. } => "INTERACTION_DETECTED",
            Message::SplitTriggered { .. } => "SPLIT_TRIGGERED",
            Message::CheckpointStart { .. } => "CHECKPOINT_START",
            Message::CheckpointProgress { .. } => "CHECKPOINT_PROGRESS",
            Message::CheckpointComplete { .. } => "CHECKPOINT_COMPLETE",
            Message::CheckpointError { .. } => "CHECKPOINT_ERROR",
            Message::BriefReady { .. } => "BRIEF_READY",
            Message::ArtifactExtracted { .. } => "ARTIFACT_EXTRACTED",
            Message::ProjectCreated { .. } => "PROJECT_CREATED",
            Message::ManualCheckpoint => "MANUAL_CHECKPOINT",
            Message::GetThreadState => "GET_THREAD_STATE",
            Message::ThreadState { .. } => "THREAD_STATE",
            Message::NavigateSegment { .. } => "NAVIGATE_SEGMENT",
            Message::TitleDetected { .. } => "TITLE_DETECTED",
        }
    }

    pub fn encode(&self) -> Result<String, BusError> {
        serde_json::to_string(self).map_err(BusError::Encode)
    }
}

/// Decode a serialized message. Unknown or malformed payloads yield `None`.
pub fn decode(payload: &str) -> Option<Message> {
    match serde_json::from_str::<Message>(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unrecognized message");
            None
        }
    }
}

/// Same as `decode` for an already-parsed JSON value
pub fn decode_value(value: serde_json::Value) -> Option<Message> {
    match serde_json::from_value::<Message>(value) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unrecognized message");
            None
        }
    }
}

/// Execution context a mailbox belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Context {
    Page,
    Orchestrator,
    Panel,
}

impl Context {
    pub fn as_str(&self) -> &'static str {
        match self {
            Context::Page => "page",
            Context::Orchestrator => "orchestrator",
            Context::Panel => "panel",
        }
    }
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("No receiver registered for {0:?}")]
    NoReceiver(Context),
    #[error("Receiver for {0:?} has closed")]
    Closed(Context),
    #[error("Request to {to:?} timed out after {timeout_ms}ms")]
    Timeout { to: Context, timeout_ms: u128 },
    #[error("Request to {0:?} was dropped without a response")]
    NoResponse(Context),
    #[error("Response from {0:?} was not a recognized message")]
    BadResponse(Context),
    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

impl Serialize for BusError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct Envelope {
    from: Context,
    payload: String,
    reply: Option<oneshot::Sender<String>>,
}

/// Hub connecting the registered contexts
#[derive(Clone, Default)]
pub struct MessageBus {
    routes: Arc<RwLock<HashMap<Context, mpsc::UnboundedSender<Envelope>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the mailbox for `context`
    pub fn register(&self, context: Context) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.routes.write().insert(context, tx).is_some() {
            tracing::debug!(context = context.as_str(), "Replaced mailbox");
        }
        Mailbox { context, rx }
    }

    /// Sending handle that stamps `context` as the origin
    pub fn endpoint(&self, context: Context) -> Endpoint {
        Endpoint {
            context,
            bus: self.clone(),
        }
    }

    fn deliver(&self, to: Context, envelope: Envelope) -> Result<(), BusError> {
        let routes = self.routes.read();
        let sender = routes.get(&to).ok_or(BusError::NoReceiver(to))?;
        sender.send(envelope).map_err(|_| BusError::Closed(to))
    }
}

/// Origin-stamped sender
#[derive(Clone)]
pub struct Endpoint {
    context: Context,
    bus: MessageBus,
}

impl Endpoint {
    pub fn context(&self) -> Context {
        self.context
    }

    /// Fire-and-forget
    pub fn notify(&self, to: Context, message: &Message) -> Result<(), BusError> {
        self.notify_raw(to, message.encode()?)
    }

    /// Forward an already-serialized payload without inspecting it
    pub fn notify_raw(&self, to: Context, payload: String) -> Result<(), BusError> {
        self.bus.deliver(
            to,
            Envelope {
                from: self.context,
                payload,
                reply: None,
            },
        )
    }

    /// Deliver to every other registered context. Returns how many accepted it.
    pub fn broadcast(&self, message: &Message) -> usize {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Broadcast encode failed");
                return 0;
            }
        };
        let routes = self.bus.routes.read();
        let mut delivered = 0;
        for (to, sender) in routes.iter() {
            if *to == self.context {
                continue;
            }
            let envelope = Envelope {
                from: self.context,
                payload: payload.clone(),
                reply: None,
            };
            if sender.send(envelope).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(to = to.as_str(), kind = message.kind(), "Broadcast target closed");
            }
        }
        delivered
    }

    /// Single-response request bounded by `timeout`
    pub async fn request(&self, to: Context, message: &Message, timeout: Duration) -> Result<Message, BusError> {
        self.request_raw(to, message.encode()?, timeout).await
    }

    pub async fn request_raw(&self, to: Context, payload: String, timeout: Duration) -> Result<Message, BusError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.bus.deliver(
            to,
            Envelope {
                from: self.context,
                payload,
                reply: Some(reply_tx),
            },
        )?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => decode(&response).ok_or(BusError::BadResponse(to)),
            Ok(Err(_)) => Err(BusError::NoResponse(to)),
            Err(_) => Err(BusError::Timeout {
                to,
                timeout_ms: timeout.as_millis(),
            }),
        }
    }
}

/// Receiving side of one context
pub struct Mailbox {
    context: Context,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

/// A decoded message with its origin and, for requests, a way to answer
pub struct Delivery {
    pub from: Context,
    pub message: Message,
    reply: Option<oneshot::Sender<String>>,
}

impl Delivery {
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer a request. Answering a plain notification is a no-op.
    pub fn respond(self, message: &Message) -> Result<(), BusError> {
        let Some(reply) = self.reply else {
            return Ok(());
        };
        let payload = message.encode()?;
        reply.send(payload).map_err(|_| BusError::Closed(self.from))
    }
}

impl Mailbox {
    pub fn context(&self) -> Context {
        self.context
    }

    fn open(&self, envelope: Envelope) -> Option<Delivery> {
        let message = decode(&envelope.payload)?;
        Some(Delivery {
            from: envelope.from,
            message,
            reply: envelope.reply,
        })
    }

    /// Next recognized message; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let envelope = self.rx.recv().await?;
            if let Some(delivery) = self.open(envelope) {
                return Some(delivery);
            }
        }
    }

    /// Next recognized message already queued, without waiting
    pub fn try_recv(&mut self) -> Option<Delivery> {
        while let Ok(envelope) = self.rx.try_recv() {
            if let Some(delivery) = self.open(envelope) {
                return Some(delivery);
            }
        }
        None
    }
}
