//! Root sentinel driver
//!
//! Owns an `InteractionObserver` on a tokio task. Container mutations are
//! handled as they arrive; the root check runs once the page has been quiet
//! for the debounce window.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::dom::{DomTree, MutationRecord};
use super::InteractionObserver;
use crate::bus::{Mailbox, Message};
use crate::policy::SplitPolicy;

/// Default quiescence window before a root check
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Shared page model plus the channel its mutation batches are reported on
#[derive(Clone)]
pub struct LivePage {
    dom: Arc<Mutex<DomTree>>,
    tx: mpsc::UnboundedSender<Vec<MutationRecord>>,
}

impl LivePage {
    pub fn new(dom: DomTree) -> (Self, mpsc::UnboundedReceiver<Vec<MutationRecord>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                dom: Arc::new(Mutex::new(dom)),
                tx,
            },
            rx,
        )
    }

    /// Apply a change and report the records it produced as one batch
    pub fn mutate<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut DomTree, &mut Vec<MutationRecord>) -> R,
    {
        let mut records = Vec::new();
        let out = {
            let mut dom = self.dom.lock();
            f(&mut dom, &mut records)
        };
        if !records.is_empty() && self.tx.send(records).is_err() {
            tracing::debug!("Sentinel gone, mutation batch dropped");
        }
        out
    }

    pub fn read<R, F: FnOnce(&DomTree) -> R>(&self, f: F) -> R {
        f(&self.dom.lock())
    }
}

/// Read side of a `LivePage` held by the driver. It carries no sender, so
/// the mutation channel closes once every `LivePage` is dropped.
struct PageView(Arc<Mutex<DomTree>>);

impl PageView {
    fn read<R, F: FnOnce(&DomTree) -> R>(&self, f: F) -> R {
        f(&self.0.lock())
    }
}

/// Instructions from the page adapter to the running observer
#[derive(Debug, Clone)]
pub enum ObserverCommand {
    BindSegment(Option<String>),
    BindConversation(Option<String>),
    ResetCount,
    ResponseLength(usize),
    SetPolicy(SplitPolicy),
}

pub struct SentinelHandle {
    commands: mpsc::UnboundedSender<ObserverCommand>,
    task: JoinHandle<InteractionObserver>,
}

impl SentinelHandle {
    pub fn send(&self, command: ObserverCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Stop accepting commands and wait for the driver to finish. The driver
    /// exits once the page's mutation channel closes.
    pub async fn join(self) -> Option<InteractionObserver> {
        drop(self.commands);
        self.task.await.ok()
    }
}

/// Start driving `observer` against `page`. `inbox`, when given, is the page
/// context's mailbox; `NAVIGATE_SEGMENT` arriving there rebinds the observer.
pub fn spawn_sentinel(
    observer: InteractionObserver,
    page: &LivePage,
    mutations: mpsc::UnboundedReceiver<Vec<MutationRecord>>,
    inbox: Option<Mailbox>,
    debounce: Duration,
) -> SentinelHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let view = PageView(page.dom.clone());
    let task = tokio::spawn(run(observer, view, mutations, commands_rx, inbox, debounce));
    SentinelHandle {
        commands: commands_tx,
        task,
    }
}

async fn recv_inbox(inbox: &mut Option<Mailbox>) -> Option<Message> {
    match inbox {
        Some(mailbox) => mailbox.recv().await.map(|d| d.message),
        None => std::future::pending().await,
    }
}

async fn run(
    mut observer: InteractionObserver,
    page: PageView,
    mut mutations: mpsc::UnboundedReceiver<Vec<MutationRecord>>,
    mut commands: mpsc::UnboundedReceiver<ObserverCommand>,
    mut inbox: Option<Mailbox>,
    debounce: Duration,
) -> InteractionObserver {
    // The conversation may already be rendered
    page.read(|dom| observer.on_root_tick(dom));

    let mut deadline: Option<Instant> = None;
    let mut commands_open = true;

    loop {
        tokio::select! {
            batch = mutations.recv() => {
                let Some(records) = batch else {
                    break;
                };
                page.read(|dom| observer.on_container_mutations(dom, &records));
                deadline = Some(Instant::now() + debounce);
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                page.read(|dom| observer.on_root_tick(dom));
            }
            command = commands.recv(), if commands_open => {
                match command {
                    Some(ObserverCommand::BindSegment(id)) => observer.bind_segment(id),
                    Some(ObserverCommand::BindConversation(url)) => observer.bind_conversation(url),
                    Some(ObserverCommand::ResetCount) => page.read(|dom| observer.reset_interaction_count(dom)),
                    Some(ObserverCommand::ResponseLength(chars)) => observer.observe_response_length(chars),
                    Some(ObserverCommand::SetPolicy(policy)) => observer.set_policy(policy),
                    None => commands_open = false,
                }
            }
            message = recv_inbox(&mut inbox), if inbox.is_some() => {
                match message {
                    Some(Message::NavigateSegment { segment_id }) => {
                        observer.navigate_to(segment_id);
                        deadline = Some(Instant::now() + debounce);
                    }
                    Some(_) => {}
                    None => inbox = None,
                }
            }
        }
    }

    tracing::debug!("Root sentinel stopped");
    observer
}
