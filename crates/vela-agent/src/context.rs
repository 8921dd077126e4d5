//! Shared per-task state: the conversation store, the ask gate, the event
//! channel and the cancellation token.
//!
//! Every UI write goes through here so timestamps stay monotonic, partial
//! messages are amended rather than duplicated, and nothing is posted once
//! the task has been aborted.

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use vela_ai::Message;

use crate::ask::AskGate;
use crate::error::{Error, Result};
use crate::events::TaskEvent;
use crate::message::{ApiRequestInfo, AskKind, AskReply, SayKind, UiKind, UiMessage};
use crate::mistakes::MistakeTracker;
use crate::store::ConversationStore;

const EVENT_CAPACITY: usize = 1024;

pub struct TaskContext {
    task_id: String,
    store: Mutex<ConversationStore>,
    asks: AskGate,
    events: broadcast::Sender<TaskEvent>,
    cancel: CancellationToken,
    pub(crate) mistakes: Mutex<MistakeTracker>,
}

impl TaskContext {
    pub(crate) fn new(store: ConversationStore, mistake_limit: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            task_id: store.task_store().task_id().to_string(),
            store: Mutex::new(store),
            asks: AskGate::default(),
            events,
            cancel: CancellationToken::new(),
            mistakes: Mutex::new(MistakeTracker::new(mistake_limit)),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }

    fn check_aborted(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Post a complete say message
    pub fn say(&self, kind: SayKind, text: &str, images: Vec<String>) -> Result<i64> {
        self.post(UiKind::Say { say: kind }, text, images, false)
    }

    /// Post or amend a streaming say. A partial message of the same kind at
    /// the end of the log is updated in place; anything else appends.
    pub fn say_streaming(&self, kind: SayKind, text: &str, partial: bool) -> Result<i64> {
        self.post(UiKind::Say { say: kind }, text, Vec::new(), partial)
    }

    /// Stream a preview of an upcoming ask
    pub fn ask_partial(&self, kind: AskKind, text: &str) -> Result<i64> {
        self.post(UiKind::Ask { ask: kind }, text, Vec::new(), true)
    }

    /// Post an ask and wait for the user's answer.
    ///
    /// A partial preview of the same kind is finalized in place and keeps its
    /// `ts`. The ticket is registered before the message is posted.
    pub async fn ask(&self, kind: AskKind, text: &str) -> Result<AskReply> {
        self.check_aborted()?;
        let ui_kind = UiKind::Ask { ask: kind };
        let (ticket, event) = {
            let mut store = self.store.lock();
            let partial_ts = store
                .last_ui()
                .filter(|m| m.partial && m.kind == ui_kind)
                .map(|m| m.ts);
            match partial_ts {
                Some(ts) => {
                    let ticket = self.asks.open(ts);
                    let message = store
                        .amend_last_partial(text, false)?
                        .ok_or_else(|| Error::Other("partial ask vanished".to_string()))?;
                    (ticket, TaskEvent::MessageUpdated { message })
                }
                None => {
                    let ts = store.next_ts();
                    let ticket = self.asks.open(ts);
                    let message = UiMessage::ask(ts, kind, text, false);
                    store.append_ui(message.clone())?;
                    (ticket, TaskEvent::MessageAdded { message })
                }
            }
        };
        tracing::debug!("Waiting on {:?} ask {}", kind, ticket.ask_ts());
        self.emit(event);
        self.asks.wait(ticket, &self.cancel).await
    }

    fn post(&self, kind: UiKind, text: &str, images: Vec<String>, partial: bool) -> Result<i64> {
        self.check_aborted()?;
        let (ts, event) = {
            let mut store = self.store.lock();
            let amend = store.last_ui().is_some_and(|m| m.partial && m.kind == kind);
            if amend {
                let mut message = store
                    .amend_last_partial(text, partial)?
                    .ok_or_else(|| Error::Other("partial message vanished".to_string()))?;
                if !images.is_empty() {
                    let ts = message.ts;
                    if let Some(updated) = store.update_ui(ts, |m| m.images = images)? {
                        message = updated;
                    }
                }
                (message.ts, TaskEvent::MessageUpdated { message })
            } else {
                let ts = store.next_ts();
                let message = UiMessage {
                    ts,
                    kind,
                    text: text.to_string(),
                    images,
                    partial,
                };
                store.append_ui(message.clone())?;
                (ts, TaskEvent::MessageAdded { message })
            }
        };
        self.emit(event);
        Ok(ts)
    }

    /// Answer the live ask; false if `ask_ts` is stale
    pub(crate) fn respond(&self, ask_ts: i64, reply: AskReply) -> bool {
        self.asks.respond(ask_ts, reply)
    }

    pub(crate) fn pending_ask_ts(&self) -> Option<i64> {
        self.asks.pending_ts()
    }

    /// Fire the cancellation token and wake every pending ask
    pub(crate) fn abort(&self) {
        tracing::info!("Aborting task {}", self.task_id);
        self.cancel.cancel();
        self.asks.cancel_all();
    }

    /// Drop a pending ask whose waiter has gone away
    pub(crate) fn cancel_pending_asks(&self) {
        self.asks.cancel_all();
    }

    pub(crate) fn append_turn(&self, turn: Message) -> Result<()> {
        self.store.lock().append_turn(turn)
    }

    pub(crate) fn history(&self) -> Vec<Message> {
        self.store.lock().history().to_vec()
    }

    pub fn ui_messages(&self) -> Vec<UiMessage> {
        self.store.lock().ui_messages().to_vec()
    }

    /// Edit the `api_req_started` payload at `ts`. Works after abort.
    pub(crate) fn update_api_request(&self, ts: i64, edit: impl FnOnce(&mut ApiRequestInfo)) -> Result<()> {
        let updated = self.store.lock().update_ui(ts, |m| {
            let mut info = ApiRequestInfo::from_text(&m.text);
            edit(&mut info);
            m.text = info.to_text();
        })?;
        if let Some(message) = updated {
            self.emit(TaskEvent::MessageUpdated { message });
        }
        Ok(())
    }

    /// Close out a dangling partial message. Works after abort.
    pub(crate) fn finalize_partial_ui(&self) -> Result<()> {
        let updated = {
            let mut store = self.store.lock();
            let text = match store.last_ui() {
                Some(m) if m.partial => m.text.clone(),
                _ => return Ok(()),
            };
            store.amend_last_partial(&text, false)?
        };
        if let Some(message) = updated {
            self.emit(TaskEvent::MessageUpdated { message });
        }
        Ok(())
    }

    /// Withdraw a streamed ask preview that will never be asked
    pub(crate) fn discard_partial_ask(&self) -> Result<()> {
        let removed = {
            let mut store = self.store.lock();
            let preview = store.last_ui().is_some_and(|m| m.partial && m.ask_kind().is_some());
            if preview {
                store.remove_last_partial()?
            } else {
                None
            }
        };
        if let Some(message) = removed {
            tracing::debug!("Withdrew {:?} preview {}", message.ask_kind(), message.ts);
            self.emit(TaskEvent::MessageRemoved { ts: message.ts });
        }
        Ok(())
    }
}
