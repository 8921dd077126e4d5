//! Ask fencing.
//!
//! At most one ask is live per task. Opening a new ticket drops the previous
//! responder, so whoever was waiting on it wakes with `AskSuperseded` instead
//! of hanging. Answers carry the ask's `ts`; an answer for anything but the
//! live ask is rejected.

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::message::AskReply;

struct PendingAsk {
    generation: u64,
    ask_ts: i64,
    responder: oneshot::Sender<AskReply>,
}

#[derive(Default)]
struct GateState {
    generation: u64,
    pending: Option<PendingAsk>,
}

/// A registered ask waiting for its answer
pub(crate) struct AskTicket {
    generation: u64,
    ask_ts: i64,
    rx: oneshot::Receiver<AskReply>,
}

impl AskTicket {
    pub(crate) fn ask_ts(&self) -> i64 {
        self.ask_ts
    }
}

#[derive(Default)]
pub(crate) struct AskGate {
    state: Mutex<GateState>,
}

impl AskGate {
    /// Register a new live ask, superseding any previous one.
    ///
    /// Must be called before the ask message is posted so an immediate
    /// answer cannot race the registration.
    pub(crate) fn open(&self, ask_ts: i64) -> AskTicket {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        if let Some(prev) = state.pending.replace(PendingAsk {
            generation,
            ask_ts,
            responder: tx,
        }) {
            tracing::debug!("Ask {} superseded by {}", prev.ask_ts, ask_ts);
        }
        AskTicket {
            generation,
            ask_ts,
            rx,
        }
    }

    /// Deliver an answer to the live ask. Returns false for a stale `ask_ts`.
    pub(crate) fn respond(&self, ask_ts: i64, reply: AskReply) -> bool {
        let pending = {
            let mut state = self.state.lock();
            match &state.pending {
                Some(p) if p.ask_ts == ask_ts => state.pending.take(),
                Some(p) => {
                    tracing::warn!("Ignoring answer for stale ask {} (live ask is {})", ask_ts, p.ask_ts);
                    None
                }
                None => {
                    tracing::warn!("Ignoring answer for ask {}: nothing is pending", ask_ts);
                    None
                }
            }
        };
        match pending {
            Some(p) => p.responder.send(reply).is_ok(),
            None => false,
        }
    }

    /// Wait for the ticket's answer, failing fast on abort or supersession
    pub(crate) async fn wait(&self, ticket: AskTicket, cancel: &CancellationToken) -> Result<AskReply> {
        let AskTicket { generation, rx, .. } = ticket;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Aborted),
            reply = rx => reply.map_err(|_| {
                if cancel.is_cancelled() {
                    Error::Aborted
                } else {
                    Error::AskSuperseded
                }
            }),
        };
        self.clear(generation);
        result
    }

    /// The `ts` of the live ask, if any
    pub(crate) fn pending_ts(&self) -> Option<i64> {
        self.state.lock().pending.as_ref().map(|p| p.ask_ts)
    }

    /// Drop every pending responder; waiters wake immediately.
    pub(crate) fn cancel_all(&self) {
        self.state.lock().pending = None;
    }

    fn clear(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.pending.as_ref().is_some_and(|p| p.generation == generation) {
            state.pending = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_answer_reaches_live_ask() {
        let gate = AskGate::default();
        let cancel = CancellationToken::new();
        let ticket = gate.open(10);
        assert_eq!(gate.pending_ts(), Some(10));
        assert!(gate.respond(10, AskReply::yes()));
        let reply = gate.wait(ticket, &cancel).await.unwrap();
        assert!(reply.is_yes());
        assert_eq!(gate.pending_ts(), None);
    }

    #[tokio::test]
    async fn test_new_ask_supersedes_old() {
        let gate = AskGate::default();
        let cancel = CancellationToken::new();
        let first = gate.open(1);
        let second = gate.open(2);

        let err = gate.wait(first, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::AskSuperseded));

        // stale answer is rejected, the live one is not disturbed
        assert!(!gate.respond(1, AskReply::yes()));
        assert_eq!(gate.pending_ts(), Some(2));

        assert!(gate.respond(2, AskReply::message("go")));
        let reply = gate.wait(second, &cancel).await.unwrap();
        assert_eq!(reply.feedback(), Some("go"));
    }

    #[tokio::test]
    async fn test_abort_wakes_waiter() {
        let gate = AskGate::default();
        let cancel = CancellationToken::new();
        let ticket = gate.open(5);
        cancel.cancel();
        gate.cancel_all();
        let err = gate.wait(ticket, &cancel).await.unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn test_abort_while_waiting() {
        let gate = std::sync::Arc::new(AskGate::default());
        let cancel = CancellationToken::new();
        let ticket = gate.open(7);

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            c.cancel();
        });

        let err = gate.wait(ticket, &cancel).await.unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(gate.pending_ts(), None);
    }

    #[test]
    fn test_respond_without_pending() {
        let gate = AskGate::default();
        assert!(!gate.respond(3, AskReply::no()));
    }
}
