//! Presents the blocks of the streaming assistant turn, one at a time.
//!
//! Every chunk from the model triggers a presentation pass. Only one pass
//! runs at once; a pass requested while another is running leaves a rescan
//! flag and returns, and the running pass picks the new blocks up before it
//! unlocks. Blocks are handed to the [`BlockHandler`] strictly in index order,
//! and a partial block is handed over again each time it grows.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use vela_ai::ContentBlock;

use crate::dispatch::TurnPolicy;
use crate::error::Result;
use crate::parser::AssistantBlock;

/// Single-flight guard for presentation passes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PresentLock {
    #[default]
    Idle,
    Presenting,
    /// Presenting, and new blocks arrived while the pass was busy
    PresentingWithPendingRescan,
}

impl PresentLock {
    /// Take the lock. If it is held, record a rescan request and return false.
    pub fn try_enter(&mut self) -> bool {
        match self {
            PresentLock::Idle => {
                *self = PresentLock::Presenting;
                true
            }
            PresentLock::Presenting | PresentLock::PresentingWithPendingRescan => {
                *self = PresentLock::PresentingWithPendingRescan;
                false
            }
        }
    }

    /// Release the lock, returning whether a rescan was requested meanwhile
    pub fn release(&mut self) -> bool {
        let rescan = *self == PresentLock::PresentingWithPendingRescan;
        *self = PresentLock::Idle;
        rescan
    }
}

/// Mutable state of the assistant turn being streamed
#[derive(Debug)]
pub struct TurnState {
    pub blocks: Vec<AssistantBlock>,
    pub stream_complete: bool,
    pub lock: PresentLock,
    pub current_block_index: usize,
    /// All blocks have been presented and the stream is over
    pub user_content_ready: bool,
    /// Results and notes collected for the next user turn
    pub user_content: Vec<ContentBlock>,
    pub policy: TurnPolicy,
    /// A tool result ended the task
    pub completed: bool,
    nonce: String,
}

impl TurnState {
    pub fn new() -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self {
            blocks: Vec::new(),
            stream_complete: false,
            lock: PresentLock::Idle,
            current_block_index: 0,
            user_content_ready: false,
            user_content: Vec::new(),
            policy: TurnPolicy::default(),
            completed: false,
            nonce: nonce[..8].to_string(),
        }
    }

    /// Stable id of the tool call at `index` in this turn
    pub fn tool_use_id(&self, index: usize) -> String {
        format!("toolu_{}_{}", index, self.nonce)
    }

    /// Replace the blocks with a fresh parse. Growth means more work for
    /// the presenter, so the turn is no longer ready.
    pub fn update_blocks(&mut self, blocks: Vec<AssistantBlock>) {
        if blocks.len() > self.blocks.len() {
            self.user_content_ready = false;
        }
        self.blocks = blocks;
    }

    /// Freeze the blocks once the stream has ended
    pub fn complete_stream(&mut self) {
        for block in &mut self.blocks {
            block.finalize();
        }
        self.stream_complete = true;
    }

    /// Model-facing form of the blocks.
    ///
    /// With `complete_only`, partial tool calls are left out; used when the
    /// turn was cut short.
    pub fn assistant_content(&self, complete_only: bool) -> Vec<ContentBlock> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, block)| match block {
                AssistantBlock::Text { content, .. } => Some(ContentBlock::text(content.clone())),
                AssistantBlock::ToolUse { partial: true, .. } if complete_only => None,
                AssistantBlock::ToolUse { name, params, .. } => Some(ContentBlock::ToolUse {
                    id: self.tool_use_id(i),
                    name: name.clone(),
                    input: params.clone(),
                }),
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.blocks.iter().any(AssistantBlock::is_tool_use)
    }
}

impl Default for TurnState {
    fn default() -> Self {
        Self::new()
    }
}

/// Does the actual work for one block
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn handle_block(&self, index: usize, block: AssistantBlock) -> Result<()>;
}

/// Walks the turn's blocks under the single-flight lock
pub struct Presenter {
    turn: Arc<Mutex<TurnState>>,
    handler: Arc<dyn BlockHandler>,
}

impl Presenter {
    pub fn new(turn: Arc<Mutex<TurnState>>, handler: Arc<dyn BlockHandler>) -> Self {
        Self { turn, handler }
    }

    /// Run a presentation pass, or leave a rescan request if one is running
    pub async fn present(&self) -> Result<()> {
        if !self.turn.lock().lock.try_enter() {
            return Ok(());
        }

        loop {
            let next = {
                let mut turn = self.turn.lock();
                if turn.current_block_index >= turn.blocks.len() {
                    if turn.stream_complete {
                        turn.user_content_ready = true;
                    }
                    None
                } else {
                    let index = turn.current_block_index;
                    Some((index, turn.blocks[index].clone()))
                }
            };

            if let Some((index, block)) = next {
                let partial = block.is_partial();
                if let Err(e) = self.handler.handle_block(index, block).await {
                    self.turn.lock().lock.release();
                    return Err(e);
                }

                let mut turn = self.turn.lock();
                if !partial || turn.policy.short_circuits() {
                    turn.current_block_index += 1;
                    if turn.current_block_index < turn.blocks.len() {
                        continue;
                    }
                    if turn.stream_complete {
                        turn.user_content_ready = true;
                    }
                }
            }

            let mut turn = self.turn.lock();
            if turn.lock.release() && turn.lock.try_enter() {
                continue;
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchOutcome;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(usize, bool)>>,
        turn: Mutex<Option<Arc<Mutex<TurnState>>>>,
        hold: Mutex<Option<Arc<tokio::sync::Notify>>>,
    }

    #[async_trait]
    impl BlockHandler for Recorder {
        async fn handle_block(&self, index: usize, block: AssistantBlock) -> Result<()> {
            self.seen.lock().push((index, block.is_partial()));
            let hold = self.hold.lock().take();
            if let Some(hold) = hold {
                hold.notified().await;
            }
            tokio::task::yield_now().await;
            if block.is_tool_use() && !block.is_partial() {
                if let Some(turn) = self.turn.lock().as_ref() {
                    turn.lock().policy.record(&DispatchOutcome::Executed);
                }
            }
            Ok(())
        }
    }

    fn text(content: &str, partial: bool) -> AssistantBlock {
        AssistantBlock::Text {
            content: content.into(),
            partial,
        }
    }

    fn tool(partial: bool) -> AssistantBlock {
        AssistantBlock::ToolUse {
            name: "read_file".into(),
            params: BTreeMap::new(),
            partial,
        }
    }

    fn setup() -> (Arc<Mutex<TurnState>>, Arc<Recorder>, Presenter) {
        let turn = Arc::new(Mutex::new(TurnState::new()));
        let recorder = Arc::new(Recorder::default());
        *recorder.turn.lock() = Some(Arc::clone(&turn));
        let presenter = Presenter::new(Arc::clone(&turn), recorder.clone());
        (turn, recorder, presenter)
    }

    #[test]
    fn test_lock_transitions() {
        let mut lock = PresentLock::default();
        assert!(lock.try_enter());
        assert!(!lock.try_enter());
        assert_eq!(lock, PresentLock::PresentingWithPendingRescan);
        assert!(lock.release());
        assert_eq!(lock, PresentLock::Idle);
        assert!(lock.try_enter());
        assert!(!lock.release());
    }

    #[tokio::test]
    async fn test_blocks_in_order_and_ready() {
        let (turn, recorder, presenter) = setup();
        turn.lock().update_blocks(vec![text("a", false), text("b", false)]);
        turn.lock().complete_stream();
        presenter.present().await.unwrap();

        assert_eq!(*recorder.seen.lock(), vec![(0, false), (1, false)]);
        let t = turn.lock();
        assert!(t.user_content_ready);
        assert_eq!(t.lock, PresentLock::Idle);
    }

    #[tokio::test]
    async fn test_partial_block_is_revisited() {
        let (turn, recorder, presenter) = setup();
        turn.lock().update_blocks(vec![text("Hel", true)]);
        presenter.present().await.unwrap();
        assert_eq!(turn.lock().current_block_index, 0);
        assert!(!turn.lock().user_content_ready);

        turn.lock().update_blocks(vec![text("Hello", true)]);
        turn.lock().complete_stream();
        presenter.present().await.unwrap();

        assert_eq!(*recorder.seen.lock(), vec![(0, true), (0, false)]);
        assert!(turn.lock().user_content_ready);
    }

    #[tokio::test]
    async fn test_concurrent_entry_sets_rescan() {
        let (turn, recorder, presenter) = setup();
        let presenter = Arc::new(presenter);
        let hold = Arc::new(tokio::sync::Notify::new());
        *recorder.hold.lock() = Some(Arc::clone(&hold));
        turn.lock().update_blocks(vec![text("a", true)]);

        let first = {
            let p = Arc::clone(&presenter);
            tokio::spawn(async move { p.present().await })
        };
        while recorder.seen.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        // the first pass is parked inside the handler
        turn.lock().update_blocks(vec![text("ab", true)]);
        turn.lock().complete_stream();
        presenter.present().await.unwrap();
        assert_eq!(turn.lock().lock, PresentLock::PresentingWithPendingRescan);

        hold.notify_one();
        first.await.unwrap().unwrap();

        assert_eq!(*recorder.seen.lock(), vec![(0, true), (0, false)]);
        assert!(turn.lock().user_content_ready);
        assert_eq!(turn.lock().lock, PresentLock::Idle);
    }

    #[tokio::test]
    async fn test_short_circuit_advances_partial() {
        let (turn, recorder, presenter) = setup();
        turn.lock().update_blocks(vec![tool(false), tool(true)]);
        presenter.present().await.unwrap();

        // the second call is partial, but a tool already ran this turn
        assert_eq!(*recorder.seen.lock(), vec![(0, false), (1, true)]);
        assert_eq!(turn.lock().current_block_index, 2);
        assert!(!turn.lock().user_content_ready);
    }

    #[test]
    fn test_assistant_content_ids() {
        let mut turn = TurnState::new();
        turn.update_blocks(vec![text("hi", false), tool(false), tool(true)]);
        let all = turn.assistant_content(false);
        assert_eq!(all.len(), 3);
        let complete = turn.assistant_content(true);
        assert_eq!(complete.len(), 2);
        match &complete[1] {
            ContentBlock::ToolUse { id, .. } => assert_eq!(*id, turn.tool_use_id(1)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
