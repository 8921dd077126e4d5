//! Request retry and rate limiting.
//!
//! A failure before the first chunk is retried: automatically with
//! exponential backoff when auto-retry is on, otherwise after asking the
//! user. Once content has started to flow, a failure ends the request and the
//! caller keeps whatever arrived.

use async_stream::stream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vela_ai::{ApiStreamChunk, Message, ModelClient};

use crate::context::TaskContext;
use crate::error::{Error, Result};
use crate::message::{AskKind, SayKind};

/// Configuration for request retries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retry retryable failures without asking
    pub auto_retry: bool,
    /// Delay before the first automatic retry
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Minimum spacing between consecutive requests
    pub rate_limit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_retry: false,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            rate_limit: Duration::ZERO,
        }
    }
}

impl RetryConfig {
    /// Backoff after the `failures`-th consecutive failure (0-indexed):
    /// `base_delay * 2^failures`, capped at `max_delay`
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Wait before attempt number `attempt` (0 = first try), given how long
    /// ago the previous request went out
    pub fn pre_request_delay(&self, attempt: u32, since_last: Option<Duration>) -> Duration {
        let rate_limit = since_last
            .map(|elapsed| self.rate_limit.saturating_sub(elapsed))
            .unwrap_or(Duration::ZERO);
        let backoff = if attempt > 0 {
            self.backoff_delay(attempt - 1)
        } else {
            Duration::ZERO
        };
        rate_limit.max(backoff)
    }
}

/// Issues model requests for a task, remembering when the last one went out
pub(crate) struct RequestController {
    config: RetryConfig,
    last_request: Mutex<Option<Instant>>,
}

impl RequestController {
    pub(crate) fn new(config: RetryConfig) -> Self {
        Self {
            config,
            last_request: Mutex::new(None),
        }
    }

    /// Stream one assistant response.
    ///
    /// Items are model chunks; an `Err` item ends the stream. A failure after
    /// content has arrived surfaces as [`Error::StreamInterrupted`].
    pub(crate) fn attempt_request(
        self: Arc<Self>,
        ctx: Arc<TaskContext>,
        client: Arc<dyn ModelClient>,
        system_prompt: Arc<str>,
        history: Vec<Message>,
    ) -> impl Stream<Item = Result<ApiStreamChunk>> + Send + 'static {
        stream! {
            let cancel = ctx.cancel_token();
            let mut attempt = 0u32;

            loop {
                let since_last = self.last_request.lock().map(|t| t.elapsed());
                let delay = self.config.pre_request_delay(attempt, since_last);
                if let Err(e) = countdown(&ctx, delay, attempt > 0).await {
                    yield Err(e);
                    return;
                }
                *self.last_request.lock() = Some(Instant::now());

                let opened = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Aborted),
                    r = client.create_message(&system_prompt, &history) => r.map_err(Error::from),
                };
                let mut response = match opened {
                    Ok(s) => s,
                    Err(Error::Aborted) => {
                        yield Err(Error::Aborted);
                        return;
                    }
                    Err(Error::Ai(e)) => {
                        match self.on_first_chunk_failure(&ctx, &e).await {
                            Ok(Retry::NextAttempt) => {
                                attempt += 1;
                                continue;
                            }
                            Ok(Retry::SameAttempt) => continue,
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                let first = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = response.next() => Some(item),
                };
                let Some(first) = first else {
                    yield Err(Error::Aborted);
                    return;
                };
                match first {
                    None => return,
                    Some(Ok(chunk)) => {
                        yield Ok(chunk);
                    }
                    Some(Err(e)) => {
                        match self.on_first_chunk_failure(&ctx, &e).await {
                            Ok(Retry::NextAttempt) => {
                                attempt += 1;
                                continue;
                            }
                            Ok(Retry::SameAttempt) => continue,
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                }

                loop {
                    let item = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        item = response.next() => Some(item),
                    };
                    let Some(item) = item else {
                        yield Err(Error::Aborted);
                        return;
                    };
                    match item {
                        None => return,
                        Some(Ok(chunk)) => {
                            yield Ok(chunk);
                        }
                        Some(Err(e)) => {
                            tracing::warn!("Response stream failed mid-way: {}", e);
                            yield Err(Error::StreamInterrupted(e.to_string()));
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn on_first_chunk_failure(&self, ctx: &TaskContext, error: &vela_ai::Error) -> Result<Retry> {
        if self.config.auto_retry && error.is_retryable() {
            tracing::warn!("Request failed: {}. Retrying automatically", error);
            return Ok(Retry::NextAttempt);
        }

        tracing::warn!("Request failed: {}", error);
        let reply = ctx.ask(AskKind::ApiReqFailed, &error.to_string()).await?;
        if reply.is_yes() {
            ctx.say(SayKind::ApiReqRetried, "", Vec::new())?;
            Ok(Retry::SameAttempt)
        } else {
            Err(Error::RequestFailed(error.to_string()))
        }
    }
}

enum Retry {
    NextAttempt,
    SameAttempt,
}

/// Per-second countdown shown to the user; aborting cuts it short
async fn countdown(ctx: &TaskContext, delay: Duration, retrying: bool) -> Result<()> {
    if delay.is_zero() {
        return Ok(());
    }
    let cancel = ctx.cancel_token();
    let total = delay.as_secs_f64().ceil() as u64;
    tracing::debug!("Waiting {}s before request", total);

    for remaining in (1..=total).rev() {
        let text = if retrying {
            format!("Retrying in {} seconds...", remaining)
        } else {
            format!("Rate limiting for {} seconds...", remaining)
        };
        ctx.say_streaming(SayKind::ApiReqRetryDelayed, &text, true)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Aborted),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
    let done = if retrying { "Retrying now..." } else { "Sending request..." };
    ctx.say_streaming(SayKind::ApiReqRetryDelayed, done, false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TaskEvent;
    use crate::message::AskReply;
    use crate::store::{ConversationStore, TaskStore};
    use vela_ai::scripted::{ScriptedClient, ScriptedResponse};

    #[test]
    fn test_backoff_sequence() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(10));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(20));
        assert_eq!(config.backoff_delay(40), Duration::from_secs(600));
    }

    #[test]
    fn test_pre_request_delay() {
        let config = RetryConfig {
            rate_limit: Duration::from_secs(8),
            ..Default::default()
        };
        assert_eq!(config.pre_request_delay(0, None), Duration::ZERO);
        assert_eq!(config.pre_request_delay(0, Some(Duration::from_secs(3))), Duration::from_secs(5));
        assert_eq!(config.pre_request_delay(0, Some(Duration::from_secs(30))), Duration::ZERO);
        // retries wait out the larger of backoff and rate limit
        assert_eq!(config.pre_request_delay(1, Some(Duration::ZERO)), Duration::from_secs(8));
        assert_eq!(config.pre_request_delay(2, Some(Duration::ZERO)), Duration::from_secs(10));
        assert_eq!(config.pre_request_delay(3, None), Duration::from_secs(20));
    }

    fn context() -> (tempfile::TempDir, Arc<TaskContext>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(TaskStore::new(dir.path(), "r"));
        (dir, Arc::new(TaskContext::new(store, 3)))
    }

    async fn collect(
        ctx: Arc<TaskContext>,
        client: Arc<ScriptedClient>,
        config: RetryConfig,
    ) -> Vec<Result<ApiStreamChunk>> {
        let controller = Arc::new(RequestController::new(config));
        controller
            .attempt_request(ctx, client, Arc::from("sys"), vec![Message::user_text("hi")])
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_content() {
        let (_dir, ctx) = context();
        let client = Arc::new(ScriptedClient::new(vec![ScriptedResponse::FailAfter {
            chunks: vec!["Hello".into()],
            message: "connection reset".into(),
        }]));
        let items = collect(ctx, client, RetryConfig::default()).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok(ApiStreamChunk::Text { text }) if text == "Hello"));
        assert!(matches!(&items[1], Err(Error::StreamInterrupted(_))));
    }

    #[tokio::test]
    async fn test_declined_retry_is_fatal() {
        let (_dir, ctx) = context();
        let mut rx = ctx.subscribe();
        let client = Arc::new(ScriptedClient::new(vec![ScriptedResponse::fail("overloaded")]));

        let responder = Arc::clone(&ctx);
        let answer = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let TaskEvent::MessageAdded { message } = event {
                    if message.is_ask(AskKind::ApiReqFailed) {
                        responder.respond(message.ts, AskReply::no());
                        return;
                    }
                }
            }
        });

        let items = collect(Arc::clone(&ctx), Arc::clone(&client), RetryConfig::default()).await;
        answer.await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(Error::RequestFailed(_))));
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_approved_retry_reissues_request() {
        let (_dir, ctx) = context();
        let mut rx = ctx.subscribe();
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedResponse::fail("overloaded"),
            ScriptedResponse::text("ok"),
        ]));

        let responder = Arc::clone(&ctx);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let TaskEvent::MessageAdded { message } = event {
                    if message.is_ask(AskKind::ApiReqFailed) {
                        responder.respond(message.ts, AskReply::yes());
                    }
                }
            }
        });

        let items = collect(Arc::clone(&ctx), Arc::clone(&client), RetryConfig::default()).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Ok(ApiStreamChunk::Text { text }) if text == "ok"));
        assert_eq!(client.requests().len(), 2);
        assert!(ctx.ui_messages().iter().any(|m| m.is_say(SayKind::ApiReqRetried)));
    }

    #[tokio::test]
    async fn test_non_retryable_error_escalates_even_with_auto_retry() {
        let (_dir, ctx) = context();
        let mut rx = ctx.subscribe();
        let client = Arc::new(ScriptedClient::new(vec![ScriptedResponse::Fail {
            message: "bad key".into(),
            retryable: false,
        }]));
        let responder = Arc::clone(&ctx);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let TaskEvent::MessageAdded { message } = event {
                    if message.is_ask(AskKind::ApiReqFailed) {
                        responder.respond(message.ts, AskReply::no());
                    }
                }
            }
        });
        let config = RetryConfig {
            auto_retry: true,
            ..Default::default()
        };
        let items = collect(ctx, client, config).await;
        assert!(matches!(&items[0], Err(Error::RequestFailed(_))));
    }

    #[tokio::test]
    async fn test_abort_during_backoff() {
        let (_dir, ctx) = context();
        let client = Arc::new(ScriptedClient::new(vec![ScriptedResponse::fail("overloaded")]));
        let config = RetryConfig {
            auto_retry: true,
            ..Default::default()
        };

        let aborter = Arc::clone(&ctx);
        tokio::spawn(async move {
            // wait for the countdown to start
            loop {
                if aborter
                    .ui_messages()
                    .iter()
                    .any(|m| m.is_say(SayKind::ApiReqRetryDelayed))
                {
                    aborter.abort();
                    return;
                }
                tokio::task::yield_now().await;
            }
        });

        let items = collect(ctx, client, config).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(Error::Aborted)));
    }
}
