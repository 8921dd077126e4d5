//! Terminal host: prints the UI log as it grows and answers asks from stdin.

use std::collections::HashSet;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use vela_agent::message::{ApiRequestInfo, UiKind};
use vela_agent::{AskKind, AskReply, SayKind, TaskEvent, TaskExit, TaskHandle, UiMessage};

use crate::utils::truncate_chars;

/// Start hosting `handle`. Subscribes before returning so no message is missed.
pub fn spawn(handle: TaskHandle) -> JoinHandle<()> {
    let rx = handle.subscribe();
    tokio::spawn(run(handle, rx))
}

async fn run(handle: TaskHandle, mut rx: broadcast::Receiver<TaskEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed: HashSet<i64> = HashSet::new();

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("Host fell behind by {} events", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            TaskEvent::TaskFinished { exit, .. } => {
                match exit {
                    TaskExit::Completed => println!("\n[task completed]"),
                    TaskExit::Aborted => println!("\n[task aborted]"),
                }
                break;
            }
            TaskEvent::Error { message } => {
                eprintln!("\nError: {}", message);
                break;
            }
            _ => {}
        }

        let Some(message) = event.message() else { continue };
        if message.partial {
            continue;
        }
        if message.is_say(SayKind::ApiReqStarted) {
            let info = ApiRequestInfo::from_text(&message.text);
            if let Some(cost) = info.cost {
                if printed.insert(message.ts) {
                    println!(
                        "[tokens: {} in, {} out | cost: ${:.4}]",
                        info.tokens_in, info.tokens_out, cost
                    );
                }
            }
            continue;
        }
        if !printed.insert(message.ts) {
            continue;
        }

        let Some(kind) = message.ask_kind() else {
            render_say(message);
            continue;
        };
        prompt(kind, &message.text);

        let reply = tokio::select! {
            _ = handle.aborted() => continue,
            line = lines.next_line() => match line {
                Ok(Some(line)) => parse_reply(kind, &line),
                Ok(None) | Err(_) => {
                    tracing::debug!("stdin closed; aborting task");
                    handle.abort();
                    continue;
                }
            },
        };
        if !handle.respond(message.ts, reply) {
            println!("(that question is no longer pending)");
        }
    }
}

fn render_say(message: &UiMessage) {
    let text = message.text.as_str();
    match message.kind {
        UiKind::Say { say } => match say {
            SayKind::Task => println!("Task: {}", text),
            SayKind::Text => println!("{}", text),
            SayKind::Reasoning => println!("[thinking] {}", truncate_chars(text, 300)),
            SayKind::Error => eprintln!("Error: {}", text),
            SayKind::ApiReqStarted => {}
            SayKind::ApiReqRetried => println!("[retrying request]"),
            SayKind::ApiReqRetryDelayed => println!("[{}]", text),
            SayKind::CompletionResult => println!("\nResult:\n{}", text),
            SayKind::UserFeedback => println!("> {}", text),
            SayKind::Tool => println!("[auto-approved] {}", text),
            SayKind::ToolOutput => println!("{}", truncate_chars(text, 2000)),
        },
        UiKind::Ask { .. } => {}
    }
}

fn prompt(kind: AskKind, text: &str) {
    match kind {
        AskKind::Followup => print!("\n? {}\nanswer> ", text),
        AskKind::Command => print!("\nRun command: {}\nApprove? [y/N or feedback] ", text),
        AskKind::Tool => print!("\n{}\nApprove? [y/N or feedback] ", text),
        AskKind::CompletionResult => print!("Accept this result? [Y or feedback] "),
        AskKind::ApiReqFailed => print!("\nRequest failed: {}\nRetry? [y/N] ", text),
        AskKind::ResumeTask => print!("Resume this task? [Y or new instructions] "),
        AskKind::ResumeCompletedTask => {
            print!("This task was completed. Continue it? [Y or new instructions] ")
        }
        AskKind::MistakeLimitReached => print!("\n{}\nGuidance (empty to let it retry): ", text),
    }
    let _ = std::io::stdout().flush();
}

/// Turn a typed line into an answer for an ask of `kind`
fn parse_reply(kind: AskKind, line: &str) -> AskReply {
    let line = line.trim();
    let yes = matches!(line.to_ascii_lowercase().as_str(), "y" | "yes");
    let no = matches!(line.to_ascii_lowercase().as_str(), "" | "n" | "no");

    match kind {
        AskKind::Followup => AskReply::message(line),
        AskKind::Command | AskKind::Tool => {
            if yes {
                AskReply::yes()
            } else if no {
                AskReply::no()
            } else {
                AskReply::message(line)
            }
        }
        AskKind::ApiReqFailed => {
            if yes {
                AskReply::yes()
            } else {
                AskReply::no()
            }
        }
        AskKind::CompletionResult
        | AskKind::ResumeTask
        | AskKind::ResumeCompletedTask
        | AskKind::MistakeLimitReached => {
            if yes || line.is_empty() {
                AskReply::yes()
            } else {
                AskReply::message(line)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_replies() {
        assert!(parse_reply(AskKind::Tool, "y").is_yes());
        assert!(parse_reply(AskKind::Command, " YES ").is_yes());
        assert!(!parse_reply(AskKind::Tool, "").is_yes());
        let feedback = parse_reply(AskKind::Tool, "use tabs instead");
        assert_eq!(feedback.feedback(), Some("use tabs instead"));
    }

    #[test]
    fn test_empty_line_accepts_completion() {
        assert!(parse_reply(AskKind::CompletionResult, "").is_yes());
        assert_eq!(
            parse_reply(AskKind::ResumeTask, "also add tests").feedback(),
            Some("also add tests")
        );
    }

    #[test]
    fn test_request_failure_only_retries_on_yes() {
        assert!(parse_reply(AskKind::ApiReqFailed, "yes").is_yes());
        assert!(!parse_reply(AskKind::ApiReqFailed, "whatever").is_yes());
    }
}
