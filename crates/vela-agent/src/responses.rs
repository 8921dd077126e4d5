//! Standard texts fed back to the model

/// Result text for an interrupted or never-answered tool call
pub const TOOL_INTERRUPTED: &str = "Tool execution was interrupted before completion.";

/// Appended to an assistant turn cut short by an abort
pub const INTERRUPTED_BY_USER: &str = "[Response interrupted by user]";

/// Appended to an assistant turn cut short by a stream failure
pub const INTERRUPTED_BY_API_ERROR: &str = "[Response interrupted by API Error]";

/// Persisted in place of an empty assistant response
pub const EMPTY_RESPONSE: &str = "Failure: I did not provide a response.";

pub const TOOL_DENIED: &str = "The user denied this operation.";

pub fn tool_already_used(tool: &str) -> String {
    format!(
        "Tool [{}] was not executed because a tool has already been used in this message. \
         Only one tool may be used per message. You must assess the first tool's result \
         before proceeding to use the next tool.",
        tool
    )
}

pub fn tool_skipped_after_rejection(tool: &str) -> String {
    format!("Skipping tool [{}] due to user rejecting a previous tool.", tool)
}

pub fn tool_denied_with_feedback(feedback: &str) -> String {
    format!(
        "The user denied this operation and provided the following feedback:\n<feedback>\n{}\n</feedback>",
        feedback
    )
}

pub fn tool_error(error: &str) -> String {
    format!(
        "The tool execution failed with the following error:\n<error>\n{}\n</error>",
        error
    )
}

pub fn missing_param(param: &str) -> String {
    format!(
        "Missing value for required parameter '{}'. Please retry with complete response.",
        param
    )
}

pub fn invalid_params(details: &str) -> String {
    format!("Invalid parameters. Please retry with complete response.\n{}", details)
}

pub fn tool_not_allowed(tool: &str, mode: &str) -> String {
    format!("Tool '{}' is not allowed in {} mode.", tool, mode)
}

pub fn unknown_tool(tool: &str) -> String {
    format!("Tool '{}' does not exist. Use one of the available tools.", tool)
}

pub fn no_tools_used() -> String {
    "[ERROR] You did not use a tool in your previous response! Please retry with a tool use.\n\n\
     # Next Steps\n\n\
     If you have completed the user's task, use the attempt_completion tool.\n\
     If you require additional information from the user, use the ask_followup_question tool.\n\
     Otherwise, if you have not completed the task and do not need additional information, \
     then proceed with the next step of the task.\n\
     (This is an automated message, so do not respond to it conversationally.)"
        .to_string()
}

pub fn too_many_mistakes(feedback: &str) -> String {
    format!(
        "You seem to be having trouble proceeding. The user has provided the following feedback \
         to help guide you:\n<feedback>\n{}\n</feedback>",
        feedback
    )
}

pub fn completion_feedback(feedback: &str) -> String {
    format!(
        "The user has provided feedback on the results. Consider their input to continue the \
         task, and then attempt completion again.\n<feedback>\n{}\n</feedback>",
        feedback
    )
}

pub fn followup_answer(answer: &str) -> String {
    format!("<answer>\n{}\n</answer>", answer)
}

pub fn task_prompt(task: &str) -> String {
    format!("<task>\n{}\n</task>", task)
}

/// Prompt that opens a resumed task.
///
/// `ago` is a human-readable description of how long the task sat idle.
pub fn task_resumption(ago: &str, cwd: &str, completed: bool, feedback: Option<&str>) -> String {
    let mut text = format!(
        "[TASK RESUMPTION] This task was interrupted {}. It may or may not be complete, so \
         please reassess the task context. Be aware that the project state may have changed \
         since then. The current working directory is now '{}'. If the task has not been \
         completed, retry the last step before interruption and proceed with completing the task.",
        ago, cwd
    );
    if completed {
        text.push_str(
            "\n\nNote: The task had already been completed. The user may want further changes \
             or a follow-up task.",
        );
    }
    if let Some(feedback) = feedback {
        text.push_str(&format!(
            "\n\nNew instructions for task continuation:\n<user_message>\n{}\n</user_message>",
            feedback
        ));
    }
    text
}

/// "just now", "5 minutes ago", "3 hours ago", "2 days ago"
pub fn format_ago(elapsed_ms: i64) -> String {
    let minutes = elapsed_ms.max(0) / 60_000;
    let hours = minutes / 60;
    let days = hours / 24;
    let plural = |n: i64, unit: &str| {
        if n == 1 {
            format!("1 {} ago", unit)
        } else {
            format!("{} {}s ago", n, unit)
        }
    };
    if days > 0 {
        plural(days, "day")
    } else if hours > 0 {
        plural(hours, "hour")
    } else if minutes > 0 {
        plural(minutes, "minute")
    } else {
        "just now".to_string()
    }
}
