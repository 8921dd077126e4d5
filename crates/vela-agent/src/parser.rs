//! Streaming interpreter for assistant responses.
//!
//! The model writes tool calls as XML-ish tags:
//!
//! ```text
//! Let me look.
//! <read_file>
//! <path>src/main.rs</path>
//! </read_file>
//! ```
//!
//! The whole accumulated response is re-parsed on every chunk, so a tag split
//! across chunks first shows up as text and is corrected once the rest of it
//! arrives. Only registered tool and parameter names are recognised; anything
//! else is plain text.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// One parsed piece of an assistant response
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantBlock {
    Text {
        content: String,
        partial: bool,
    },
    ToolUse {
        name: String,
        params: BTreeMap<String, String>,
        partial: bool,
    },
}

impl AssistantBlock {
    pub fn is_partial(&self) -> bool {
        match self {
            AssistantBlock::Text { partial, .. } | AssistantBlock::ToolUse { partial, .. } => *partial,
        }
    }

    /// Mark the block final; used once the stream has ended
    pub fn finalize(&mut self) {
        match self {
            AssistantBlock::Text { partial, .. } | AssistantBlock::ToolUse { partial, .. } => *partial = false,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, AssistantBlock::ToolUse { .. })
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            AssistantBlock::ToolUse { name, .. } => Some(name),
            AssistantBlock::Text { .. } => None,
        }
    }
}

/// Param whose value is taken up to its *last* closing tag
const GREEDY_PARAM: &str = "content";

/// Tool and parameter names the interpreter recognises
#[derive(Debug, Clone, Default)]
pub struct ToolGrammar {
    tools: Vec<(String, String)>,
    params: Vec<(String, String)>,
}

impl ToolGrammar {
    pub fn new<T, P, S1, S2>(tool_names: T, param_names: P) -> Self
    where
        T: IntoIterator<Item = S1>,
        P: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        let tag = |name: String| (format!("<{}>", name), name);
        let mut params: Vec<_> = param_names.into_iter().map(|p| tag(p.into())).collect();
        params.sort();
        params.dedup();
        Self {
            tools: tool_names.into_iter().map(|t| tag(t.into())).collect(),
            params,
        }
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|(_, n)| n.as_str())
    }

    fn opened_tool(&self, acc: &str) -> Option<(&str, usize)> {
        self.tools
            .iter()
            .find(|(tag, _)| acc.ends_with(tag.as_str()))
            .map(|(tag, name)| (name.as_str(), tag.len()))
    }

    fn opened_param(&self, acc: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(tag, _)| acc.ends_with(tag.as_str()))
            .map(|(_, name)| name.as_str())
    }

    fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(_, n)| n == name)
    }
}

struct OpenTool {
    name: String,
    params: BTreeMap<String, String>,
    body_start: usize,
}

/// Parse the full accumulated response into blocks.
///
/// At most the last block is partial: an unterminated tool (with whatever
/// parameter values have arrived so far) or trailing text.
pub fn parse_assistant_message(text: &str, grammar: &ToolGrammar) -> Vec<AssistantBlock> {
    let mut blocks = Vec::new();
    let mut text_start: Option<usize> = None;
    let mut tool: Option<OpenTool> = None;
    let mut param: Option<(String, usize)> = None;

    for (i, ch) in text.char_indices() {
        let end = i + ch.len_utf8();
        let acc = &text[..end];

        if let Some(open) = tool.as_mut() {
            if let Some((name, value_start)) = &param {
                let close = format!("</{}>", name);
                if acc.ends_with(&close) {
                    let value = text[*value_start..end - close.len()].trim().to_string();
                    open.params.insert(name.clone(), value);
                    param = None;
                }
                continue;
            }

            if let Some(name) = grammar.opened_param(acc) {
                param = Some((name.to_string(), end));
                continue;
            }

            let close = format!("</{}>", open.name);
            if acc.ends_with(&close) {
                let body = &text[open.body_start..end - close.len()];
                if grammar.has_param(GREEDY_PARAM) {
                    if let Some(content) = greedy_param(body, GREEDY_PARAM) {
                        open.params.insert(GREEDY_PARAM.to_string(), content);
                    }
                }
                if let Some(done) = tool.take() {
                    blocks.push(AssistantBlock::ToolUse {
                        name: done.name,
                        params: done.params,
                        partial: false,
                    });
                }
            }
            continue;
        }

        if let Some((name, tag_len)) = grammar.opened_tool(acc) {
            if let Some(start) = text_start.take() {
                let content = text[start..end - tag_len].trim();
                if !content.is_empty() {
                    blocks.push(AssistantBlock::Text {
                        content: content.to_string(),
                        partial: false,
                    });
                }
            }
            tool = Some(OpenTool {
                name: name.to_string(),
                params: BTreeMap::new(),
                body_start: end,
            });
            continue;
        }

        if text_start.is_none() {
            text_start = Some(i);
        }
    }

    if let Some(mut open) = tool {
        if let Some((name, value_start)) = param {
            open.params.insert(name, text[value_start..].trim().to_string());
        }
        blocks.push(AssistantBlock::ToolUse {
            name: open.name,
            params: open.params,
            partial: true,
        });
    } else if let Some(start) = text_start {
        let content = text[start..].trim();
        if !content.is_empty() {
            blocks.push(AssistantBlock::Text {
                content: content.to_string(),
                partial: true,
            });
        }
    }

    blocks
}

/// Value between the first opening and the last closing tag of `name`
fn greedy_param(body: &str, name: &str) -> Option<String> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = body.find(&open)? + open.len();
    let end = body.rfind(&close)?;
    (end > start).then(|| body[start..end].trim().to_string())
}

/// Strip a half-written closing tag (`</pa`, `<`) from the end of a
/// streaming value. Final values are returned unchanged.
pub fn remove_closing_tag(tag: &str, text: &str, partial: bool) -> String {
    if !partial || text.is_empty() {
        return text.to_string();
    }
    let optional_chars: String = tag
        .chars()
        .map(|c| format!("(?:{})?", regex::escape(&c.to_string())))
        .collect();
    match Regex::new(&format!(r"\s?</?{}$", optional_chars)) {
        Ok(re) => re.replace(text, "").to_string(),
        Err(_) => text.to_string(),
    }
}

static THINKING_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<thinking>\s?").expect("valid regex"));
static THINKING_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s?</thinking>").expect("valid regex"));
static TAG_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z_]+$").expect("valid regex"));

/// Prepare a text block for display: drop `<thinking>` tags and, while
/// streaming, a tag that has only started to arrive.
pub fn display_text(content: &str, partial: bool) -> String {
    let mut content = THINKING_OPEN.replace_all(content, "").to_string();
    content = THINKING_CLOSE.replace_all(&content, "").to_string();

    if partial {
        if let Some(idx) = content.rfind('<') {
            let possible_tag = &content[idx..];
            if !possible_tag.contains('>') {
                let name = possible_tag
                    .strip_prefix("</")
                    .or_else(|| possible_tag.strip_prefix('<'))
                    .unwrap_or(possible_tag)
                    .trim();
                if name.is_empty() || TAG_NAME.is_match(name) {
                    content = content[..idx].trim().to_string();
                }
            }
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grammar() -> ToolGrammar {
        ToolGrammar::new(
            ["read_file", "write_to_file", "attempt_completion"],
            ["path", "content", "result"],
        )
    }

    fn tool(name: &str, params: &[(&str, &str)], partial: bool) -> AssistantBlock {
        AssistantBlock::ToolUse {
            name: name.to_string(),
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            partial,
        }
    }

    fn text(content: &str, partial: bool) -> AssistantBlock {
        AssistantBlock::Text {
            content: content.to_string(),
            partial,
        }
    }

    #[test]
    fn test_plain_text_is_partial() {
        let blocks = parse_assistant_message("  Hello there ", &grammar());
        assert_eq!(blocks, vec![text("Hello there", true)]);
    }

    #[test]
    fn test_text_then_tool() {
        let msg = "Let me look.\n<read_file>\n<path>src/main.rs</path>\n</read_file>";
        let blocks = parse_assistant_message(msg, &grammar());
        assert_eq!(
            blocks,
            vec![
                text("Let me look.", false),
                tool("read_file", &[("path", "src/main.rs")], false),
            ]
        );
    }

    #[test]
    fn test_unterminated_param_is_partial() {
        let msg = "<write_to_file><path>a.txt</path><content>hello wor";
        let blocks = parse_assistant_message(msg, &grammar());
        assert_eq!(
            blocks,
            vec![tool("write_to_file", &[("path", "a.txt"), ("content", "hello wor")], true)]
        );
    }

    #[test]
    fn test_split_tag_corrects_itself() {
        let g = grammar();
        let first = parse_assistant_message("<write_to_fi", &g);
        assert_eq!(first, vec![text("<write_to_fi", true)]);

        let second = parse_assistant_message("<write_to_file><path>a.txt</path>", &g);
        assert_eq!(second, vec![tool("write_to_file", &[("path", "a.txt")], true)]);
    }

    #[test]
    fn test_unknown_tags_are_text() {
        let msg = "<delete_everything><path>/</path></delete_everything>";
        let blocks = parse_assistant_message(msg, &grammar());
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], AssistantBlock::Text { content, .. } if content == msg));
    }

    #[test]
    fn test_content_is_greedy() {
        let msg = "<write_to_file><path>x.xml</path><content><a></content></a></content></write_to_file>";
        let blocks = parse_assistant_message(msg, &grammar());
        assert_eq!(
            blocks,
            vec![tool(
                "write_to_file",
                &[("path", "x.xml"), ("content", "<a></content></a>")],
                false
            )]
        );
    }

    #[test]
    fn test_text_after_tool() {
        let msg = "<read_file><path>a</path></read_file>\nthen more";
        let blocks = parse_assistant_message(msg, &grammar());
        assert_eq!(blocks[1], text("then more", true));
    }

    #[test]
    fn test_two_tools() {
        let msg = "<read_file><path>a</path></read_file><read_file><path>b</path></read_file>";
        let blocks = parse_assistant_message(msg, &grammar());
        assert_eq!(
            blocks,
            vec![
                tool("read_file", &[("path", "a")], false),
                tool("read_file", &[("path", "b")], false),
            ]
        );
    }

    #[test]
    fn test_multibyte_text() {
        let msg = "héllo → <read_file><path>ü.txt</path></read_file>";
        let blocks = parse_assistant_message(msg, &grammar());
        assert_eq!(blocks[0], text("héllo →", false));
        assert_eq!(blocks[1], tool("read_file", &[("path", "ü.txt")], false));
    }

    #[test]
    fn test_remove_closing_tag() {
        assert_eq!(remove_closing_tag("path", "src/lib.rs</pa", true), "src/lib.rs");
        assert_eq!(remove_closing_tag("path", "src/lib.rs <", true), "src/lib.rs");
        assert_eq!(remove_closing_tag("path", "src/lib.rs</pa", false), "src/lib.rs</pa");
        assert_eq!(remove_closing_tag("path", "src/lib.rs", true), "src/lib.rs");
    }

    #[test]
    fn test_display_text() {
        assert_eq!(display_text("<thinking>\nhmm\n</thinking>", false), "hmm");
        assert_eq!(display_text("Sure, let me <read_fi", true), "Sure, let me");
        assert_eq!(display_text("x < 2", true), "x < 2");
        assert_eq!(display_text("Sure <", true), "Sure");
    }
}
