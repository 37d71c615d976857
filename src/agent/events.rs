//! The agent's stream-json output, one event per line.
//!
//! Events are loosely typed: the same information shows up under different
//! keys depending on the event kind and the agent version. Each line is
//! classified once into an [`AgentEvent`] with the extraction order fixed
//! here, so the orchestrator never inspects raw JSON itself.

use serde_json::{json, Map, Value};

const TYPE_KEYS: [&str; 2] = ["type", "event"];
const SESSION_ID_KEYS: [&str; 2] = ["session_id", "session"];
const DELTA_TEXT_KEYS: [&str; 3] = ["text", "text_delta", "value"];
const TOOL_NAME_KEYS: [&str; 3] = ["name", "tool_name", "tool"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// `system` or `session`: may announce the session id.
    Session,
    /// `result`, `final` or `message_stop`: its text is the final answer.
    Terminal,
    Other(String),
    Untyped,
}

impl EventKind {
    fn classify(label: Option<&str>) -> Self {
        match label {
            Some("system" | "session") => Self::Session,
            Some("result" | "final" | "message_stop") => Self::Terminal,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Untyped,
        }
    }
}

/// Where an event's text was found, in extraction priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSource {
    Direct,
    Delta,
    Content,
    Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPayload {
    pub source: TextSource,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub kind: EventKind,
    pub session_id: Option<String>,
    pub text: Option<TextPayload>,
    /// Unique by name within the event.
    pub tools: Vec<ToolInvocation>,
    pub raw: Value,
}

/// One line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Blank,
    Event(AgentEvent),
    /// Not a JSON object. Kept only as a last-resort answer.
    Unparsed(String),
}

pub fn parse_line(line: &str) -> Line {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Line::Blank;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(obj)) => Line::Event(AgentEvent::from_object(obj)),
        _ => Line::Unparsed(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

/// Concatenated `{"type":"text"}` blocks, or `None` when there are none.
fn text_blocks(content: Option<&Value>) -> Option<String> {
    let blocks = content?.as_array()?;
    let parts: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.concat())
    }
}

fn extract_text(obj: &Map<String, Value>) -> Option<TextPayload> {
    if let Some(text) = obj.get("text").and_then(Value::as_str) {
        return Some(TextPayload {
            source: TextSource::Direct,
            text: text.to_string(),
        });
    }
    if let Some(text) = obj
        .get("delta")
        .and_then(Value::as_object)
        .and_then(|delta| first_str(delta, &DELTA_TEXT_KEYS))
    {
        return Some(TextPayload {
            source: TextSource::Delta,
            text: text.to_string(),
        });
    }
    if let Some(text) = text_blocks(obj.get("content")) {
        return Some(TextPayload {
            source: TextSource::Content,
            text,
        });
    }
    let message = obj.get("message").and_then(Value::as_object)?;
    text_blocks(message.get("content")).map(|text| TextPayload {
        source: TextSource::Message,
        text,
    })
}

fn tool_from_block(block: &Value) -> Option<ToolInvocation> {
    let block = block.as_object()?;
    let name = TOOL_NAME_KEYS
        .iter()
        .filter_map(|k| block.get(*k).and_then(Value::as_str))
        .find(|name| !name.is_empty())?;
    Some(ToolInvocation {
        name: name.to_string(),
        input: block.get("input").cloned().unwrap_or_else(|| json!({})),
    })
}

fn tool_use_blocks(content: Option<&Value>) -> impl Iterator<Item = &Value> {
    content
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
}

fn extract_tools(obj: &Map<String, Value>) -> Vec<ToolInvocation> {
    let message_blocks = tool_use_blocks(obj.get("message").and_then(|m| m.get("content")));
    // The direct `tool_use` field carries no type tag of its own.
    let direct: Vec<&Value> = match obj.get("tool_use") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    };
    let top_blocks = tool_use_blocks(obj.get("content"));

    let mut tools: Vec<ToolInvocation> = Vec::new();
    for tool in message_blocks
        .chain(direct)
        .chain(top_blocks)
        .filter_map(tool_from_block)
    {
        if !tools.iter().any(|t| t.name == tool.name) {
            tools.push(tool);
        }
    }
    tools
}

impl AgentEvent {
    pub fn from_object(obj: Map<String, Value>) -> Self {
        let kind = EventKind::classify(first_str(&obj, &TYPE_KEYS));
        let session_id = match kind {
            EventKind::Session => SESSION_ID_KEYS
                .iter()
                .filter_map(|k| obj.get(*k).and_then(Value::as_str))
                .find(|s| !s.is_empty())
                .map(str::to_string),
            _ => None,
        };
        let text = extract_text(&obj);
        let tools = extract_tools(&obj);
        Self {
            kind,
            session_id,
            text,
            tools,
            raw: Value::Object(obj),
        }
    }

    /// The event's text when it is non-empty.
    pub fn text(&self) -> Option<&str> {
        self.text
            .as_ref()
            .map(|t| t.text.as_str())
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: &str) -> AgentEvent {
        match parse_line(line) {
            Line::Event(evt) => evt,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn blank_and_garbage_lines() {
        assert_eq!(parse_line("   \n"), Line::Blank);
        assert_eq!(
            parse_line("Error: not logged in\n"),
            Line::Unparsed("Error: not logged in".into())
        );
        assert_eq!(parse_line("[1,2]"), Line::Unparsed("[1,2]".into()));
    }

    #[test]
    fn type_falls_back_to_event_key() {
        assert_eq!(event(r#"{"event":"final"}"#).kind, EventKind::Terminal);
        assert_eq!(
            event(r#"{"type":"assistant","event":"final"}"#).kind,
            EventKind::Other("assistant".into())
        );
        assert_eq!(event(r#"{"type":7,"event":"session"}"#).kind, EventKind::Session);
        assert_eq!(event(r#"{"foo":1}"#).kind, EventKind::Untyped);
    }

    #[test]
    fn session_id_only_from_session_events() {
        let init = event(r#"{"type":"system","subtype":"init","session_id":"abc"}"#);
        assert_eq!(init.session_id.as_deref(), Some("abc"));
        let alias = event(r#"{"type":"session","session":"def"}"#);
        assert_eq!(alias.session_id.as_deref(), Some("def"));
        let result = event(r#"{"type":"result","session_id":"zzz","result":"done"}"#);
        assert_eq!(result.session_id, None);
    }

    #[test]
    fn text_priority_order() {
        let direct = event(
            r#"{"text":"a","delta":{"text":"b"},"content":[{"type":"text","text":"c"}]}"#,
        );
        assert_eq!(direct.text.unwrap().source, TextSource::Direct);

        let delta = event(r#"{"delta":{"value":"v","text_delta":"td"}}"#);
        let payload = delta.text.unwrap();
        assert_eq!(payload.source, TextSource::Delta);
        assert_eq!(payload.text, "td");

        let content = event(
            r#"{"content":[{"type":"text","text":"x"},{"type":"image"},{"type":"text","text":"y"}],
               "message":{"content":[{"type":"text","text":"m"}]}}"#,
        );
        assert_eq!(content.text.as_ref().unwrap().source, TextSource::Content);
        assert_eq!(content.text(), Some("xy"));

        let message = event(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi "},{"type":"text","text":"there"}]}}"#,
        );
        assert_eq!(message.text.as_ref().unwrap().source, TextSource::Message);
        assert_eq!(message.text(), Some("hi there"));
    }

    #[test]
    fn content_without_text_blocks_falls_through_to_message() {
        let evt = event(
            r#"{"content":[{"type":"tool_use","name":"Read"}],"message":{"content":[{"type":"text","text":"ok"}]}}"#,
        );
        assert_eq!(evt.text(), Some("ok"));
    }

    #[test]
    fn tools_are_deduplicated_by_name() {
        let evt = event(
            r#"{"type":"assistant","message":{"content":[
                {"type":"tool_use","name":"Bash","input":{"command":"ls"}},
                {"type":"tool_use","name":"Bash","input":{"command":"pwd"}},
                {"type":"text","text":"checking"}
            ]},
            "tool_use":{"tool_name":"WebSearch","input":{"query":"rust"}},
            "content":[{"type":"tool_use","tool":"Bash"},{"type":"tool_use","name":"Read"}]}"#,
        );
        let names: Vec<&str> = evt.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Bash", "WebSearch", "Read"]);
        assert_eq!(evt.tools[0].input, json!({"command": "ls"}));
        assert_eq!(evt.tools[2].input, json!({}));
    }

    #[test]
    fn direct_tool_use_list_needs_no_type_tag() {
        let evt = event(r#"{"tool_use":[{"name":"Edit"},{"name":"Write"},{"input":{}}]}"#);
        let names: Vec<&str> = evt.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Edit", "Write"]);
    }

    #[test]
    fn untagged_blocks_in_content_are_not_tools() {
        let evt = event(r#"{"content":[{"name":"Bash"}]}"#);
        assert!(evt.tools.is_empty());
    }
}
