//! Parsing of model responses into agent actions.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

/// What a model response asks the runtime to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ToolCall {
        name: String,
        arguments: Map<String, Value>,
    },
    CodeExec {
        code: String,
    },
    Final {
        payload: String,
    },
    Unrecognized {
        reason: String,
    },
}

impl Action {
    /// Short label used in events and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Action::ToolCall { .. } => "tool_call",
            Action::CodeExec { .. } => "code_exec",
            Action::Final { .. } => "final",
            Action::Unrecognized { .. } => "unrecognized",
        }
    }
}

#[derive(Clone, Copy)]
enum Marker {
    Execute,
    Final,
    Report,
    ToolCall,
}

static THINK_BLOCK: Lazy<Regex> = Lazy::new(|| build(r"(?s)<think(?:ing)?>.*?</think(?:ing)?>"));

static MARKERS: Lazy<Vec<(Marker, Regex)>> = Lazy::new(|| {
    vec![
        (Marker::Execute, build(r"(?s)<execute>(.*?)</execute>")),
        (Marker::Final, build(r"(?s)<final_result>(.*?)</final_result>")),
        (Marker::Report, build(r"(?s)<report>(.*?)</report>")),
        (Marker::ToolCall, build(r"(?s)<tool_call>(.*?)</tool_call>")),
    ]
});

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| build(r"(?s)^```[A-Za-z0-9_+-]*\s*\n?(.*?)\n?```$"));

fn build(pattern: &str) -> Regex {
    Regex::new(pattern).expect("invalid action marker regex")
}

#[derive(Deserialize)]
struct ToolCallBody {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// Parse a raw model response.
///
/// Reasoning blocks are ignored. When a response carries several markers the
/// one that starts last wins.
pub fn parse_action(text: &str) -> Action {
    let visible = THINK_BLOCK.replace_all(text, "");

    let latest = MARKERS
        .iter()
        .filter_map(|(marker, regex)| {
            regex
                .captures_iter(&visible)
                .last()
                .and_then(|caps| {
                    let whole = caps.get(0)?;
                    let inner = caps.get(1)?;
                    Some((whole.start(), *marker, inner.as_str().trim().to_string()))
                })
        })
        .max_by_key(|(start, _, _)| *start);

    let Some((_, marker, body)) = latest else {
        return Action::Unrecognized {
            reason: "response contained no <execute>, <tool_call>, <final_result> or <report> block"
                .to_string(),
        };
    };

    match marker {
        Marker::Execute => {
            let code = strip_code_fence(&body);
            if code.is_empty() {
                Action::Unrecognized {
                    reason: "<execute> block was empty".to_string(),
                }
            } else {
                Action::CodeExec { code }
            }
        }
        Marker::Final | Marker::Report => Action::Final { payload: body },
        Marker::ToolCall => parse_tool_call(&strip_code_fence(&body)),
    }
}

fn parse_tool_call(body: &str) -> Action {
    let call: ToolCallBody = match serde_json::from_str(body) {
        Ok(call) => call,
        Err(err) => {
            return Action::Unrecognized {
                reason: format!("<tool_call> body is not valid JSON: {err}"),
            };
        }
    };

    if call.name.trim().is_empty() {
        return Action::Unrecognized {
            reason: "<tool_call> is missing a capability name".to_string(),
        };
    }

    match call.arguments {
        None | Some(Value::Null) => Action::ToolCall {
            name: call.name,
            arguments: Map::new(),
        },
        Some(Value::Object(arguments)) => Action::ToolCall {
            name: call.name,
            arguments,
        },
        Some(other) => Action::Unrecognized {
            reason: format!("<tool_call> arguments must be an object, got {other}"),
        },
    }
}

fn strip_code_fence(body: &str) -> String {
    match CODE_FENCE.captures(body) {
        Some(caps) => caps
            .get(1)
            .map(|inner| inner.as_str().trim().to_string())
            .unwrap_or_default(),
        None => body.trim().to_string(),
    }
}
