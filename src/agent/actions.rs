//! The closed set of actions the LLM may request.
//!
//! Tool calls arrive as `{name, arguments}`; parsing happens here, at the
//! boundary, so an unknown name or a malformed argument bag is an explicit
//! error variant instead of a silent fallthrough deeper in the loop.

use serde_json::{json, Value};
use thiserror::Error;

use crate::llm::{FunctionDefinition, ToolDefinition};

/// Scroll direction for the `scroll` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
}

/// One validated action requested by the LLM.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    /// Lay out (or extend) the current goal's subgoal list.
    Branch { subgoals: Vec<String> },
    /// Drop the last subgoal.
    Prune,
    /// Mark the current subgoal done and advance.
    CompleteSubgoal,
    /// Record a free-form note on the current goal.
    Note { message: String },
    /// Pause the loop and hand control to the human observer.
    ManualIntervention { reason: String, suggestion: String },
    /// Finish the task with a final answer.
    Stop { answer: String },
    /// Click a numbered element or a raw selector.
    Click {
        element_id: Option<u32>,
        selector: Option<String>,
    },
    /// Type into a numbered element or a raw selector.
    TypeText {
        element_id: Option<u32>,
        selector: Option<String>,
        text: String,
    },
    /// Navigate to a URL.
    Goto { url: String },
    /// Go back one history entry.
    GoBack,
    /// Press Enter in the focused element.
    Enter,
    /// Scroll the page.
    Scroll {
        direction: ScrollDirection,
        amount: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionParseError {
    #[error("unknown action: {name}")]
    UnknownAction { name: String },

    #[error("invalid arguments for {action}: {reason}")]
    InvalidArguments { action: String, reason: String },
}

fn invalid(action: &str, reason: impl Into<String>) -> ActionParseError {
    ActionParseError::InvalidArguments {
        action: action.to_string(),
        reason: reason.into(),
    }
}

fn required_str(action: &str, args: &Value, key: &str) -> Result<String, ActionParseError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| invalid(action, format!("missing '{}'", key)))
}

/// Accept both a JSON number and a numeric string for element ids; models
/// are inconsistent about which one they emit.
fn optional_element_id(args: &Value) -> Option<u32> {
    match args.get("element_id") {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as u32),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn optional_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
}

impl AgentAction {
    /// Validate a raw tool call into a typed action.
    pub fn parse(name: &str, args: &Value) -> Result<Self, ActionParseError> {
        match name {
            "branch" => {
                let subgoals = args
                    .get("subgoals")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| invalid(name, "missing 'subgoals' array"))?
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>();
                if subgoals.is_empty() {
                    return Err(invalid(name, "'subgoals' must contain at least one string"));
                }
                Ok(AgentAction::Branch { subgoals })
            }
            "prune" => Ok(AgentAction::Prune),
            "complete_subgoal" => Ok(AgentAction::CompleteSubgoal),
            "note" => Ok(AgentAction::Note {
                message: required_str(name, args, "message")?,
            }),
            "manual_intervention" => Ok(AgentAction::ManualIntervention {
                reason: required_str(name, args, "reason")?,
                suggestion: optional_str(args, "suggestion").unwrap_or_default(),
            }),
            "stop" => Ok(AgentAction::Stop {
                answer: required_str(name, args, "answer")?,
            }),
            "click" => {
                let element_id = optional_element_id(args);
                let selector = optional_str(args, "selector");
                if element_id.is_none() && selector.is_none() {
                    return Err(invalid(name, "needs 'element_id' or 'selector'"));
                }
                Ok(AgentAction::Click {
                    element_id,
                    selector,
                })
            }
            "type" => {
                let element_id = optional_element_id(args);
                let selector = optional_str(args, "selector");
                if element_id.is_none() && selector.is_none() {
                    return Err(invalid(name, "needs 'element_id' or 'selector'"));
                }
                Ok(AgentAction::TypeText {
                    element_id,
                    selector,
                    text: required_str(name, args, "text")?,
                })
            }
            "goto" => Ok(AgentAction::Goto {
                url: required_str(name, args, "url")?,
            }),
            "go_back" => Ok(AgentAction::GoBack),
            "enter" => Ok(AgentAction::Enter),
            "scroll" => {
                let direction = match args.get("direction").and_then(|v| v.as_str()) {
                    Some("up") => ScrollDirection::Up,
                    Some("down") | None => ScrollDirection::Down,
                    Some(other) => {
                        return Err(invalid(name, format!("unknown direction '{}'", other)))
                    }
                };
                Ok(AgentAction::Scroll {
                    direction,
                    amount: args.get("amount").and_then(|v| v.as_f64()),
                })
            }
            other => Err(ActionParseError::UnknownAction {
                name: other.to_string(),
            }),
        }
    }

    /// The wire name of this action, used in logs and error events.
    pub fn name(&self) -> &'static str {
        match self {
            AgentAction::Branch { .. } => "branch",
            AgentAction::Prune => "prune",
            AgentAction::CompleteSubgoal => "complete_subgoal",
            AgentAction::Note { .. } => "note",
            AgentAction::ManualIntervention { .. } => "manual_intervention",
            AgentAction::Stop { .. } => "stop",
            AgentAction::Click { .. } => "click",
            AgentAction::TypeText { .. } => "type",
            AgentAction::Goto { .. } => "goto",
            AgentAction::GoBack => "go_back",
            AgentAction::Enter => "enter",
            AgentAction::Scroll { .. } => "scroll",
        }
    }
}

fn definition(name: &str, description: &str, parameters: Value) -> ToolDefinition {
    ToolDefinition {
        tool_type: "function".to_string(),
        function: FunctionDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}

/// Schemas for every supported action, in LLM-compatible format.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        definition(
            "branch",
            "Break the current goal into ordered subgoals. Keeps finished subgoals and replaces the pending tail. Use when a goal needs more than one step.",
            json!({
                "type": "object",
                "properties": {
                    "subgoals": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Ordered subgoal descriptions"
                    }
                },
                "required": ["subgoals"]
            }),
        ),
        definition(
            "prune",
            "Remove the last subgoal from the plan. Use when a planned step turned out to be unnecessary.",
            json!({"type": "object", "properties": {}}),
        ),
        definition(
            "complete_subgoal",
            "Mark the current subgoal as done and move to the next one.",
            json!({"type": "object", "properties": {}}),
        ),
        definition(
            "note",
            "Record an observation worth remembering for later steps (prices seen, error messages, partial results).",
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "The note to record"}
                },
                "required": ["message"]
            }),
        ),
        definition(
            "manual_intervention",
            "Pause and hand control to the human observer. Use for CAPTCHAs, logins, or anything you cannot do yourself.",
            json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "Why you are stuck"},
                    "suggestion": {"type": "string", "description": "What the human should do"}
                },
                "required": ["reason"]
            }),
        ),
        definition(
            "stop",
            "Finish the task and report the final answer to the observer.",
            json!({
                "type": "object",
                "properties": {
                    "answer": {"type": "string", "description": "Final answer or summary"}
                },
                "required": ["answer"]
            }),
        ),
        definition(
            "click",
            "Click an element. Prefer the numbered element_id from the current observation; a CSS selector works as a fallback.",
            json!({
                "type": "object",
                "properties": {
                    "element_id": {"type": "integer", "description": "Numbered element id from the observation"},
                    "selector": {"type": "string", "description": "CSS selector fallback"}
                }
            }),
        ),
        definition(
            "type",
            "Type text into an input. Prefer the numbered element_id from the current observation; a CSS selector works as a fallback.",
            json!({
                "type": "object",
                "properties": {
                    "element_id": {"type": "integer", "description": "Numbered element id from the observation"},
                    "selector": {"type": "string", "description": "CSS selector fallback"},
                    "text": {"type": "string", "description": "Text to type"}
                },
                "required": ["text"]
            }),
        ),
        definition(
            "goto",
            "Navigate to a URL.",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "Absolute URL to open"}
                },
                "required": ["url"]
            }),
        ),
        definition(
            "go_back",
            "Go back one entry in the browser history.",
            json!({"type": "object", "properties": {}}),
        ),
        definition(
            "enter",
            "Press the Enter key in the currently focused element.",
            json!({"type": "object", "properties": {}}),
        ),
        definition(
            "scroll",
            "Scroll the page up or down.",
            json!({
                "type": "object",
                "properties": {
                    "direction": {"type": "string", "enum": ["up", "down"]},
                    "amount": {"type": "number", "description": "Pixels to scroll (default 600)"}
                }
            }),
        ),
    ]
}
