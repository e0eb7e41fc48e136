use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool that can be offered to a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    /// The name of the tool
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// JSON schema of the input the tool accepts
    pub input_schema: Value,
}

impl Tool {
    pub fn new<N, D>(name: N, description: D, input_schema: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Tool {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A tool call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Upstream identifier used to pair the call with its result
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new<I: Into<String>, S: Into<String>>(id: I, name: S, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A tool call together with the output it produced, replayed to the model on the next round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRound {
    pub call: ToolCall,
    pub output: String,
}
