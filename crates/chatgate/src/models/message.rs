use serde::{Deserialize, Serialize};

use super::role::Role;

/// A message to or from a model. Messages are immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    pub fn new<S: Into<String>>(role: Role, content: S) -> Self {
        Message {
            role,
            content: content.into(),
        }
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system<S: Into<String>>(content: S) -> Self {
        Self::new(Role::System, content)
    }

    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Blank messages never enter the pipeline
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// A message as it arrives from a caller, before its role has been validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl IncomingMessage {
    pub fn new<R: Into<String>, C: Into<String>>(role: R, content: C) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_detection() {
        assert!(Message::user("").is_blank());
        assert!(Message::user(" \n\t").is_blank());
        assert!(!Message::user("hi").is_blank());
    }

    #[test]
    fn test_message_serialization() {
        let message = Message::assistant("Hello!");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"], "Hello!");

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_incoming_message_tolerates_missing_content() {
        let incoming: IncomingMessage = serde_json::from_str(r#"{"role":"user"}"#).unwrap();
        assert_eq!(incoming.content, None);
    }
}
