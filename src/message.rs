use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Speaker of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Symptom,
    ReportAnalysis,
    #[default]
    General,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl MessageMetadata {
    pub fn of_type(message_type: MessageType) -> Self {
        Self {
            message_type: Some(message_type),
            ..Self::default()
        }
    }
}

/// A single transcript entry. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl ConversationMessage {
    /// Builds an ephemeral message that is sent to a model but never stored.
    pub fn transient(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", role.as_str(), Utc::now().timestamp_millis()),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::transient(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::transient(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::transient(Role::Assistant, content)
    }
}

/// Caller-supplied part of a message; id and timestamp are assigned on append.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub metadata: Option<MessageMetadata>,
}

impl MessageDraft {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub(crate) fn into_message(self, id: String, timestamp: DateTime<Utc>) -> ConversationMessage {
        ConversationMessage {
            id,
            role: self.role,
            content: self.content,
            timestamp,
            metadata: self.metadata,
        }
    }
}

/// `{prefix}_{unix millis}_{9 random chars}`
pub(crate) fn generate_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = generate_id("msg");
        let b = generate_id("msg");
        assert_ne!(a, b);
        assert!(a.starts_with("msg_"));
        assert_eq!(a.rsplit('_').next().unwrap().len(), 9);
    }

    #[test]
    fn metadata_uses_camel_case_on_the_wire() {
        let meta = MessageMetadata::of_type(MessageType::ReportAnalysis);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["messageType"], "report_analysis");
        assert!(json.get("reportData").is_none());
    }
}
