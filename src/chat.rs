use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{BloomError, Result};
use crate::llm::{GenerationOptions, LlmGateway, Provider, ProviderStatus};
use crate::memory::{MemoryManager, ReportContext, UserProfileUpdate};
use crate::message::{
    ConversationMessage, MessageDraft, MessageMetadata, MessageType, Role,
};

pub const WELCOME_MESSAGE: &str = "Hello! I'm BloomBuddy, your AI health companion. I'm here to help you understand your health better with personalized insights and analysis. How can I assist you today?";
pub const APOLOGY_MESSAGE: &str = "I apologize, but I'm experiencing technical difficulties. Please check the API configuration and try again. In the meantime, I recommend consulting with a healthcare professional for any urgent concerns.";

const CHAT_TEMPERATURE: f32 = 0.7;
const CHAT_MAX_TOKENS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageKind {
    User,
    Bot,
}

/// Client-facing view of a transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChatMessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn bot(id: String, content: impl Into<String>) -> Self {
        Self {
            id,
            kind: ChatMessageKind::Bot,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

impl From<&ConversationMessage> for ChatMessage {
    fn from(message: &ConversationMessage) -> Self {
        Self {
            id: message.id.clone(),
            kind: match message.role {
                Role::User => ChatMessageKind::User,
                _ => ChatMessageKind::Bot,
            },
            content: message.content.clone(),
            timestamp: message.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum SendOutcome {
    /// Blank input; nothing happened.
    Ignored,
    Replied(ChatMessage),
    /// The model call failed; carries the apology, which is not persisted.
    Failed(ChatMessage),
    Cancelled,
}

/// Cancels whichever send is in flight. Cloneable and usable while the
/// session itself is borrowed.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self {
            current: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }
}

impl CancelHandle {
    fn token(&self) -> CancellationToken {
        self.current
            .lock()
            .map(|token| token.clone())
            .unwrap_or_else(|_| CancellationToken::new())
    }

    pub fn cancel(&self) {
        if let Ok(mut token) = self.current.lock() {
            token.cancel();
            *token = CancellationToken::new();
        }
    }
}

/// One user's conversation: transcript mutation plus model round-trips.
pub struct ChatSession {
    memory: MemoryManager,
    gateway: Arc<LlmGateway>,
    cancel: CancelHandle,
    last_error: Option<String>,
}

impl ChatSession {
    /// Resumes the session the manager loaded, or starts a fresh one with a
    /// welcome message.
    pub async fn start(memory: MemoryManager, gateway: Arc<LlmGateway>) -> Result<Self> {
        let mut session = Self {
            memory,
            gateway,
            cancel: CancelHandle::default(),
            last_error: None,
        };
        if !session.memory.is_initialized() {
            session.memory.initialize_session(None).await?;
        }
        if session.visible_messages().is_empty() {
            session.add_welcome().await?;
        }
        Ok(session)
    }

    async fn add_welcome(&mut self) -> Result<()> {
        self.memory
            .add_message(
                MessageDraft::assistant(WELCOME_MESSAGE)
                    .with_metadata(MessageMetadata::of_type(MessageType::General)),
            )
            .await?;
        Ok(())
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel_pending(&self) {
        self.cancel.cancel();
    }

    pub fn visible_messages(&self) -> Vec<ChatMessage> {
        self.memory
            .conversation_history()
            .iter()
            .filter(|m| m.role != Role::System)
            .map(ChatMessage::from)
            .collect()
    }

    /// The outgoing user turn, enriched with report and symptom context.
    fn contextual_prompt(&self, content: &str) -> String {
        let mut prompt = content.to_string();
        if let Some(report) = self.memory.report_context() {
            prompt.push_str(&format!(
                "\n\nContext: User has provided a medical report ({}). Report analysis: {}",
                report.file_name, report.analysis
            ));
        }
        if let Some(profile) = self.memory.user_profile() {
            if !profile.symptoms.is_empty() {
                prompt.push_str(&format!(
                    "\n\nUser's previously mentioned symptoms: {}",
                    profile.symptoms.join(", ")
                ));
            }
        }
        prompt
    }

    pub async fn send_message(
        &mut self,
        content: &str,
        message_type: MessageType,
    ) -> Result<SendOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(SendOutcome::Ignored);
        }
        self.last_error = None;

        self.memory
            .add_message(
                MessageDraft::user(content).with_metadata(MessageMetadata::of_type(message_type)),
            )
            .await?;

        if message_type == MessageType::Symptom {
            let mut symptoms = self
                .memory
                .user_profile()
                .map(|p| p.symptoms.clone())
                .unwrap_or_default();
            symptoms.push(content.to_string());
            self.memory
                .update_user_profile(UserProfileUpdate {
                    symptoms: Some(symptoms),
                    ..UserProfileUpdate::default()
                })
                .await?;
        }

        // the stored user turn is swapped for its contextual form in the outgoing view
        let mut outgoing = self.memory.messages_for_llm();
        if outgoing.last().is_some_and(|m| m.role == Role::User) {
            outgoing.pop();
        }
        outgoing.push(ConversationMessage::user(self.contextual_prompt(content)));

        let token = self.cancel.token();
        let options = GenerationOptions::new(CHAT_TEMPERATURE, CHAT_MAX_TOKENS);
        match self
            .gateway
            .generate_response_cancellable(&outgoing, &options, &token)
            .await
        {
            Ok(response) => {
                let stored = self
                    .memory
                    .add_message(
                        MessageDraft::assistant(response.content)
                            .with_metadata(MessageMetadata::of_type(message_type)),
                    )
                    .await?;
                Ok(SendOutcome::Replied(ChatMessage::from(&stored)))
            }
            Err(BloomError::Cancelled) => {
                info!("chat request cancelled");
                Ok(SendOutcome::Cancelled)
            }
            Err(err) => {
                error!(error = %err, "chat request failed");
                self.last_error = Some(err.to_string());
                Ok(SendOutcome::Failed(ChatMessage::bot(
                    format!("error-{}", Utc::now().timestamp_millis()),
                    APOLOGY_MESSAGE,
                )))
            }
        }
    }

    /// Attaches a report and returns the acknowledgement shown to the user.
    pub async fn add_report_context(&mut self, report: ReportContext) -> Result<ChatMessage> {
        let file_name = report.file_name.clone();
        self.memory.add_report_context(report).await?;
        Ok(ChatMessage::bot(
            format!("report-context-{}", Utc::now().timestamp_millis()),
            format!(
                "I can see you've shared your medical report: **{file_name}**. I have analyzed the report and I'm ready to discuss any questions you might have about your results. What would you like to know?"
            ),
        ))
    }

    pub async fn clear_conversation(&mut self) -> Result<()> {
        self.memory.clear_session().await?;
        self.last_error = None;
        self.memory.initialize_session(None).await?;
        self.add_welcome().await
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.gateway.available_providers()
    }

    pub fn switch_provider(&self, name: &str) -> Result<Provider> {
        self.gateway.set_provider_by_name(name)
    }
}
