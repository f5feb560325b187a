use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BloomError, Result};
use crate::message::{
    generate_id, ConversationMessage, MessageDraft, MessageMetadata, MessageType, Role,
};
use crate::storage::SessionStore;

pub const DEFAULT_STORAGE_KEY: &str = "bloombuddy_conversation";
pub const DEFAULT_MAX_MESSAGES: usize = 20;
pub const SYSTEM_PROMPT_ID: &str = "1";

pub const SYSTEM_PROMPT: &str = "You are BloomBuddy, an AI health companion designed to help users understand their health better. You provide personalized insights, analyze medical reports, and offer guidance on symptoms.

Key Guidelines:
- Always prioritize user safety and recommend professional medical consultation when appropriate
- Be empathetic, clear, and supportive in your responses
- Use the conversation context and any report data to provide personalized insights
- Remember previous discussions to maintain continuity
- Format responses clearly with bullet points, sections, and emojis when helpful
- Always include appropriate medical disclaimers

Remember: You are an AI assistant for informational purposes only and should not replace professional medical advice.";

/// Summary of an uploaded report attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportContext {
    pub file_name: String,
    pub analysis: String,
    pub upload_date: String,
    pub file_type: String,
    pub file_size: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
}

/// Partial profile; present fields replace the stored ones whole.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct UserProfileUpdate {
    #[serde(default)]
    pub symptoms: Option<Vec<String>>,
    #[serde(default)]
    pub concerns: Option<Vec<String>>,
    #[serde(default)]
    pub preferences: Option<Vec<String>>,
}

/// The session aggregate. Persisted as a single JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMemory {
    pub session_id: String,
    pub messages: Vec<ConversationMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_context: Option<ReportContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_profile: Option<UserProfile>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ConversationMemory {
    /// Fresh session seeded with the system prompt at index 0.
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            messages: vec![ConversationMessage {
                id: SYSTEM_PROMPT_ID.to_string(),
                role: Role::System,
                content: SYSTEM_PROMPT.to_string(),
                timestamp: now,
                metadata: None,
            }],
            report_context: None,
            user_profile: None,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Keeps the seed prompt, injected system notices stay out.
    pub fn messages_for_llm(&self) -> Vec<ConversationMessage> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(index, msg)| *index == 0 || msg.role != Role::System || msg.metadata.is_none())
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    fn pinned_report_index(&self) -> Option<usize> {
        self.messages
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .find(|(_, msg)| is_report_notice(msg))
            .map(|(index, _)| index)
    }

    /// Evicts the oldest messages until `len() <= max`.
    ///
    /// Index 0 is never evicted. The latest report-context notice keeps its
    /// own slot (it still counts toward `max`) while `max >= 3`.
    fn trim(&mut self, max: usize) {
        let max = max.max(2);
        if self.messages.len() <= max {
            return;
        }

        let pinned = if max >= 3 { self.pinned_report_index() } else { None };
        let budget = if pinned.is_some() { max - 2 } else { max - 1 };
        let others: Vec<usize> = (1..self.messages.len())
            .filter(|index| Some(*index) != pinned)
            .collect();
        let start = others.len().saturating_sub(budget);

        let mut keep = Vec::with_capacity(max);
        keep.push(0);
        keep.extend(pinned);
        keep.extend_from_slice(&others[start..]);
        keep.sort_unstable();

        let before = self.messages.len();
        let mut index = 0usize;
        self.messages.retain(|_| {
            let kept = keep.binary_search(&index).is_ok();
            index += 1;
            kept
        });
        debug!(before, after = self.messages.len(), "trimmed transcript");
    }
}

fn is_report_notice(msg: &ConversationMessage) -> bool {
    msg.role == Role::System
        && msg
            .metadata
            .as_ref()
            .and_then(|meta| meta.message_type)
            .map_or(false, |kind| kind == MessageType::ReportAnalysis)
}

#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub max_messages: usize,
    pub storage_key: String,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

/// Handle owning one session's transcript and its persistence.
///
/// Every mutating call writes the whole aggregate back to the store.
pub struct MemoryManager {
    store: Arc<dyn SessionStore>,
    options: MemoryOptions,
    memory: Option<ConversationMemory>,
}

impl MemoryManager {
    /// Restores the stored session if one exists. Unreadable or corrupt
    /// blobs are logged and leave the manager uninitialized.
    pub async fn load(store: Arc<dyn SessionStore>, options: MemoryOptions) -> Self {
        let memory = match store.get(&options.storage_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<ConversationMemory>(&raw) {
                Ok(memory) => Some(memory),
                Err(err) => {
                    warn!(error = %err, "failed to load conversation from storage");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "failed to read conversation from storage");
                None
            }
        };

        Self {
            store,
            options,
            memory,
        }
    }

    pub fn max_messages(&self) -> usize {
        self.options.max_messages
    }

    pub fn is_initialized(&self) -> bool {
        self.memory.is_some()
    }

    pub fn session(&self) -> Option<&ConversationMemory> {
        self.memory.as_ref()
    }

    /// Replaces any in-memory state with a freshly seeded session.
    pub async fn initialize_session(
        &mut self,
        session_id: Option<String>,
    ) -> Result<&ConversationMemory> {
        let session_id = session_id.unwrap_or_else(|| generate_id("session"));
        self.memory = Some(ConversationMemory::new(session_id));
        self.persist().await?;
        self.current()
    }

    pub async fn add_message(&mut self, draft: MessageDraft) -> Result<ConversationMessage> {
        self.ensure_session().await?;
        let max = self.options.max_messages;
        let now = Utc::now();
        let message = draft.into_message(generate_id("msg"), now);

        let memory = self.current_mut()?;
        memory.messages.push(message.clone());
        memory.last_activity = now;
        memory.trim(max);

        self.persist().await?;
        Ok(message)
    }

    /// Stores the report and appends a tagged system notice describing it.
    pub async fn add_report_context(
        &mut self,
        report: ReportContext,
    ) -> Result<ConversationMessage> {
        self.ensure_session().await?;
        let content = format!(
            "User has provided a medical report: {}. Use this context in your responses. Report analysis: {}",
            report.file_name, report.analysis
        );
        let metadata = MessageMetadata {
            message_type: Some(MessageType::ReportAnalysis),
            report_data: Some(serde_json::to_value(&report)?),
            context: None,
        };
        self.current_mut()?.report_context = Some(report);

        self.add_message(MessageDraft::new(Role::System, content).with_metadata(metadata))
            .await
    }

    pub async fn update_user_profile(&mut self, update: UserProfileUpdate) -> Result<&UserProfile> {
        self.ensure_session().await?;
        {
            let memory = self.current_mut()?;
            let profile = memory.user_profile.get_or_insert_with(UserProfile::default);
            if let Some(symptoms) = update.symptoms {
                profile.symptoms = symptoms;
            }
            if let Some(concerns) = update.concerns {
                profile.concerns = concerns;
            }
            if let Some(preferences) = update.preferences {
                profile.preferences = preferences;
            }
        }
        self.persist().await?;
        self.current()?
            .user_profile
            .as_ref()
            .ok_or_else(|| BloomError::Protocol("user profile missing after update".into()))
    }

    pub fn conversation_history(&self) -> &[ConversationMessage] {
        self.memory
            .as_ref()
            .map(|memory| memory.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn messages_for_llm(&self) -> Vec<ConversationMessage> {
        self.memory
            .as_ref()
            .map(ConversationMemory::messages_for_llm)
            .unwrap_or_default()
    }

    pub fn report_context(&self) -> Option<&ReportContext> {
        self.memory.as_ref()?.report_context.as_ref()
    }

    pub fn user_profile(&self) -> Option<&UserProfile> {
        self.memory.as_ref()?.user_profile.as_ref()
    }

    pub async fn clear_session(&mut self) -> Result<()> {
        self.memory = None;
        self.store.remove(&self.options.storage_key).await
    }

    async fn ensure_session(&mut self) -> Result<()> {
        if self.memory.is_none() {
            self.initialize_session(None).await?;
        }
        Ok(())
    }

    fn current(&self) -> Result<&ConversationMemory> {
        self.memory
            .as_ref()
            .ok_or_else(|| BloomError::Protocol("no active session".into()))
    }

    fn current_mut(&mut self) -> Result<&mut ConversationMemory> {
        self.memory
            .as_mut()
            .ok_or_else(|| BloomError::Protocol("no active session".into()))
    }

    async fn persist(&self) -> Result<()> {
        if let Some(memory) = &self.memory {
            let payload = serde_json::to_string(memory)?;
            self.store.set(&self.options.storage_key, &payload).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemorySessionStore;

    fn report() -> ReportContext {
        ReportContext {
            file_name: "labs.pdf".into(),
            analysis: "✓ glucose normal".into(),
            upload_date: "2024-05-01T10:00:00Z".into(),
            file_type: "application/pdf".into(),
            file_size: "12.5 KB".into(),
        }
    }

    async fn manager(max_messages: usize) -> (Arc<InMemorySessionStore>, MemoryManager) {
        let store = Arc::new(InMemorySessionStore::new());
        let options = MemoryOptions {
            max_messages,
            ..MemoryOptions::default()
        };
        let manager = MemoryManager::load(store.clone(), options).await;
        (store, manager)
    }

    #[tokio::test]
    async fn overflow_keeps_seed_prompt_and_cap() {
        for count in [1usize, 19, 20, 21, 45] {
            let (_, mut memory) = manager(20).await;
            memory.initialize_session(None).await.unwrap();
            for i in 0..count {
                memory
                    .add_message(MessageDraft::user(format!("message {}", i + 1)))
                    .await
                    .unwrap();
            }
            let history = memory.conversation_history();
            assert_eq!(history.len(), (count + 1).min(20));
            assert_eq!(history[0].id, SYSTEM_PROMPT_ID);
            assert_eq!(history[0].content, SYSTEM_PROMPT);
            assert_eq!(history.last().unwrap().content, format!("message {count}"));
        }
    }

    #[tokio::test]
    async fn twenty_five_messages_with_cap_twenty() {
        let (store, mut memory) = manager(20).await;
        memory.initialize_session(None).await.unwrap();
        for i in 1..=25 {
            memory
                .add_message(MessageDraft::user(format!("message {i}")))
                .await
                .unwrap();
        }

        let raw = store.get(DEFAULT_STORAGE_KEY).await.unwrap().unwrap();
        let stored: ConversationMemory = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.messages.len(), 20);
        assert_eq!(stored.messages[0].role, Role::System);
        // seed + the 19 most recent of 25
        assert_eq!(stored.messages[1].content, "message 7");
        assert_eq!(stored.messages[19].content, "message 25");
    }

    #[tokio::test]
    async fn add_message_initializes_implicitly() {
        let (_, mut memory) = manager(20).await;
        assert!(!memory.is_initialized());
        let msg = memory.add_message(MessageDraft::user("hi")).await.unwrap();
        assert!(msg.id.starts_with("msg_"));
        assert_eq!(memory.conversation_history().len(), 2);
        assert!(memory.session().unwrap().session_id.starts_with("session_"));
    }

    #[tokio::test]
    async fn initialize_replaces_state_and_reuses_id() {
        let (_, mut memory) = manager(20).await;
        memory.add_message(MessageDraft::user("hi")).await.unwrap();
        let session = memory
            .initialize_session(Some("session_fixed".into()))
            .await
            .unwrap();
        assert_eq!(session.session_id, "session_fixed");
        assert_eq!(session.messages.len(), 1);
    }

    #[tokio::test]
    async fn llm_view_excludes_injected_notices() {
        let (_, mut memory) = manager(20).await;
        memory.initialize_session(None).await.unwrap();
        memory
            .add_message(
                MessageDraft::assistant("welcome")
                    .with_metadata(MessageMetadata::of_type(MessageType::General)),
            )
            .await
            .unwrap();
        memory.add_report_context(report()).await.unwrap();
        memory.add_message(MessageDraft::user("what now?")).await.unwrap();

        assert_eq!(memory.conversation_history().len(), 4);
        let view = memory.messages_for_llm();
        assert_eq!(view.len(), 3);
        assert_eq!(view[0].id, SYSTEM_PROMPT_ID);
        for msg in view.iter().skip(1) {
            assert!(msg.role != Role::System || msg.metadata.is_none());
        }
        assert_eq!(memory.report_context(), Some(&report()));
    }

    #[tokio::test]
    async fn report_notice_survives_trimming() {
        let (_, mut memory) = manager(5).await;
        memory.initialize_session(None).await.unwrap();
        let notice = memory.add_report_context(report()).await.unwrap();
        for i in 0..10 {
            memory
                .add_message(MessageDraft::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let history = memory.conversation_history();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].id, SYSTEM_PROMPT_ID);
        assert_eq!(history[1].id, notice.id);
        let tail: Vec<&str> = history[2..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(tail, vec!["m7", "m8", "m9"]);
    }

    #[tokio::test]
    async fn replaced_report_notice_evicts_the_older_one() {
        let (_, mut memory) = manager(4).await;
        memory.initialize_session(None).await.unwrap();
        memory.add_report_context(report()).await.unwrap();
        let mut second = report();
        second.file_name = "followup.pdf".into();
        let latest = memory.add_report_context(second.clone()).await.unwrap();
        for i in 0..3 {
            memory
                .add_message(MessageDraft::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let history = memory.conversation_history();
        assert_eq!(history.len(), 4);
        let notices: Vec<&ConversationMessage> =
            history.iter().filter(|m| is_report_notice(m)).collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].id, latest.id);
        assert_eq!(memory.report_context(), Some(&second));
    }

    #[tokio::test]
    async fn profile_updates_merge_shallowly() {
        let (_, mut memory) = manager(20).await;
        memory
            .update_user_profile(UserProfileUpdate {
                symptoms: Some(vec!["headache".into()]),
                concerns: Some(vec!["sleep".into()]),
                preferences: None,
            })
            .await
            .unwrap();
        let profile = memory
            .update_user_profile(UserProfileUpdate {
                symptoms: Some(vec!["headache".into(), "fatigue".into()]),
                ..UserProfileUpdate::default()
            })
            .await
            .unwrap();
        assert_eq!(profile.symptoms, vec!["headache", "fatigue"]);
        assert_eq!(profile.concerns, vec!["sleep"]);
        assert!(profile.preferences.is_empty());
    }

    #[tokio::test]
    async fn reload_reconstructs_identical_session() {
        let (store, mut memory) = manager(20).await;
        memory.initialize_session(None).await.unwrap();
        memory.add_message(MessageDraft::user("one")).await.unwrap();
        memory.add_message(MessageDraft::assistant("two")).await.unwrap();
        memory.add_report_context(report()).await.unwrap();

        let reloaded = MemoryManager::load(store, MemoryOptions::default()).await;
        let original = memory.session().unwrap();
        let restored = reloaded.session().unwrap();
        assert_eq!(restored, original);
        for (a, b) in original.messages.iter().zip(&restored.messages) {
            assert_eq!(a.timestamp, b.timestamp);
        }
        assert_eq!(restored.created_at, original.created_at);
    }

    #[tokio::test]
    async fn corrupt_blob_leaves_manager_uninitialized() {
        let store = Arc::new(InMemorySessionStore::new());
        store.set(DEFAULT_STORAGE_KEY, "{not json").await.unwrap();
        let memory = MemoryManager::load(store, MemoryOptions::default()).await;
        assert!(!memory.is_initialized());
        assert!(memory.conversation_history().is_empty());
        assert!(memory.messages_for_llm().is_empty());
    }

    #[tokio::test]
    async fn clear_wipes_store() {
        let (store, mut memory) = manager(20).await;
        memory.add_message(MessageDraft::user("hi")).await.unwrap();
        assert!(store.get(DEFAULT_STORAGE_KEY).await.unwrap().is_some());

        memory.clear_session().await.unwrap();
        assert!(!memory.is_initialized());
        assert!(store.get(DEFAULT_STORAGE_KEY).await.unwrap().is_none());
    }

    #[test]
    fn serialized_dates_are_iso_strings() {
        let memory = ConversationMemory::new("session_x");
        let json = serde_json::to_value(&memory).unwrap();
        let created = json["createdAt"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(created).is_ok());
        assert_eq!(json["messages"][0]["role"], "system");
    }
}
