//! Conversation persistence and title generation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::orchestrator::ChatOrchestrator;
use crate::types::{ChatMessage, ChatOptions, ChatRequest, Role, TokenUsage};

pub const PLACEHOLDER_TITLE: &str = "New Chat";

pub const TITLE_PROMPT: &str = "Generate a short 3-6 word chat title in the style of an article \
                                title, based on the following user message. No punctuation.";

/// Length of the title used when generation fails.
const FALLBACK_TITLE_CHARS: usize = 41;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: u64,
    pub user_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_placeholder_title(&self) -> bool {
        self.title.is_empty() || self.title == PLACEHOLDER_TITLE
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: u64,
    pub conversation_id: u64,
    /// 1-based position within the conversation.
    pub seq: u64,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// A message about to be appended.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub usage: Option<TokenUsage>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            usage: None,
        }
    }

    pub fn assistant(content: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            usage,
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        user_id: &str,
        model_code: Option<String>,
    ) -> Result<Conversation, StoreError>;

    async fn conversation(&self, id: u64) -> Result<Conversation, StoreError>;

    /// Messages in creation order.
    async fn messages(&self, conversation_id: u64) -> Result<Vec<StoredMessage>, StoreError>;

    async fn append_message(
        &self,
        conversation_id: u64,
        message: NewMessage,
    ) -> Result<StoredMessage, StoreError>;

    async fn set_title(&self, id: u64, title: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    next_conversation_id: u64,
    next_message_id: u64,
    conversations: HashMap<u64, Conversation>,
    messages: HashMap<u64, Vec<StoredMessage>>,
}

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(
        &self,
        user_id: &str,
        model_code: Option<String>,
    ) -> Result<Conversation, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_conversation_id += 1;
        let conversation = Conversation {
            id: inner.next_conversation_id,
            user_id: user_id.to_string(),
            title: PLACEHOLDER_TITLE.to_string(),
            model_code,
            created_at: Utc::now(),
        };
        inner.conversations.insert(conversation.id, conversation.clone());
        inner.messages.insert(conversation.id, Vec::new());
        Ok(conversation)
    }

    async fn conversation(&self, id: u64) -> Result<Conversation, StoreError> {
        self.inner
            .read()
            .await
            .conversations
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn messages(&self, conversation_id: u64) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner
            .read()
            .await
            .messages
            .get(&conversation_id)
            .cloned()
            .ok_or(StoreError::NotFound(conversation_id))
    }

    async fn append_message(
        &self,
        conversation_id: u64,
        message: NewMessage,
    ) -> Result<StoredMessage, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_message_id += 1;
        let id = inner.next_message_id;
        let messages = inner
            .messages
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound(conversation_id))?;
        let stored = StoredMessage {
            id,
            conversation_id,
            seq: messages.len() as u64 + 1,
            role: message.role,
            content: message.content,
            prompt_tokens: message.usage.map(|u| u.prompt_tokens),
            completion_tokens: message.usage.map(|u| u.completion_tokens),
            total_tokens: message.usage.map(|u| u.total_tokens),
            created_at: Utc::now(),
        };
        messages.push(stored.clone());
        Ok(stored)
    }

    async fn set_title(&self, id: u64, title: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        conversation.title = title.to_string();
        Ok(())
    }
}

// --- Titles ---

pub fn fallback_title(content: &str) -> String {
    content
        .chars()
        .take(FALLBACK_TITLE_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Ask the model for a title, falling back to the start of the message.
/// Echo mode always uses the fallback.
pub async fn generate_title(
    orchestrator: &ChatOrchestrator,
    content: &str,
    model: Option<String>,
) -> String {
    if !orchestrator.is_enabled() {
        return fallback_title(content);
    }
    let request = ChatRequest::new(
        vec![ChatMessage::system(TITLE_PROMPT), ChatMessage::user(content)],
        model,
        ChatOptions::default(),
    );
    match orchestrator.complete(&request).await {
        Ok(result) if !result.reply.trim().is_empty() => result.reply.trim().to_string(),
        Ok(_) => fallback_title(content),
        Err(e) => {
            warn!("Failed to generate title: {e}");
            fallback_title(content)
        }
    }
}

/// Title a conversation from its first user message. Conversations that
/// already carry a real title are left alone.
pub async fn entitle(
    store: &dyn ConversationStore,
    orchestrator: &ChatOrchestrator,
    conversation_id: u64,
    content: &str,
) -> Result<(), StoreError> {
    let conversation = store.conversation(conversation_id).await?;
    if !conversation.has_placeholder_title() {
        info!("Conversation {conversation_id} already titled, skipping");
        return Ok(());
    }
    let title = generate_title(orchestrator, content, conversation.model_code).await;
    store.set_title(conversation_id, &title).await
}

pub fn entitle_in_background(
    store: Arc<dyn ConversationStore>,
    orchestrator: Arc<ChatOrchestrator>,
    conversation_id: u64,
    content: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = entitle(store.as_ref(), &orchestrator, conversation_id, &content).await {
            warn!("Title generation for conversation {conversation_id} failed: {e}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChatConfig, ProvidersConfig};
    use crate::test_support;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    fn echo_orchestrator() -> ChatOrchestrator {
        let chat = ChatConfig {
            enabled: false,
            echo_delay_ms: 0,
            ..Default::default()
        };
        ChatOrchestrator::new(chat, ProvidersConfig::default())
    }

    async fn titling_orchestrator(reply: &'static str) -> ChatOrchestrator {
        let router = Router::new().route(
            "/chat/completions",
            post(move |Json(body): Json<Value>| async move {
                assert_eq!(body["messages"][0]["content"], TITLE_PROMPT);
                assert_eq!(body["messages"].as_array().unwrap().len(), 2);
                Json(json!({"choices": [{"message": {"content": reply}}]}))
            }),
        );
        let mut providers = ProvidersConfig::default();
        providers.openai.api_base = test_support::spawn(router).await;
        providers.openai.api_key = Some("sk-test".to_string());
        ChatOrchestrator::new(ChatConfig::default(), providers)
    }

    #[tokio::test]
    async fn test_new_conversation_has_placeholder_title() {
        let store = MemoryStore::new();
        let first = store.create_conversation("u1", None).await.unwrap();
        let second = store.create_conversation("u1", None).await.unwrap();
        assert_eq!(first.title, PLACEHOLDER_TITLE);
        assert!(first.has_placeholder_title());
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_messages_keep_creation_order_and_usage() {
        let store = MemoryStore::new();
        let conversation = store.create_conversation("u1", None).await.unwrap();
        store
            .append_message(conversation.id, NewMessage::user("hi"))
            .await
            .unwrap();
        let usage = TokenUsage::from_counts(Some(3), Some(4), None);
        store
            .append_message(conversation.id, NewMessage::assistant("hello", Some(usage)))
            .await
            .unwrap();

        let messages = store.messages(conversation.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].to_chat_message(), ChatMessage::user("hi"));
        assert_eq!(messages[0].total_tokens, None);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].total_tokens, Some(7));
        assert!(messages[0].id < messages[1].id);
    }

    #[tokio::test]
    async fn test_concurrent_appends_have_one_first_message() {
        let store = Arc::new(MemoryStore::new());
        let id = store.create_conversation("u1", None).await.unwrap().id;
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append_message(id, NewMessage::user(format!("m{i}")))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut seqs = Vec::new();
        for task in tasks {
            seqs.push(task.await.unwrap().seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let store = MemoryStore::new();
        assert!(matches!(store.messages(42).await, Err(StoreError::NotFound(42))));
        assert!(matches!(
            store.append_message(42, NewMessage::user("x")).await,
            Err(StoreError::NotFound(42))
        ));
    }

    #[test]
    fn test_fallback_title_takes_41_chars() {
        let long = "a".repeat(60);
        assert_eq!(fallback_title(&long).chars().count(), 41);
        assert_eq!(fallback_title("  short  "), "short");
        assert_eq!(fallback_title(&"é".repeat(50)).chars().count(), 41);
    }

    #[tokio::test]
    async fn test_echo_mode_title_uses_fallback() {
        let title = generate_title(&echo_orchestrator(), "How do lifetimes work", None).await;
        assert_eq!(title, "How do lifetimes work");
    }

    #[tokio::test]
    async fn test_entitle_uses_model_reply() {
        let store = MemoryStore::new();
        let orchestrator = titling_orchestrator("  Rust Lifetimes Explained \n").await;
        let conversation = store.create_conversation("u1", None).await.unwrap();
        entitle(&store, &orchestrator, conversation.id, "How do lifetimes work")
            .await
            .unwrap();
        let titled = store.conversation(conversation.id).await.unwrap();
        assert_eq!(titled.title, "Rust Lifetimes Explained");
    }

    #[tokio::test]
    async fn test_entitle_keeps_existing_title() {
        let store = MemoryStore::new();
        let conversation = store.create_conversation("u1", None).await.unwrap();
        store.set_title(conversation.id, "Chosen").await.unwrap();
        entitle(&store, &echo_orchestrator(), conversation.id, "other")
            .await
            .unwrap();
        assert_eq!(store.conversation(conversation.id).await.unwrap().title, "Chosen");
    }

    #[tokio::test]
    async fn test_entitle_falls_back_on_empty_reply() {
        let store = MemoryStore::new();
        let orchestrator = titling_orchestrator("   ").await;
        let conversation = store.create_conversation("u1", None).await.unwrap();
        entitle(&store, &orchestrator, conversation.id, "tell me about tokio")
            .await
            .unwrap();
        let titled = store.conversation(conversation.id).await.unwrap();
        assert_eq!(titled.title, "tell me about tokio");
    }

    #[tokio::test]
    async fn test_entitle_in_background() {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let conversation = store.create_conversation("u1", None).await.unwrap();
        entitle_in_background(
            store.clone(),
            Arc::new(echo_orchestrator()),
            conversation.id,
            "background title".to_string(),
        )
        .await
        .unwrap();
        assert_eq!(
            store.conversation(conversation.id).await.unwrap().title,
            "background title"
        );
    }
}
