use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use crate::api::Source;
use crate::commands::chat::TurnOutcome;
use crate::config::ClientConfig;
use crate::db::models::{Conversation, Role, StoredMessage};
use crate::db::Database;
use crate::identity::IdentityProvider;

pub const CONVERSATIONS_PATH: &str = "/api/conversations";
const ACTIVE_KEY: &str = "active_conversation_id";
const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Sign in to save conversations")]
    Unauthenticated,
}

impl Serialize for DirectoryError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Deserialize)]
struct ConversationList {
    conversations: Vec<Conversation>,
}

#[derive(Deserialize)]
struct MessageList {
    messages: Vec<RemoteMessage>,
}

#[derive(Deserialize)]
struct RemoteMessage {
    id: String,
    role: String,
    content: String,
    #[serde(default)]
    sources: Vec<Source>,
    created_at: String,
}

#[derive(Serialize)]
struct TitleBody<'a> {
    title: &'a str,
}

/// Read cache over the remote conversation store, plus the locally
/// remembered active conversation.
pub struct ConversationDirectory {
    client: Client,
    config: ClientConfig,
    identity: Arc<dyn IdentityProvider>,
    db: Arc<Database>,
    /// Created for the first turn of a new chat, not yet confirmed by a
    /// completed turn.
    provisional: Mutex<Option<String>>,
}

impl ConversationDirectory {
    pub fn new(config: ClientConfig, identity: Arc<dyn IdentityProvider>, db: Arc<Database>) -> Self {
        Self {
            client: Client::new(),
            config,
            identity,
            db,
            provisional: Mutex::new(None),
        }
    }

    /// Fetch the list from the server and replace the local cache with it.
    pub async fn refresh(&self) -> Result<Vec<Conversation>, DirectoryError> {
        let resp = self.request(Method::GET, CONVERSATIONS_PATH)?.send().await?;
        let list: ConversationList = check(resp).await?.json().await?;
        self.db.replace_conversations(&list.conversations)?;
        tracing::debug!(count = list.conversations.len(), "Conversation list refreshed");
        Ok(self.db.list_conversations()?)
    }

    pub fn cached(&self) -> Result<Vec<Conversation>, DirectoryError> {
        Ok(self.db.list_conversations()?)
    }

    pub async fn create(&self, title: &str) -> Result<Conversation, DirectoryError> {
        let resp = self
            .request(Method::POST, CONVERSATIONS_PATH)?
            .json(&TitleBody { title })
            .send()
            .await?;
        let conversation: Conversation = check(resp).await?.json().await?;
        self.db.upsert_conversation(&conversation)?;
        tracing::info!(conversation_id = %conversation.id, "Conversation created");
        Ok(conversation)
    }

    pub async fn rename(&self, id: &str, title: &str) -> Result<(), DirectoryError> {
        let path = format!("{}/{}", CONVERSATIONS_PATH, id);
        let resp = self
            .request(Method::PATCH, &path)?
            .json(&TitleBody { title })
            .send()
            .await?;
        check(resp).await?;
        self.db.update_conversation_title(id, title)?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), DirectoryError> {
        let path = format!("{}/{}", CONVERSATIONS_PATH, id);
        let resp = self.request(Method::DELETE, &path)?.send().await?;
        check(resp).await?;
        self.db.delete_conversation(id)?;
        if self.active()?.as_deref() == Some(id) {
            self.start_new_chat()?;
        }
        tracing::info!(conversation_id = %id, "Conversation deleted");
        Ok(())
    }

    /// Messages of a conversation. Served from the local cache when the
    /// server cannot be reached.
    pub async fn messages(&self, id: &str) -> Result<Vec<StoredMessage>, DirectoryError> {
        match self.fetch_messages(id).await {
            Ok(messages) => {
                // Message rows hang off a cached conversation row.
                if self.db.get_conversation(id)?.is_some() {
                    self.db.replace_messages(id, &messages)?;
                } else {
                    tracing::debug!(conversation_id = %id, "Conversation not cached, messages not stored");
                }
                Ok(messages)
            }
            Err(DirectoryError::Http(e)) => {
                tracing::warn!(conversation_id = %id, error = %e, "Serving cached messages");
                Ok(self.db.get_messages(id)?)
            }
            Err(e) => Err(e),
        }
    }

    pub fn active(&self) -> Result<Option<String>, DirectoryError> {
        Ok(self.db.get_setting(ACTIVE_KEY)?.filter(|id| !id.is_empty()))
    }

    pub fn select(&self, id: &str) -> Result<(), DirectoryError> {
        self.db.set_setting(ACTIVE_KEY, id)?;
        Ok(())
    }

    /// Leave the active conversation. Nothing is created server-side until
    /// the first turn is sent.
    pub fn start_new_chat(&self) -> Result<(), DirectoryError> {
        self.db.delete_setting(ACTIVE_KEY)?;
        Ok(())
    }

    /// Conversation id to attach to the next turn. The first turn of a new
    /// chat gets a freshly created conversation that only becomes active once
    /// [`settle_turn`](Self::settle_turn) sees it complete. Signed-out users
    /// chat without one.
    pub async fn ensure_active(&self, first_message: &str) -> Result<Option<String>, DirectoryError> {
        if let Some(id) = self.active()? {
            return Ok(Some(id));
        }
        let provisional = self.provisional.lock().clone();
        if provisional.is_some() {
            return Ok(provisional);
        }
        if self.identity.bearer_token().is_none() {
            return Ok(None);
        }
        let conversation = self.create(&title_from(first_message)).await?;
        *self.provisional.lock() = Some(conversation.id.clone());
        Ok(Some(conversation.id))
    }

    /// Apply the outcome of a turn sent in conversation `id`.
    ///
    /// A completed turn activates a provisional conversation and bumps the
    /// cached count. A provisional conversation whose first turn failed or
    /// was cancelled is deleted again, so no empty conversation is left on
    /// the server. Superseded turns leave everything to the newer turn.
    pub async fn settle_turn(&self, id: &str, outcome: TurnOutcome) -> Result<(), DirectoryError> {
        let provisional = self.provisional.lock().as_deref() == Some(id);
        match outcome {
            TurnOutcome::Completed => {
                if provisional {
                    self.select(id)?;
                    self.provisional.lock().take();
                }
                self.record_turn(id)
            }
            TurnOutcome::Failed | TurnOutcome::Cancelled if provisional => {
                self.delete(id).await?;
                self.provisional.lock().take();
                tracing::info!(conversation_id = %id, "Discarded conversation without a completed turn");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Account for a completed turn (one user and one assistant message).
    pub fn record_turn(&self, id: &str) -> Result<(), DirectoryError> {
        if let Some(mut conversation) = self.db.get_conversation(id)? {
            conversation.message_count += 2;
            conversation.updated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            self.db.upsert_conversation(&conversation)?;
        }
        Ok(())
    }

    async fn fetch_messages(&self, id: &str) -> Result<Vec<StoredMessage>, DirectoryError> {
        let path = format!("{}/{}/messages", CONVERSATIONS_PATH, id);
        let resp = self.request(Method::GET, &path)?.send().await?;
        let list: MessageList = check(resp).await?.json().await?;
        Ok(list
            .messages
            .into_iter()
            .filter_map(|m| {
                let Some(role) = Role::parse(&m.role) else {
                    tracing::debug!(message_id = %m.id, role = %m.role, "Skipping message with unknown role");
                    return None;
                };
                Some(StoredMessage {
                    id: m.id,
                    conversation_id: id.to_string(),
                    role: role.as_str().to_string(),
                    content: m.content,
                    sources: m.sources,
                    created_at: m.created_at,
                })
            })
            .collect())
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, DirectoryError> {
        let token = self
            .identity
            .bearer_token()
            .ok_or(DirectoryError::Unauthenticated)?;
        Ok(self
            .client
            .request(method, self.config.endpoint(path))
            .bearer_auth(token))
    }
}

async fn check(resp: Response) -> Result<Response, DirectoryError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    Err(DirectoryError::Api { status, message })
}

fn title_from(message: &str) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return "New conversation".to_string();
    }
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        return collapsed;
    }
    let mut title: String = collapsed.chars().take(TITLE_MAX_CHARS - 3).collect();
    title.push_str("...");
    title
}
