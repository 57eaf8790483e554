use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Speaker id reserved for the human side of a conversation
pub const USER_SPEAKER_ID: &str = "user";

/// Number of characters of the first message considered for a derived title
const TITLE_PREFIX_CHARS: usize = 200;

/// Current time truncated to the precision the database stores
///
/// Timestamps are persisted as integer microseconds, so values produced
/// here compare equal before and after a round trip through the store.
pub fn now() -> DateTime<Utc> {
    from_micros(Utc::now().timestamp_micros())
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
}

/// A named node in the folder tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    /// Unique identifier
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Parent folder, `None` for root folders
    pub parent_id: Option<Uuid>,
    /// System prompt override applied to conversations inside this folder
    pub sys_prompt: Option<String>,
    /// When the folder was created
    pub created_at: DateTime<Utc>,
    /// When the folder was last modified
    pub updated_at: DateTime<Utc>,
}

/// A thread of messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique identifier
    pub id: Uuid,
    /// Explicit title; a title is derived from the messages when unset
    pub title: Option<String>,
    /// Containing folder, `None` for root conversations
    pub folder_id: Option<Uuid>,
    /// When the conversation was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the newest appended message, never decreases
    pub last_message_at: DateTime<Utc>,
    /// When the conversation row was last modified
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Creation date formatted for use as a fallback title
    ///
    /// Uses local time in a `M/D/YYYY, h:mm AM` layout.
    pub fn date_title(&self) -> String {
        self.created_at
            .with_timezone(&Local)
            .format("%-m/%-d/%Y, %-I:%M %p")
            .to_string()
    }

    /// Display title for the conversation
    ///
    /// Returns the explicit title when set. Otherwise the first non-empty line
    /// of the first 200 characters of `earliest` (the chronologically first
    /// message) is used, falling back to [`Conversation::date_title`].
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::storage::{Conversation, Message};
    ///
    /// let now = llamachat::storage::now();
    /// let conversation = Conversation {
    ///     id: uuid::Uuid::new_v4(),
    ///     title: None,
    ///     folder_id: None,
    ///     created_at: now,
    ///     last_message_at: now,
    ///     updated_at: now,
    /// };
    /// let first = Message::user("How big is this file?\nIt is in ~/Downloads");
    /// assert_eq!(conversation.title_with_default(Some(&first)), "How big is this file?");
    /// ```
    pub fn title_with_default(&self, earliest: Option<&Message>) -> String {
        if let Some(title) = &self.title {
            return title.clone();
        }

        earliest
            .and_then(|message| first_line_title(&message.text))
            .unwrap_or_else(|| self.date_title())
    }
}

fn first_line_title(text: &str) -> Option<String> {
    let prefix: String = text.chars().take(TITLE_PREFIX_CHARS).collect();
    prefix
        .split('\n')
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// One transcript entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier
    pub id: Uuid,
    /// Owning conversation; `None` while a reply placeholder is not attached
    pub conversation_id: Option<Uuid>,
    /// Speaker: [`USER_SPEAKER_ID`] or the agent's id
    pub from_id: String,
    /// Message text, mutable while a reply streams
    pub text: String,
    /// When the message was created; defines transcript order
    pub created_at: DateTime<Utc>,
    /// When the text or statistics last changed
    pub updated_at: DateTime<Utc>,
    /// System prompt in effect when the message was written
    pub system_prompt: Option<String>,
    /// Generation speed in tokens per second
    pub predicted_per_second: Option<f64>,
    /// Seconds between request and first streamed token
    pub response_start_seconds: Option<f64>,
    /// Number of predicted tokens
    pub n_predicted: Option<i64>,
    /// Model reported by the server
    pub model_name: Option<String>,
}

impl Message {
    /// Creates an unattached message stamped with the current time
    pub fn new(from_id: impl Into<String>, text: impl Into<String>) -> Self {
        let created_at = now();
        Self {
            id: Uuid::new_v4(),
            conversation_id: None,
            from_id: from_id.into(),
            text: text.into(),
            created_at,
            updated_at: created_at,
            system_prompt: None,
            predicted_per_second: None,
            response_start_seconds: None,
            n_predicted: None,
            model_name: None,
        }
    }

    /// Creates an unattached user message
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::storage::{Message, USER_SPEAKER_ID};
    ///
    /// let msg = Message::user("hello");
    /// assert_eq!(msg.from_id, USER_SPEAKER_ID);
    /// assert!(msg.conversation_id.is_none());
    /// ```
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(USER_SPEAKER_ID, text)
    }

    /// Sets the system prompt snapshot
    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    /// Whether the human side wrote this message
    pub fn is_from_user(&self) -> bool {
        self.from_id == USER_SPEAKER_ID
    }
}

/// Top-level sidebar contents
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RootItems {
    /// Folders without a parent, sorted by name
    pub folders: Vec<Folder>,
    /// Conversations without a folder, newest activity first
    pub conversations: Vec<Conversation>,
}
