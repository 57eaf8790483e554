use crate::config::StorageConfig;
use crate::error::{LlamachatError, Result};
use directories::ProjectDirs;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

pub mod types;
pub use types::{
    now, Conversation, Folder, Message, RootItems, USER_SPEAKER_ID,
};

use types::from_micros;

const FOLDER_COLUMNS: &str = "id, name, parent_id, sys_prompt, created_at, updated_at";

const CONVERSATION_COLUMNS: &str =
    "id, title, folder_id, created_at, last_message_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, from_id, text, created_at, updated_at, \
     system_prompt, predicted_per_second, response_start_seconds, n_predicted, model_name";

/// Maps a rusqlite error into a storage error naming the failed action
fn storage_err(action: &'static str) -> impl Fn(rusqlite::Error) -> LlamachatError {
    move |e| LlamachatError::Storage(format!("Failed to {}: {}", action, e))
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        Uuid::parse_str(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<Folder> {
    Ok(Folder {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        parent_id: opt_uuid_at(row, 2)?,
        sys_prompt: row.get(3)?,
        created_at: from_micros(row.get(4)?),
        updated_at: from_micros(row.get(5)?),
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_at(row, 0)?,
        title: row.get(1)?,
        folder_id: opt_uuid_at(row, 2)?,
        created_at: from_micros(row.get(3)?),
        last_message_at: from_micros(row.get(4)?),
        updated_at: from_micros(row.get(5)?),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_at(row, 0)?,
        conversation_id: opt_uuid_at(row, 1)?,
        from_id: row.get(2)?,
        text: row.get(3)?,
        created_at: from_micros(row.get(4)?),
        updated_at: from_micros(row.get(5)?),
        system_prompt: row.get(6)?,
        predicted_per_second: row.get(7)?,
        response_start_seconds: row.get(8)?,
        n_predicted: row.get(9)?,
        model_name: row.get(10)?,
    })
}

/// Empty prompts mean "no override"
fn normalize_prompt(prompt: Option<&str>) -> Option<String> {
    prompt
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

/// Escape `LIKE` wildcards for use with `ESCAPE '\'`
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// SQLite-backed store for folders, conversations and messages
pub struct SqliteStorage {
    db_path: PathBuf,
}

impl SqliteStorage {
    /// Create a new storage instance
    ///
    /// Initializes the database file in the user's data directory.
    pub fn new() -> Result<Self> {
        // The env override points the binary at a scratch database without
        // touching the user's data directory.
        if let Ok(override_path) = std::env::var("LLAMACHAT_DB") {
            return Self::new_with_path(override_path);
        }

        let proj_dirs = ProjectDirs::from("org", "llamachat", "llamachat")
            .ok_or_else(|| LlamachatError::Storage("Could not determine data directory".into()))?;

        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir).map_err(|e| {
            LlamachatError::Storage(format!("Failed to create data directory: {}", e))
        })?;

        Self::new_with_path(data_dir.join("conversations.db"))
    }

    /// Create a new storage instance that uses the specified database path.
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::storage::SqliteStorage;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let storage = SqliteStorage::new_with_path(dir.path().join("chat.db")).unwrap();
    /// assert!(storage.fetch_root_items().unwrap().folders.is_empty());
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LlamachatError::Storage(format!(
                        "Failed to create parent directory for database: {}",
                        e
                    ))
                })?;
            }
        }

        let storage = Self { db_path };
        storage.init()?;
        Ok(storage)
    }

    /// Open the store named by the configuration, or the default location
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match &config.db_path {
            Some(path) => Self::new_with_path(path.clone()),
            None => Self::new(),
        }
    }

    /// Path of the backing database file
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).map_err(storage_err("open database"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(storage_err("enable foreign keys"))?;
        Ok(conn)
    }

    /// Initialize the database schema
    fn init(&self) -> Result<()> {
        let conn = self.connect()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS folders (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                parent_id TEXT REFERENCES folders(id) ON DELETE SET NULL,
                sys_prompt TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT,
                folder_id TEXT REFERENCES folders(id) ON DELETE SET NULL,
                created_at INTEGER NOT NULL,
                last_message_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                from_id TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                system_prompt TEXT,
                predicted_per_second REAL,
                response_start_seconds REAL,
                n_predicted INTEGER,
                model_name TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at, seq);
            CREATE INDEX IF NOT EXISTS idx_conversations_folder
                ON conversations(folder_id);
            CREATE INDEX IF NOT EXISTS idx_folders_parent
                ON folders(parent_id);",
        )
        .map_err(storage_err("create tables"))?;

        Ok(())
    }

    // ----------------------------------------------------------------------
    // Folders
    // ----------------------------------------------------------------------

    /// Create a folder under `parent_id`, or at the root
    pub fn create_folder(&self, name: &str, parent_id: Option<Uuid>) -> Result<Folder> {
        if let Some(parent) = parent_id {
            self.require_folder(parent)?;
        }

        let created_at = now();
        let folder = Folder {
            id: Uuid::new_v4(),
            name: name.to_string(),
            parent_id,
            sys_prompt: None,
            created_at,
            updated_at: created_at,
        };

        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO folders (id, name, parent_id, sys_prompt, created_at, updated_at)
             VALUES (?, ?, ?, NULL, ?, ?)",
            params![
                folder.id.to_string(),
                folder.name,
                folder.parent_id.map(|p| p.to_string()),
                created_at.timestamp_micros(),
                created_at.timestamp_micros()
            ],
        )
        .map_err(storage_err("insert folder"))?;

        tracing::debug!(folder_id = %folder.id, name = %folder.name, "Created folder");
        Ok(folder)
    }

    /// Load a folder by id
    pub fn folder(&self, id: Uuid) -> Result<Option<Folder>> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("SELECT {} FROM folders WHERE id = ?", FOLDER_COLUMNS),
            params![id.to_string()],
            folder_from_row,
        )
        .optional()
        .map_err(|e| storage_err("query folder")(e).into())
    }

    fn require_folder(&self, id: Uuid) -> Result<Folder> {
        self.folder(id)?
            .ok_or_else(|| LlamachatError::NotFound(format!("folder {}", id)).into())
    }

    /// Folders without a parent, sorted by name
    pub fn root_folders(&self) -> Result<Vec<Folder>> {
        self.query_folders(
            &format!(
                "SELECT {} FROM folders WHERE parent_id IS NULL ORDER BY name, created_at",
                FOLDER_COLUMNS
            ),
            None,
        )
    }

    /// Direct children of a folder, sorted by name
    pub fn subfolders(&self, folder_id: Uuid) -> Result<Vec<Folder>> {
        self.query_folders(
            &format!(
                "SELECT {} FROM folders WHERE parent_id = ? ORDER BY name, created_at",
                FOLDER_COLUMNS
            ),
            Some(folder_id),
        )
    }

    fn query_folders(&self, sql: &str, arg: Option<Uuid>) -> Result<Vec<Folder>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(sql).map_err(storage_err("prepare statement"))?;
        let rows = match arg {
            Some(id) => stmt.query_map(params![id.to_string()], folder_from_row),
            None => stmt.query_map([], folder_from_row),
        }
        .map_err(storage_err("query folders"))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage_err("read folder row")(e).into())
    }

    /// Rename a folder
    pub fn rename_folder(&self, id: Uuid, name: &str) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn
            .execute(
                "UPDATE folders SET name = ?, updated_at = ? WHERE id = ?",
                params![name, now().timestamp_micros(), id.to_string()],
            )
            .map_err(storage_err("rename folder"))?;
        if changed == 0 {
            return Err(LlamachatError::NotFound(format!("folder {}", id)).into());
        }
        Ok(())
    }

    /// Set or clear the folder's system prompt override
    ///
    /// Blank prompts clear the override.
    pub fn set_folder_sys_prompt(&self, id: Uuid, sys_prompt: Option<&str>) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn
            .execute(
                "UPDATE folders SET sys_prompt = ?, updated_at = ? WHERE id = ?",
                params![
                    normalize_prompt(sys_prompt),
                    now().timestamp_micros(),
                    id.to_string()
                ],
            )
            .map_err(storage_err("update folder prompt"))?;
        if changed == 0 {
            return Err(LlamachatError::NotFound(format!("folder {}", id)).into());
        }
        Ok(())
    }

    /// Move a folder under `new_parent`, or to the root
    ///
    /// # Errors
    ///
    /// Returns `FolderCycle` when `new_parent` is the folder itself or one of
    /// its descendants.
    pub fn move_folder(&self, id: Uuid, new_parent: Option<Uuid>) -> Result<()> {
        self.require_folder(id)?;

        if let Some(parent) = new_parent {
            let chain = self.ancestor_chain(parent)?;
            if chain.iter().any(|f| f.id == id) {
                return Err(LlamachatError::FolderCycle(format!(
                    "folder {} cannot be moved inside {}",
                    id, parent
                ))
                .into());
            }
        }

        let conn = self.connect()?;
        conn.execute(
            "UPDATE folders SET parent_id = ?, updated_at = ? WHERE id = ?",
            params![
                new_parent.map(|p| p.to_string()),
                now().timestamp_micros(),
                id.to_string()
            ],
        )
        .map_err(storage_err("move folder"))?;

        tracing::debug!(folder_id = %id, parent = ?new_parent, "Moved folder");
        Ok(())
    }

    /// Folder `id` followed by its ancestors up to the root
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` does not name a folder.
    pub fn ancestor_chain(&self, id: Uuid) -> Result<Vec<Folder>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(self.require_folder(id)?);

        while let Some(folder) = cursor {
            if !seen.insert(folder.id) {
                break;
            }
            cursor = match folder.parent_id {
                Some(parent) => self.folder(parent)?,
                None => None,
            };
            chain.push(folder);
        }

        Ok(chain)
    }

    /// Delete a folder
    ///
    /// Child folders and conversations are moved to the root.
    pub fn delete_folder(&self, id: Uuid) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn
            .execute("DELETE FROM folders WHERE id = ?", params![id.to_string()])
            .map_err(storage_err("delete folder"))?;
        Ok(changed > 0)
    }

    /// Resolve a folder from a full id or an id prefix
    pub fn resolve_folder(&self, id_or_prefix: &str) -> Result<Folder> {
        let ids = self.resolve_ids("folders", id_or_prefix)?;
        match ids.as_slice() {
            [id] => self.require_folder(*id),
            [] => Err(LlamachatError::NotFound(format!("folder {}", id_or_prefix)).into()),
            _ => Err(LlamachatError::NotFound(format!(
                "'{}' matches {} folders",
                id_or_prefix,
                ids.len()
            ))
            .into()),
        }
    }

    // ----------------------------------------------------------------------
    // Conversations
    // ----------------------------------------------------------------------

    /// Create an empty conversation in `folder_id`, or at the root
    pub fn create_conversation(&self, folder_id: Option<Uuid>) -> Result<Conversation> {
        if let Some(folder) = folder_id {
            self.require_folder(folder)?;
        }

        let created_at = now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            title: None,
            folder_id,
            created_at,
            last_message_at: created_at,
            updated_at: created_at,
        };

        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO conversations (id, title, folder_id, created_at, last_message_at, updated_at)
             VALUES (?, NULL, ?, ?, ?, ?)",
            params![
                conversation.id.to_string(),
                folder_id.map(|f| f.to_string()),
                created_at.timestamp_micros(),
                created_at.timestamp_micros(),
                created_at.timestamp_micros()
            ],
        )
        .map_err(storage_err("insert conversation"))?;

        tracing::debug!(conversation_id = %conversation.id, "Created conversation");
        Ok(conversation)
    }

    /// Load a conversation by id
    pub fn conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let conn = self.connect()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM conversations WHERE id = ?",
                CONVERSATION_COLUMNS
            ),
            params![id.to_string()],
            conversation_from_row,
        )
        .optional()
        .map_err(|e| storage_err("query conversation")(e).into())
    }

    fn require_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.conversation(id)?
            .ok_or_else(|| LlamachatError::NotFound(format!("conversation {}", id)).into())
    }

    /// Conversations without a folder, newest activity first
    pub fn root_conversations(&self) -> Result<Vec<Conversation>> {
        self.query_conversations(
            &format!(
                "SELECT {} FROM conversations WHERE folder_id IS NULL
                 ORDER BY last_message_at DESC, created_at DESC",
                CONVERSATION_COLUMNS
            ),
            None,
        )
    }

    /// Conversations directly inside a folder, newest activity first
    pub fn folder_conversations(&self, folder_id: Uuid) -> Result<Vec<Conversation>> {
        self.query_conversations(
            &format!(
                "SELECT {} FROM conversations WHERE folder_id = ?
                 ORDER BY last_message_at DESC, created_at DESC",
                CONVERSATION_COLUMNS
            ),
            Some(folder_id),
        )
    }

    /// Conversations in a folder and all of its descendants, newest activity first
    pub fn all_conversations(&self, folder_id: Uuid) -> Result<Vec<Conversation>> {
        self.query_conversations(
            &format!(
                "WITH RECURSIVE tree(id) AS (
                     SELECT ?1
                     UNION
                     SELECT f.id FROM folders f JOIN tree t ON f.parent_id = t.id
                 )
                 SELECT {} FROM conversations
                 WHERE folder_id IN (SELECT id FROM tree)
                 ORDER BY last_message_at DESC, created_at DESC",
                CONVERSATION_COLUMNS
            ),
            Some(folder_id),
        )
    }

    /// Every conversation, newest activity first
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.query_conversations(
            &format!(
                "SELECT {} FROM conversations ORDER BY last_message_at DESC, created_at DESC",
                CONVERSATION_COLUMNS
            ),
            None,
        )
    }

    /// Conversations that have no messages
    pub fn draft_conversations(&self) -> Result<Vec<Conversation>> {
        self.query_conversations(
            "SELECT c.id, c.title, c.folder_id, c.created_at, c.last_message_at, c.updated_at
             FROM conversations c
             WHERE NOT EXISTS (SELECT 1 FROM messages m WHERE m.conversation_id = c.id)
             ORDER BY c.created_at",
            None,
        )
    }

    fn query_conversations(&self, sql: &str, arg: Option<Uuid>) -> Result<Vec<Conversation>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(sql).map_err(storage_err("prepare statement"))?;
        let rows = match arg {
            Some(id) => stmt.query_map(params![id.to_string()], conversation_from_row),
            None => stmt.query_map([], conversation_from_row),
        }
        .map_err(storage_err("query conversations"))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage_err("read conversation row")(e).into())
    }

    /// Move a conversation into `folder_id`, or to the root
    pub fn set_conversation_folder(&self, id: Uuid, folder_id: Option<Uuid>) -> Result<()> {
        if let Some(folder) = folder_id {
            self.require_folder(folder)?;
        }

        let conn = self.connect()?;
        let changed = conn
            .execute(
                "UPDATE conversations SET folder_id = ?, updated_at = ? WHERE id = ?",
                params![
                    folder_id.map(|f| f.to_string()),
                    now().timestamp_micros(),
                    id.to_string()
                ],
            )
            .map_err(storage_err("move conversation"))?;
        if changed == 0 {
            return Err(LlamachatError::NotFound(format!("conversation {}", id)).into());
        }
        Ok(())
    }

    /// Set or clear the explicit title
    pub fn set_conversation_title(&self, id: Uuid, title: Option<&str>) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn
            .execute(
                "UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?",
                params![title, now().timestamp_micros(), id.to_string()],
            )
            .map_err(storage_err("update conversation title"))?;
        if changed == 0 {
            return Err(LlamachatError::NotFound(format!("conversation {}", id)).into());
        }
        Ok(())
    }

    /// Delete a conversation together with its messages
    pub fn delete_conversation(&self, id: Uuid) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn
            .execute(
                "DELETE FROM conversations WHERE id = ?",
                params![id.to_string()],
            )
            .map_err(storage_err("delete conversation"))?;
        Ok(changed > 0)
    }

    /// Display title, derived from the earliest message when no title is set
    pub fn conversation_title(&self, id: Uuid) -> Result<String> {
        let conversation = self.require_conversation(id)?;
        if conversation.title.is_some() {
            return Ok(conversation.title_with_default(None));
        }
        let earliest = self.earliest_message(id)?;
        Ok(conversation.title_with_default(earliest.as_ref()))
    }

    /// System prompt for a conversation from the nearest folder override
    ///
    /// Walks from the conversation's folder towards the root and returns the
    /// first non-empty `sys_prompt`. Root conversations have none.
    pub fn effective_system_prompt(&self, conversation_id: Uuid) -> Result<Option<String>> {
        let conversation = self.require_conversation(conversation_id)?;
        let Some(folder_id) = conversation.folder_id else {
            return Ok(None);
        };

        Ok(self
            .ancestor_chain(folder_id)?
            .into_iter()
            .find_map(|folder| normalize_prompt(folder.sys_prompt.as_deref())))
    }

    /// Resolve a conversation from a full id or an id prefix
    pub fn resolve_conversation(&self, id_or_prefix: &str) -> Result<Conversation> {
        let ids = self.resolve_ids("conversations", id_or_prefix)?;
        match ids.as_slice() {
            [id] => self.require_conversation(*id),
            [] => Err(
                LlamachatError::NotFound(format!("conversation {}", id_or_prefix)).into(),
            ),
            _ => Err(LlamachatError::NotFound(format!(
                "'{}' matches {} conversations",
                id_or_prefix,
                ids.len()
            ))
            .into()),
        }
    }

    fn resolve_ids(&self, table: &'static str, id_or_prefix: &str) -> Result<Vec<Uuid>> {
        let conn = self.connect()?;
        // Full UUIDs match exactly, anything shorter is treated as a prefix
        let (sql, arg) = if id_or_prefix.len() == 36 {
            (
                format!("SELECT id FROM {} WHERE id = ?", table),
                id_or_prefix.to_string(),
            )
        } else {
            (
                format!(
                    "SELECT id FROM {} WHERE id LIKE ? ESCAPE '\\' LIMIT 2",
                    table
                ),
                format!("{}%", escape_like(id_or_prefix)),
            )
        };

        let mut stmt = conn.prepare(&sql).map_err(storage_err("prepare statement"))?;
        let rows = stmt
            .query_map(params![arg], |row| uuid_at(row, 0))
            .map_err(storage_err("resolve id"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage_err("read id row")(e).into())
    }

    /// Top-level folders and conversations
    pub fn fetch_root_items(&self) -> Result<RootItems> {
        Ok(RootItems {
            folders: self.root_folders()?,
            conversations: self.root_conversations()?,
        })
    }

    // ----------------------------------------------------------------------
    // Messages
    // ----------------------------------------------------------------------

    /// Attach a message to its conversation
    ///
    /// Advances the conversation's `last_message_at` to the message's
    /// `created_at` when that is later; it never moves backwards.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let conversation_id = message.conversation_id.ok_or_else(|| {
            LlamachatError::Storage(format!(
                "message {} is not attached to a conversation",
                message.id
            ))
        })?;

        let mut conn = self.connect()?;
        let tx = conn
            .transaction()
            .map_err(storage_err("start transaction"))?;

        let touched = tx
            .execute(
                "UPDATE conversations
                 SET last_message_at = MAX(last_message_at, ?1), updated_at = ?2
                 WHERE id = ?3",
                params![
                    message.created_at.timestamp_micros(),
                    now().timestamp_micros(),
                    conversation_id.to_string()
                ],
            )
            .map_err(storage_err("update conversation"))?;
        if touched == 0 {
            return Err(
                LlamachatError::NotFound(format!("conversation {}", conversation_id)).into(),
            );
        }

        tx.execute(
            &format!(
                "INSERT INTO messages ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                MESSAGE_COLUMNS
            ),
            params![
                message.id.to_string(),
                conversation_id.to_string(),
                message.from_id,
                message.text,
                message.created_at.timestamp_micros(),
                message.updated_at.timestamp_micros(),
                message.system_prompt,
                message.predicted_per_second,
                message.response_start_seconds,
                message.n_predicted,
                message.model_name
            ],
        )
        .map_err(storage_err("insert message"))?;

        tx.commit().map_err(storage_err("commit transaction"))?;
        Ok(())
    }

    /// Create and attach a message stamped with the current time
    pub fn append_message(
        &self,
        conversation_id: Uuid,
        from_id: &str,
        text: &str,
        system_prompt: Option<String>,
    ) -> Result<Message> {
        let mut message = Message::new(from_id, text).with_system_prompt(system_prompt);
        message.conversation_id = Some(conversation_id);
        self.insert_message(&message)?;
        Ok(message)
    }

    /// Persist a message's text and generation statistics
    ///
    /// Returns `false` when the message is not in the store.
    pub fn update_message(&self, message: &Message) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn
            .execute(
                "UPDATE messages SET
                    text = ?,
                    updated_at = ?,
                    predicted_per_second = ?,
                    response_start_seconds = ?,
                    n_predicted = ?,
                    model_name = ?
                 WHERE id = ?",
                params![
                    message.text,
                    message.updated_at.timestamp_micros(),
                    message.predicted_per_second,
                    message.response_start_seconds,
                    message.n_predicted,
                    message.model_name,
                    message.id.to_string()
                ],
            )
            .map_err(storage_err("update message"))?;
        Ok(changed > 0)
    }

    /// Remove a message
    pub fn delete_message(&self, id: Uuid) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn
            .execute("DELETE FROM messages WHERE id = ?", params![id.to_string()])
            .map_err(storage_err("delete message"))?;
        Ok(changed > 0)
    }

    /// Load a message by id
    pub fn message(&self, id: Uuid) -> Result<Option<Message>> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS),
            params![id.to_string()],
            message_from_row,
        )
        .optional()
        .map_err(|e| storage_err("query message")(e).into())
    }

    /// Messages of a conversation in transcript order
    ///
    /// Ordered by `created_at`; messages sharing a timestamp keep insertion order.
    pub fn ordered_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM messages WHERE conversation_id = ?
                 ORDER BY created_at ASC, seq ASC",
                MESSAGE_COLUMNS
            ))
            .map_err(storage_err("prepare statement"))?;
        let rows = stmt
            .query_map(params![conversation_id.to_string()], message_from_row)
            .map_err(storage_err("query messages"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage_err("read message row")(e).into())
    }

    /// First message in transcript order
    pub fn earliest_message(&self, conversation_id: Uuid) -> Result<Option<Message>> {
        let conn = self.connect()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM messages WHERE conversation_id = ?
                 ORDER BY created_at ASC, seq ASC LIMIT 1",
                MESSAGE_COLUMNS
            ),
            params![conversation_id.to_string()],
            message_from_row,
        )
        .optional()
        .map_err(|e| storage_err("query earliest message")(e).into())
    }

    /// Number of messages in a conversation
    pub fn message_count(&self, conversation_id: Uuid) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?",
                params![conversation_id.to_string()],
                |row| row.get(0),
            )
            .map_err(storage_err("count messages"))?;
        Ok(count as usize)
    }
}
