use super::{format_timestamp, open_store, short_id};
use crate::cli::HistoryCommand;
use crate::config::Config;
use crate::error::Result;
use crate::storage::SqliteStorage;
use chrono::{DateTime, Utc};
use colored::Colorize;
use prettytable::{format, Table};
use serde::Serialize;
use uuid::Uuid;

/// One row of the conversation listing
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    /// Conversation id
    pub id: Uuid,
    /// Explicit or derived title
    pub title: String,
    /// Containing folder, if any
    pub folder_id: Option<Uuid>,
    /// Name of the containing folder
    pub folder_name: Option<String>,
    /// Number of messages
    pub message_count: usize,
    /// Time of the latest message
    pub last_message_at: DateTime<Utc>,
}

/// Summaries of every conversation, newest activity first
pub fn conversation_summaries(store: &SqliteStorage) -> Result<Vec<ConversationSummary>> {
    store
        .list_conversations()?
        .into_iter()
        .map(|conversation| -> Result<ConversationSummary> {
            let folder_name = match conversation.folder_id {
                Some(folder_id) => store.folder(folder_id)?.map(|f| f.name),
                None => None,
            };
            Ok(ConversationSummary {
                id: conversation.id,
                title: store.conversation_title(conversation.id)?,
                folder_id: conversation.folder_id,
                folder_name,
                message_count: store.message_count(conversation.id)?,
                last_message_at: conversation.last_message_at,
            })
        })
        .collect()
}

fn truncate_title(title: &str) -> String {
    if title.chars().count() > 40 {
        format!("{}...", title.chars().take(37).collect::<String>())
    } else {
        title.to_string()
    }
}

/// Handle history commands
pub fn handle_history(config: &Config, command: HistoryCommand) -> Result<()> {
    let storage = open_store(config)?;

    match command {
        HistoryCommand::List { json } => {
            let summaries = conversation_summaries(&storage)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
                return Ok(());
            }

            if summaries.is_empty() {
                println!("{}", "No conversation history found.".yellow());
                return Ok(());
            }

            let mut table = Table::new();
            table.set_format(*format::consts::FORMAT_BORDERS_ONLY);

            table.add_row(prettytable::row![
                "ID".bold(),
                "Title".bold(),
                "Folder".bold(),
                "Messages".bold(),
                "Last Message".bold()
            ]);

            for summary in summaries {
                table.add_row(prettytable::row![
                    short_id(&summary.id).cyan(),
                    truncate_title(&summary.title),
                    summary.folder_name.unwrap_or_else(|| "-".to_string()),
                    summary.message_count,
                    format_timestamp(&summary.last_message_at)
                ]);
            }

            println!("\nConversation History:");
            table.printstd();
            println!();
            println!(
                "Use {} to resume a conversation.",
                "llamachat chat --conversation <ID>".cyan()
            );
            println!();
        }
        HistoryCommand::Show { id } => {
            let conversation = storage.resolve_conversation(&id)?;
            println!(
                "{}\n",
                storage.conversation_title(conversation.id)?.bold().underline()
            );
            for message in storage.ordered_messages(conversation.id)? {
                let speaker = format!("{}>", message.from_id);
                let speaker = if message.is_from_user() {
                    speaker.green().bold()
                } else {
                    speaker.blue().bold()
                };
                println!("{} {}", speaker, message.text);
            }
        }
        HistoryCommand::Delete { id } => {
            let conversation = storage.resolve_conversation(&id)?;
            storage.delete_conversation(conversation.id)?;
            println!(
                "{}",
                format!("Deleted conversation {}", conversation.id).green()
            );
        }
        HistoryCommand::Move { id, folder } => {
            let conversation = storage.resolve_conversation(&id)?;
            let target = folder
                .map(|f| storage.resolve_folder(&f))
                .transpose()?;
            storage.set_conversation_folder(conversation.id, target.as_ref().map(|f| f.id))?;
            let destination = target.map(|f| f.name).unwrap_or_else(|| "root".to_string());
            println!(
                "{}",
                format!("Moved conversation {} to {}", short_id(&conversation.id), destination)
                    .green()
            );
        }
        HistoryCommand::Title { id, title } => {
            let conversation = storage.resolve_conversation(&id)?;
            let title = title.trim();
            let title = (!title.is_empty()).then_some(title);
            storage.set_conversation_title(conversation.id, title)?;
            println!(
                "{}",
                format!("Title: {}", storage.conversation_title(conversation.id)?).green()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_storage;

    #[test]
    fn test_summaries_include_folder_and_counts() {
        let (store, _dir) = temp_storage();
        let folder = store.create_folder("Recipes", None).unwrap();
        let filed = store.create_conversation(Some(folder.id)).unwrap();
        store
            .append_message(filed.id, "user", "How do I bake bread?", None)
            .unwrap();
        store
            .append_message(filed.id, "Llama", "Start with flour.", None)
            .unwrap();
        let loose = store.create_conversation(None).unwrap();

        let summaries = conversation_summaries(&store).unwrap();
        assert_eq!(summaries.len(), 2);

        let filed_summary = summaries.iter().find(|s| s.id == filed.id).unwrap();
        assert_eq!(filed_summary.title, "How do I bake bread?");
        assert_eq!(filed_summary.folder_name.as_deref(), Some("Recipes"));
        assert_eq!(filed_summary.message_count, 2);

        let loose_summary = summaries.iter().find(|s| s.id == loose.id).unwrap();
        assert_eq!(loose_summary.message_count, 0);
        assert!(loose_summary.folder_name.is_none());
    }

    #[test]
    fn test_truncate_title() {
        assert_eq!(truncate_title("short"), "short");
        let long = "x".repeat(50);
        let truncated = truncate_title(&long);
        assert_eq!(truncated.chars().count(), 40);
        assert!(truncated.ends_with("..."));
    }
}
