//! Folder management commands

use super::{open_store, short_id};
use crate::cli::FolderCommand;
use crate::config::Config;
use crate::error::Result;
use crate::manager::DEFAULT_FOLDER_NAME;
use crate::storage::{Folder, SqliteStorage};
use colored::Colorize;
use serde::Serialize;
use uuid::Uuid;

/// A folder with its subtree
#[derive(Debug, Clone, Serialize)]
pub struct FolderNode {
    /// Folder id
    pub id: Uuid,
    /// Folder name
    pub name: String,
    /// System prompt override
    pub sys_prompt: Option<String>,
    /// Conversations directly inside the folder
    pub conversations: usize,
    /// Child folders, sorted by name
    pub children: Vec<FolderNode>,
}

fn build_node(store: &SqliteStorage, folder: Folder) -> Result<FolderNode> {
    let children = store
        .subfolders(folder.id)?
        .into_iter()
        .map(|child| build_node(store, child))
        .collect::<Result<Vec<_>>>()?;

    Ok(FolderNode {
        conversations: store.folder_conversations(folder.id)?.len(),
        id: folder.id,
        name: folder.name,
        sys_prompt: folder.sys_prompt,
        children,
    })
}

/// The whole folder forest, rooted at the top-level folders
pub fn folder_tree(store: &SqliteStorage) -> Result<Vec<FolderNode>> {
    store
        .root_folders()?
        .into_iter()
        .map(|folder| build_node(store, folder))
        .collect()
}

fn print_node(node: &FolderNode, depth: usize) {
    let marker = if node.sys_prompt.is_some() { " *" } else { "" };
    println!(
        "{}{} {}/{} ({} conversations)",
        "  ".repeat(depth),
        short_id(&node.id).cyan(),
        node.name.bold(),
        marker.yellow(),
        node.conversations
    );
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

/// Handle folder commands
pub fn handle_folder(config: &Config, command: FolderCommand) -> Result<()> {
    let storage = open_store(config)?;

    match command {
        FolderCommand::List { json } => {
            let tree = folder_tree(&storage)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tree)?);
                return Ok(());
            }
            if tree.is_empty() {
                println!("{}", "No folders found.".yellow());
                return Ok(());
            }
            println!("\nFolders ({} marks a system prompt):", "*".yellow());
            for node in &tree {
                print_node(node, 1);
            }
            println!();
        }
        FolderCommand::New { name, parent } => {
            let parent = parent.map(|p| storage.resolve_folder(&p)).transpose()?;
            let name = name.as_deref().unwrap_or(DEFAULT_FOLDER_NAME);
            let folder = storage.create_folder(name, parent.map(|p| p.id))?;
            println!(
                "{}",
                format!("Created folder {} ({})", folder.name, folder.id).green()
            );
        }
        FolderCommand::Rename { id, name } => {
            let folder = storage.resolve_folder(&id)?;
            storage.rename_folder(folder.id, &name)?;
            println!("{}", format!("Renamed {} to {}", folder.name, name).green());
        }
        FolderCommand::Move { id, parent } => {
            let folder = storage.resolve_folder(&id)?;
            let target = parent.map(|p| storage.resolve_folder(&p)).transpose()?;
            storage.move_folder(folder.id, target.as_ref().map(|t| t.id))?;
            let destination = target.map(|t| t.name).unwrap_or_else(|| "root".to_string());
            println!(
                "{}",
                format!("Moved folder {} to {}", folder.name, destination).green()
            );
        }
        FolderCommand::Prompt { id, text } => {
            let folder = storage.resolve_folder(&id)?;
            match text {
                None => match folder.sys_prompt {
                    Some(prompt) => println!("{}", prompt),
                    None => println!("{}", "No system prompt set.".yellow()),
                },
                Some(text) => {
                    storage.set_folder_sys_prompt(folder.id, Some(&text))?;
                    let message = if text.trim().is_empty() {
                        format!("Cleared system prompt of {}", folder.name)
                    } else {
                        format!("Updated system prompt of {}", folder.name)
                    };
                    println!("{}", message.green());
                }
            }
        }
        FolderCommand::Delete { id } => {
            let folder = storage.resolve_folder(&id)?;
            storage.delete_folder(folder.id)?;
            println!(
                "{}",
                format!("Deleted folder {}; its contents moved to the root", folder.name).green()
            );
        }
    }

    Ok(())
}
