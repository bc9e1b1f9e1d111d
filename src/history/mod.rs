mod jsonl;
mod memory;

pub use jsonl::{ JsonlHistoryStore, MessageReader };
pub use memory::MemoryHistoryStore;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use thiserror::Error;
use crate::cli::Args;
use crate::models::chat::Message;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history file '{path}' could not be opened: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode turn: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("history reader task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("unsupported history store type: {0}")]
    UnsupportedType(String),
}

/// Append-only conversation storage. One `append` call is one turn.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, turn: &[Message]) -> Result<(), StoreError>;

    /// Every stored message in write order. Malformed entries are skipped.
    async fn load_all(&self) -> Result<Vec<Message>, StoreError>;
}

pub fn create_history_store(args: &Args) -> Result<Arc<dyn HistoryStore>, StoreError> {
    match args.history_type.to_lowercase().as_str() {
        "jsonl" | "file" => Ok(Arc::new(JsonlHistoryStore::new(&args.history_file))),
        "memory" => Ok(Arc::new(MemoryHistoryStore::default())),
        other => Err(StoreError::UnsupportedType(other.to_string())),
    }
}

pub fn initialize_history_store(args: &Args) -> Result<Arc<dyn HistoryStore>, StoreError> {
    info!("Chat history will be stored in: {} at {}", args.history_type, args.history_file);
    create_history_store(args)
}
