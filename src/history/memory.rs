use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ HistoryStore, StoreError };
use crate::models::chat::Message;

/// Keeps turns in process memory only.
#[derive(Default)]
pub struct MemoryHistoryStore {
    turns: Mutex<Vec<Vec<Message>>>,
}

impl MemoryHistoryStore {
    pub async fn turn_count(&self) -> usize {
        self.turns.lock().await.len()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, turn: &[Message]) -> Result<(), StoreError> {
        self.turns.lock().await.push(turn.to_vec());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Message>, StoreError> {
        Ok(self.turns.lock().await.iter().flatten().cloned().collect())
    }
}
