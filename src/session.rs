use log::info;
use uuid::Uuid;

use crate::geo::MapView;
use crate::history::{ HistoryStore, StoreError };
use crate::models::chat::Message;
use crate::models::websocket::HistoryEntry;

/// State of one UI session. Created at session start and dropped at its end.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    messages: Vec<Message>,
    map: Option<MapView>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: Vec::new(),
            map: None,
        }
    }

    /// A session primed with everything the store holds.
    pub async fn hydrate(store: &dyn HistoryStore) -> Result<Self, StoreError> {
        let mut session = Self::new();
        session.messages = store.load_all().await?;
        info!("Session {} restored {} message(s)", session.id, session.messages.len());
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn extend(&mut self, turn: impl IntoIterator<Item = Message>) {
        self.messages.extend(turn);
    }

    /// Forgets the in-memory conversation. The store is untouched.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.map = None;
    }

    pub fn map(&self) -> Option<&MapView> {
        self.map.as_ref()
    }

    pub fn set_map(&mut self, map: Option<MapView>) {
        self.map = map;
    }

    /// User prompts and plain assistant answers, in order.
    pub fn transcript(&self) -> Vec<HistoryEntry> {
        self.messages
            .iter()
            .filter_map(|m| {
                match m {
                    Message::User { content, .. } =>
                        Some(HistoryEntry { speaker: "user".into(), content: content.clone() }),
                    Message::ModelText { content, .. } =>
                        Some(HistoryEntry { speaker: "assistant".into(), content: content.clone() }),
                    _ => None,
                }
            })
            .collect()
    }
}
