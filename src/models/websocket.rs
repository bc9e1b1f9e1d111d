use serde::{ Serialize, Deserialize };

use crate::geo::MapView;

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "chat")] Chat {
        content: String,
    },
    #[serde(rename = "clear")]
    Clear,
}

/// One displayed line of history: `user` or `assistant`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub speaker: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "history")] History {
        messages: Vec<HistoryEntry>,
    },
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "partial")] Partial {
        content: String,
    },
    #[serde(rename = "notice")] Notice {
        message: String,
    },
    #[serde(rename = "map")] Map {
        view: MapView,
    },
    #[serde(rename = "done")] Done {
        content: String,
        timestamp: i64,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
}
