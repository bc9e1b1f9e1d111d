use async_trait::async_trait;
use log::{ debug, warn };
use std::collections::VecDeque;
use std::fs::File;
use std::io::{ BufRead, BufReader, ErrorKind, Lines };
use std::path::{ Path, PathBuf };
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ HistoryStore, StoreError };
use crate::models::chat::{ decode_line, encode_turn, Message };

/// Stores each turn as one JSON array per line.
pub struct JsonlHistoryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlHistoryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a fresh lazy reader over the file. Calling it again restarts
    /// from the first line.
    pub fn messages(&self) -> Result<MessageReader<BufReader<File>>, StoreError> {
        match File::open(&self.path) {
            Ok(file) => Ok(MessageReader::new(BufReader::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(MessageReader::empty()),
            Err(source) =>
                Err(StoreError::Open {
                    path: self.path.display().to_string(),
                    source,
                }),
        }
    }
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, turn: &[Message]) -> Result<(), StoreError> {
        let mut line = encode_turn(turn)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions
            ::new()
            .create(true)
            .append(true)
            .open(&self.path).await
            .map_err(|source| StoreError::Open {
                path: self.path.display().to_string(),
                source,
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!("Appended {} message(s) to {}", turn.len(), self.path.display());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Message>, StoreError> {
        let mut reader = self.messages()?;
        let path = self.path.display().to_string();
        let messages = tokio::task::spawn_blocking(move || {
            let messages: Vec<Message> = reader.by_ref().collect();
            if reader.skipped() > 0 {
                warn!("Skipped {} malformed history entries in {}", reader.skipped(), path);
            }
            messages
        }).await?;
        Ok(messages)
    }
}

/// Lazy iterator over persisted messages in file order.
pub struct MessageReader<R> {
    lines: Option<Lines<R>>,
    pending: VecDeque<Message>,
    line_no: usize,
    skipped: usize,
}

impl<R: BufRead> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: Some(reader.lines()),
            pending: VecDeque::new(),
            line_no: 0,
            skipped: 0,
        }
    }

    pub fn empty() -> Self {
        Self {
            lines: None,
            pending: VecDeque::new(),
            line_no: 0,
            skipped: 0,
        }
    }

    /// Lines and elements dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn queue_line(&mut self, line: &str) {
        match decode_line(line) {
            Ok(entries) => {
                for (index, entry) in entries.into_iter().enumerate() {
                    match entry {
                        Ok(message) => self.pending.push_back(message),
                        Err(e) => {
                            warn!("Error parsing message {} on line {}: {}", index, self.line_no, e);
                            self.skipped += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Error parsing history line {}: {}", self.line_no, e);
                self.skipped += 1;
            }
        }
    }
}

impl<R: BufRead> Iterator for MessageReader<R> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            let next_line = self.lines.as_mut()?.next();
            let line = match next_line {
                Some(Ok(line)) => line,
                Some(Err(e)) if e.kind() == ErrorKind::InvalidData => {
                    self.line_no += 1;
                    warn!("History line {} is not UTF-8: {}", self.line_no, e);
                    self.skipped += 1;
                    continue;
                }
                Some(Err(e)) => {
                    warn!("Stopped reading history after line {}: {}", self.line_no, e);
                    self.lines = None;
                    return None;
                }
                None => {
                    self.lines = None;
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            self.queue_line(&line);
        }
    }
}
