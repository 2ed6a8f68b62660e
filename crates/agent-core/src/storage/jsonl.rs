use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::agent::{ChatEvent, Conversation};
use crate::storage::{persistable, ConversationRepository};

/// One `<id>.json` document per conversation plus an append-only
/// `<id>.jsonl` event log next to it.
#[derive(Debug, Clone)]
pub struct JsonlStorage {
    base_path: PathBuf,
}

impl JsonlStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub async fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.base_path).await
    }

    pub async fn save_conversation(&self, conversation: &Conversation) -> io::Result<()> {
        let path = self.conversation_path(&conversation.id);
        let json = serde_json::to_string(&persistable(conversation))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).await?;
        fs::rename(tmp_path, path).await
    }

    pub async fn load_conversation(&self, conversation_id: &str) -> io::Result<Option<Conversation>> {
        let path = self.conversation_path(conversation_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).await?;
        let conversation = serde_json::from_str(&content)?;
        Ok(Some(conversation))
    }

    pub async fn list_conversation_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(ids),
            Err(error) => return Err(error),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }

    pub async fn append_event(&self, conversation_id: &str, event: &ChatEvent) -> io::Result<()> {
        let path = self.events_path(conversation_id);
        let json = serde_json::to_string(event)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }

    pub async fn load_events(&self, conversation_id: &str) -> io::Result<Vec<ChatEvent>> {
        let path = self.events_path(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(error) => log::warn!("[{}] Skipping unreadable event: {}", conversation_id, error),
            }
        }

        Ok(events)
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> io::Result<bool> {
        let mut deleted_any = false;

        for path in [
            self.conversation_path(conversation_id),
            self.events_path(conversation_id),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => deleted_any = true,
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error),
            }
        }

        Ok(deleted_any)
    }

    fn conversation_path(&self, conversation_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", conversation_id))
    }

    fn events_path(&self, conversation_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", conversation_id))
    }
}

#[async_trait]
impl ConversationRepository for JsonlStorage {
    async fn create_conversation(&self, conversation: &Conversation) -> io::Result<()> {
        if self.conversation_path(&conversation.id).exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("conversation {} already exists", conversation.id),
            ));
        }
        self.save_conversation(conversation).await
    }

    async fn update_conversation(&self, conversation: &Conversation) -> io::Result<()> {
        self.save_conversation(conversation).await
    }

    async fn get_conversation(&self, conversation_id: &str) -> io::Result<Option<Conversation>> {
        self.load_conversation(conversation_id).await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> io::Result<bool> {
        JsonlStorage::delete_conversation(self, conversation_id).await
    }
}
