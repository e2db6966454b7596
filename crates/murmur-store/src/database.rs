use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use murmur_core::records::{record_id, Record};

use crate::blobs::BlobStore;
use crate::error::StoreError;
use crate::messages::MessageLog;
use crate::records::{CollectionSpec, RecordStore};

/// All durable state under one data directory.
///
/// Cheap to clone; every clone shares the same stores and locks.
#[derive(Clone)]
pub struct Database {
    users: Arc<RecordStore>,
    devices: Arc<RecordStore>,
    conversations: Arc<RecordStore>,
    permissions: Arc<RecordStore>,
    messages: Arc<MessageLog>,
    blobs: Arc<BlobStore>,
    dir: PathBuf,
}

impl Database {
    /// Open or create the data directory and its collection files.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("create dir {}: {e}", dir.display())))?;

        let db = Self {
            users: Arc::new(RecordStore::open(dir, CollectionSpec::users())?),
            devices: Arc::new(RecordStore::open(dir, CollectionSpec::devices())?),
            conversations: Arc::new(RecordStore::open(dir, CollectionSpec::conversations())?),
            permissions: Arc::new(RecordStore::open(
                dir,
                CollectionSpec::conversation_permissions(),
            )?),
            messages: Arc::new(MessageLog::new(dir)),
            blobs: Arc::new(BlobStore::open(&dir.join("blobs"))?),
            dir: dir.to_owned(),
        };

        info!(path = %dir.display(), "data directory opened");
        Ok(db)
    }

    pub fn users(&self) -> &RecordStore {
        &self.users
    }

    pub fn devices(&self) -> &RecordStore {
        &self.devices
    }

    pub fn conversations(&self) -> &RecordStore {
        &self.conversations
    }

    pub fn permissions(&self) -> &RecordStore {
        &self.permissions
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Register a conversation: start its message log, then store the
    /// conversation and its key permissions. A duplicate log is rejected
    /// before any record is written; if the conversation record is
    /// rejected the new log is removed again.
    pub fn create_conversation(
        &self,
        conversation: Record,
        permissions: Vec<Record>,
    ) -> Result<Record, StoreError> {
        let id = match record_id(&conversation) {
            Some(Value::String(id)) => id.clone(),
            _ => {
                return Err(StoreError::InvalidKey(
                    "conversation requires a string id".into(),
                ))
            }
        };

        self.messages.create_log(&id)?;
        let stored = match self.conversations.append(conversation) {
            Ok(stored) => stored,
            Err(e) => {
                if let Err(cleanup) = self.messages.discard_log(&id) {
                    warn!(conversation_id = %id, error = %cleanup, "failed to discard message log");
                }
                return Err(e);
            }
        };
        for permission in permissions {
            self.permissions.append(permission)?;
        }
        Ok(stored)
    }

    /// Resolve a conversation key id to the conversation it encrypts.
    pub fn conversation_for_key(&self, conversation_key_id: &str) -> Result<String, StoreError> {
        let permission = self
            .permissions
            .find_by("conversationKeyId", &Value::from(conversation_key_id))?
            .ok_or_else(|| {
                StoreError::NotFound(format!("conversation key {conversation_key_id}"))
            })?;
        permission
            .get("conversationId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "conversation for key {conversation_key_id}"
                ))
            })
    }
}
