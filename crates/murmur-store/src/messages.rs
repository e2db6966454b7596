//! Per-conversation append-only message logs with optimistic appends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use murmur_core::messages::{timestamp_now, Message, MessageDraft};

use crate::error::StoreError;
use crate::json_file;
use crate::keys;

/// One ordered log per conversation, stored as `messages_<id>.json`.
///
/// Each conversation is its own serialization domain. A lock exists only
/// for logs that exist on disk; lookups of unknown ids never add one.
pub struct MessageLog {
    dir: PathBuf,
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl MessageLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_owned(),
            locks: DashMap::new(),
        }
    }

    /// Start an empty log. Fails with `Conflict` if one already exists.
    #[instrument(skip(self))]
    pub fn create_log(&self, conversation_id: &str) -> Result<(), StoreError> {
        let path = self.log_path(conversation_id)?;
        let lock = self.insert_lock(conversation_id);
        let _guard = lock.write();

        if path.exists() {
            return Err(StoreError::Conflict(format!(
                "message log for conversation {conversation_id} already exists"
            )));
        }
        if let Err(e) = json_file::write_atomic(&path, &Vec::<Message>::new()) {
            self.locks.remove(conversation_id);
            return Err(e);
        }
        debug!("message log created");
        Ok(())
    }

    /// Delete a log and forget its lock.
    #[instrument(skip(self))]
    pub fn discard_log(&self, conversation_id: &str) -> Result<(), StoreError> {
        let path = self.log_path(conversation_id)?;
        let lock = self.lock_for(conversation_id, &path)?;
        let _guard = lock.write();
        std::fs::remove_file(&path)?;
        self.locks.remove(conversation_id);
        debug!("message log discarded");
        Ok(())
    }

    pub fn exists(&self, conversation_id: &str) -> Result<bool, StoreError> {
        Ok(self.log_path(conversation_id)?.exists())
    }

    pub fn all_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let path = self.log_path(conversation_id)?;
        let lock = self.lock_for(conversation_id, &path)?;
        let _guard = lock.read();
        Self::load(&path, conversation_id)
    }

    pub fn latest(&self, conversation_id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self.all_messages(conversation_id)?.pop())
    }

    /// Compare-and-append.
    ///
    /// The draft's `context.previousMessageId` must equal the current tail id
    /// (0 for an empty log). On success the message gets `tail + 1` and a
    /// fresh `timeSent`; on mismatch nothing is written.
    #[instrument(skip(self, draft), fields(expected = ?draft.expected_previous_id()))]
    pub fn append(&self, conversation_id: &str, draft: MessageDraft) -> Result<Message, StoreError> {
        let path = self.log_path(conversation_id)?;
        let lock = self.lock_for(conversation_id, &path)?;
        let _guard = lock.write();

        let mut log = Self::load(&path, conversation_id)?;
        let tail = log.last().map(|m| m.id).unwrap_or(0);
        let actual = draft.expected_previous_id();
        if actual != Some(tail) {
            warn!(tail, ?actual, "rejecting stale append");
            return Err(StoreError::StaleWrite {
                expected: tail,
                actual,
            });
        }

        let message = draft.into_message(tail + 1, timestamp_now());
        log.push(message.clone());
        json_file::write_atomic(&path, &log)?;
        debug!(id = message.id, "message appended");
        Ok(message)
    }

    fn load(path: &Path, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        if !path.exists() {
            return Err(log_not_found(conversation_id));
        }
        json_file::read_array(path)
    }

    /// Lock of an existing log.
    fn lock_for(&self, conversation_id: &str, path: &Path) -> Result<Arc<RwLock<()>>, StoreError> {
        if let Some(lock) = self.locks.get(conversation_id) {
            return Ok(Arc::clone(lock.value()));
        }
        if !path.exists() {
            return Err(log_not_found(conversation_id));
        }
        Ok(self.insert_lock(conversation_id))
    }

    fn insert_lock(&self, conversation_id: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn log_path(&self, conversation_id: &str) -> Result<PathBuf, StoreError> {
        validate_conversation_id(conversation_id)?;
        Ok(self.dir.join(format!("messages_{conversation_id}.json")))
    }
}

fn log_not_found(conversation_id: &str) -> StoreError {
    StoreError::NotFound(format!("message log for conversation {conversation_id}"))
}

/// Conversation ids become part of a file name.
pub fn validate_conversation_id(id: &str) -> Result<(), StoreError> {
    keys::validate_key("conversation id", id)
}
