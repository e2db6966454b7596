//! Backward cursor pagination over a conversation's message log.

use serde::{Deserialize, Serialize};

use murmur_core::Message;
use murmur_store::{MessageLog, StoreError};

pub const PAGE_SIZE: usize = 25;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub next_cursor: Option<String>,
}

/// One page of history, newest message first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub objects: Vec<Message>,
    pub meta: PageMeta,
}

pub struct HistoryPager<'a> {
    log: &'a MessageLog,
    page_size: usize,
}

impl<'a> HistoryPager<'a> {
    pub fn new(log: &'a MessageLog) -> Self {
        Self {
            log,
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The newest `page_size` messages with an id below `cursor` (or the
    /// newest overall). `nextCursor` is the oldest returned id while older
    /// messages remain.
    pub fn page(&self, conversation_id: &str, cursor: Option<i64>) -> Result<Page, StoreError> {
        let mut candidates = self.log.all_messages(conversation_id)?;
        if let Some(cursor) = cursor {
            candidates.retain(|m| m.id < cursor);
        }

        let start = candidates.len().saturating_sub(self.page_size);
        let mut objects = candidates.split_off(start);
        let next_cursor = if candidates.is_empty() {
            None
        } else {
            objects.first().map(|m| m.id.to_string())
        };
        objects.reverse();

        Ok(Page {
            objects,
            meta: PageMeta { next_cursor },
        })
    }
}
