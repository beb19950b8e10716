use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use thiserror::Error;

use super::storage::{KeyValueStore, StorageError};
use crate::config::HISTORY_KEY;
use crate::models::{Conversation, Message, NewMessage};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to persist chat history: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to serialize chat history: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Hands out strictly increasing millisecond timestamps, so two messages
/// created within the same clock tick still get distinct keys.
#[derive(Debug, Default)]
struct MessageClock {
    last: i64,
}

impl MessageClock {
    fn seeded(last: i64) -> Self {
        Self { last }
    }

    fn next(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let stamp = now.max(self.last.saturating_add(1));
        self.last = stamp;
        stamp
    }
}

struct HistoryState {
    conversation: Conversation,
    clock: MessageClock,
}

/// The conversation plus its persisted copy. Every mutation writes the whole
/// conversation back to storage before returning, so what callers read here
/// always matches what is stored.
pub struct HistoryStore {
    storage: Arc<dyn KeyValueStore>,
    key: String,
    state: Mutex<HistoryState>,
}

impl HistoryStore {
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        Self::load_with_key(storage, HISTORY_KEY)
    }

    /// Rehydrate from `key`. Missing, unreadable or malformed data all yield
    /// an empty conversation.
    pub fn load_with_key(storage: Arc<dyn KeyValueStore>, key: &str) -> Self {
        let conversation = match storage.get(key) {
            Ok(Some(json)) => match serde_json::from_str::<Conversation>(&json) {
                Ok(conversation) => conversation,
                Err(e) => {
                    tracing::warn!("Failed to parse chat history, starting empty: {}", e);
                    Conversation::new()
                }
            },
            Ok(None) => Conversation::new(),
            Err(e) => {
                tracing::warn!("Failed to read chat history, starting empty: {}", e);
                Conversation::new()
            }
        };

        tracing::debug!("Loaded {} messages from history", conversation.len());

        let clock = MessageClock::seeded(conversation.latest_timestamp().unwrap_or(0));

        Self {
            storage,
            key: key.to_string(),
            state: Mutex::new(HistoryState {
                conversation,
                clock,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, conversation: &Conversation) -> Result<(), HistoryError> {
        let json = serde_json::to_string(conversation)?;
        self.storage.set(&self.key, &json)?;
        Ok(())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().conversation.messages().to_vec()
    }

    pub fn last(&self) -> Option<Message> {
        self.lock().conversation.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().conversation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().conversation.is_empty()
    }

    /// Earlier prompts, oldest first.
    pub fn user_prompts(&self) -> Vec<Message> {
        self.lock().conversation.user_messages().cloned().collect()
    }

    /// Stamp and append a message, then persist. On a failed write the
    /// message is dropped again and the error returned.
    pub fn append(&self, message: NewMessage) -> Result<Message, HistoryError> {
        let mut state = self.lock();
        let timestamp = state.clock.next();
        let message = Message {
            content: message.content,
            role: message.role,
            timestamp,
        };

        state.conversation.push(message.clone());
        if let Err(e) = self.persist(&state.conversation) {
            state.conversation.pop();
            return Err(e);
        }

        Ok(message)
    }

    /// Replace the content of the last message and persist. Returns `false`
    /// without touching storage when the conversation is empty.
    pub fn update_last(&self, content: &str) -> Result<bool, HistoryError> {
        let mut state = self.lock();
        let Some(previous) = state.conversation.replace_last_content(content.to_string()) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&state.conversation) {
            state.conversation.replace_last_content(previous);
            return Err(e);
        }

        Ok(true)
    }

    /// Drop every message and remove the stored entry entirely.
    pub fn clear(&self) -> Result<(), HistoryError> {
        let mut state = self.lock();
        self.storage.remove(&self.key)?;
        state.conversation.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::services::storage::MemoryStore;

    fn stored(storage: &MemoryStore) -> Option<Vec<Message>> {
        storage
            .get(HISTORY_KEY)
            .unwrap()
            .map(|json| serde_json::from_str(&json).unwrap())
    }

    fn new_store() -> (Arc<MemoryStore>, HistoryStore) {
        let storage = Arc::new(MemoryStore::new());
        let history = HistoryStore::load(storage.clone());
        (storage, history)
    }

    #[test]
    fn test_append_preserves_order_and_persists_each_call() {
        let (storage, history) = new_store();

        for i in 0..5 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            history
                .append(NewMessage {
                    content: format!("message {i}"),
                    role,
                })
                .unwrap();
            assert_eq!(stored(&storage).unwrap(), history.messages());
        }

        let contents: Vec<_> = history.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(
            contents,
            ["message 0", "message 1", "message 2", "message 3", "message 4"]
        );
    }

    #[test]
    fn test_update_last_on_empty_is_noop() {
        let (storage, history) = new_store();

        assert!(!history.update_last("anything").unwrap());
        assert!(history.is_empty());
        assert_eq!(storage.get(HISTORY_KEY).unwrap(), None);
    }

    #[test]
    fn test_update_last_touches_only_final_message() {
        let (storage, history) = new_store();
        let first = history.append(NewMessage::user("Hello")).unwrap();
        let second = history.append(NewMessage::assistant("")).unwrap();

        assert!(history.update_last("Hi there").unwrap());

        let messages = history.messages();
        assert_eq!(messages[0], first);
        assert_eq!(messages[1].content, "Hi there");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].timestamp, second.timestamp);
        assert_eq!(stored(&storage).unwrap(), messages);
    }

    #[test]
    fn test_clear_removes_stored_entry() {
        let (storage, history) = new_store();
        history.append(NewMessage::user("Hello")).unwrap();

        history.clear().unwrap();

        assert!(history.is_empty());
        assert_eq!(storage.get(HISTORY_KEY).unwrap(), None);
    }

    #[test]
    fn test_reload_round_trip() {
        let (storage, history) = new_store();
        let m1 = history.append(NewMessage::user("What is Rust?")).unwrap();
        let m2 = history
            .append(NewMessage::assistant("A systems language."))
            .unwrap();

        let reloaded = HistoryStore::load(storage);
        assert_eq!(reloaded.messages(), vec![m1, m2]);
    }

    #[test]
    fn test_malformed_history_loads_empty() {
        let storage = Arc::new(MemoryStore::new());
        storage.set(HISTORY_KEY, "{not json").unwrap();

        let history = HistoryStore::load(storage.clone());
        assert!(history.is_empty());

        // The store stays usable and overwrites the bad entry
        history.append(NewMessage::user("fresh start")).unwrap();
        assert_eq!(stored(&storage).unwrap().len(), 1);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let (_storage, history) = new_store();
        for _ in 0..50 {
            history.append(NewMessage::user("burst")).unwrap();
        }

        let stamps: Vec<_> = history.messages().iter().map(|m| m.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_clock_continues_after_reload() {
        let storage = Arc::new(MemoryStore::new());
        let future = Utc::now().timestamp_millis() + 60_000;
        let seeded = vec![Message {
            content: "from the future".to_string(),
            role: Role::User,
            timestamp: future,
        }];
        storage
            .set(HISTORY_KEY, &serde_json::to_string(&seeded).unwrap())
            .unwrap();

        let history = HistoryStore::load(storage);
        let next = history.append(NewMessage::assistant("reply")).unwrap();
        assert!(next.timestamp > future);
    }

    #[test]
    fn test_failed_writes_roll_back() {
        let storage = Arc::new(MemoryStore::with_quota(120));
        let history = HistoryStore::load(storage.clone());
        history.append(NewMessage::user("short")).unwrap();

        let long = "x".repeat(200);
        let err = history.append(NewMessage::user(long.clone())).unwrap_err();
        assert!(matches!(err, HistoryError::Storage(StorageError::QuotaExceeded { .. })));
        assert_eq!(history.len(), 1);

        assert!(history.update_last(&long).is_err());
        assert_eq!(history.last().unwrap().content, "short");
        assert_eq!(stored(&storage).unwrap(), history.messages());
    }

    #[test]
    fn test_user_prompts_skip_assistant_turns() {
        let (_storage, history) = new_store();
        history.append(NewMessage::user("first")).unwrap();
        history.append(NewMessage::assistant("reply")).unwrap();
        history.append(NewMessage::user("second")).unwrap();

        let prompts: Vec<_> = history
            .user_prompts()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(prompts, ["first", "second"]);
    }
}
