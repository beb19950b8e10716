use serde::{Deserialize, Serialize};

use super::message::{Message, Role};

/// Ordered chat history. Insertion order is display order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    /// Swap in new content for the last message, returning the old content.
    pub fn replace_last_content(&mut self, content: String) -> Option<String> {
        self.messages
            .last_mut()
            .map(|last| std::mem::replace(&mut last.content, content))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn latest_timestamp(&self) -> Option<i64> {
        self.messages.iter().map(|m| m.timestamp).max()
    }

    pub fn user_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role == Role::User)
    }
}
