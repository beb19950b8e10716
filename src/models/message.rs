use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn is_user(&self) -> bool {
        matches!(self, Role::User)
    }
}

/// A single chat turn as it is persisted: `{"content", "isUser", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    #[serde(rename = "isUser", with = "role_flag")]
    pub role: Role,
    /// Milliseconds since the Unix epoch. Doubles as the rendering key.
    pub timestamp: i64,
}

/// A message before the history store has stamped it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub content: String,
    pub role: Role,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role: Role::User,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role: Role::Assistant,
        }
    }
}

mod role_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Role;

    pub fn serialize<S: Serializer>(role: &Role, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(role.is_user())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Role, D::Error> {
        let is_user = bool::deserialize(deserializer)?;
        Ok(if is_user { Role::User } else { Role::Assistant })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_field_names() {
        let msg = Message {
            content: "Hello".to_string(),
            role: Role::User,
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "content": "Hello",
                "isUser": true,
                "timestamp": 1_700_000_000_000_i64,
            })
        );
    }

    #[test]
    fn test_reads_history_written_by_older_clients() {
        let raw = r#"[{"content":"Hi","isUser":true,"timestamp":1722470400000},
                      {"content":"Hello! How can I help?","isUser":false,"timestamp":1722470400001}]"#;
        let messages: Vec<Message> = serde_json::from_str(raw).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hello! How can I help?");
    }
}
