//! Session identity shared by every payload produced in one process lifetime.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// Generate a fresh identifier: `session-<unix millis>-<short uuid>`.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("session-{}-{}", Utc::now().timestamp_millis(), &uuid[..9]).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("session-"));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = SessionId::from("session-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"session-1\"");
    }
}
