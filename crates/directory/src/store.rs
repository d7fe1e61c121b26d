//! Directory access seams

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{DirectoryEntry, ExtensionRecord};
use crate::DirectoryError;

/// What happened to a directory row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// A change-notification event
#[derive(Debug, Clone)]
pub struct DirectoryChange {
    pub action: ChangeAction,
    pub record: ExtensionRecord,
}

impl DirectoryChange {
    /// Parse the notification payload: `{"action": "INSERT"|"UPDATE"|"DELETE",
    /// "data": {<extension row>}}`.
    pub fn from_payload(payload: &str) -> Result<Self, DirectoryError> {
        #[derive(Deserialize)]
        struct Envelope {
            action: String,
            data: serde_json::Value,
        }

        let envelope: Envelope = serde_json::from_str(payload)
            .map_err(|e| DirectoryError::Malformed(e.to_string()))?;

        let action = match envelope.action.to_uppercase().as_str() {
            "INSERT" => ChangeAction::Insert,
            "UPDATE" => ChangeAction::Update,
            "DELETE" => ChangeAction::Delete,
            other => {
                return Err(DirectoryError::Malformed(format!(
                    "unknown change action: {other}"
                )))
            }
        };

        Ok(Self {
            action,
            record: ExtensionRecord::from_notification_row(&envelope.data)?,
        })
    }
}

/// Read access to the building directory
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// All configured extension listener pairs
    async fn list_extensions(&self) -> Result<Vec<ExtensionRecord>, DirectoryError>;

    /// Look one apartment up, with its residents and voip number
    async fn find_apartment(
        &self,
        apartment: &str,
    ) -> Result<Option<DirectoryEntry>, DirectoryError>;
}

/// Stream of directory change notifications
#[async_trait]
pub trait DirectoryWatcher: Send {
    /// Wait for the next change. Implementations reconnect internally; an
    /// error here means the watcher is permanently gone.
    async fn next_change(&mut self) -> Result<DirectoryChange, DirectoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> serde_json::Value {
        serde_json::json!({
            "extension_ia_id": 5,
            "extension_ia_number": "1000",
            "extension_ia_return": "1001",
            "extension_ia_ip": "0.0.0.0",
            "extension_ia_number_port": "9000",
            "extension_ia_return_port": "9001",
            "condominium_id": 1
        })
    }

    #[test]
    fn test_parse_insert_payload() {
        let payload = serde_json::json!({ "action": "INSERT", "data": row() }).to_string();
        let change = DirectoryChange::from_payload(&payload).unwrap();
        assert_eq!(change.action, ChangeAction::Insert);
        assert_eq!(change.record.ia_port, 9000);
    }

    #[test]
    fn test_action_is_case_insensitive() {
        let payload = serde_json::json!({ "action": "delete", "data": row() }).to_string();
        let change = DirectoryChange::from_payload(&payload).unwrap();
        assert_eq!(change.action, ChangeAction::Delete);
    }

    #[test]
    fn test_unknown_action_rejected() {
        let payload = serde_json::json!({ "action": "TRUNCATE", "data": row() }).to_string();
        assert!(DirectoryChange::from_payload(&payload).is_err());
    }

    #[test]
    fn test_garbage_payload_rejected() {
        assert!(DirectoryChange::from_payload("not json").is_err());
    }
}
