//! Directory row types

use serde::{Deserialize, Serialize};

use crate::DirectoryError;

/// One apartment's entry in the building directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub apartment: String,
    pub residents: Vec<String>,
    /// Bare digits or a SIP URI; normalize before dialing
    pub voip_number: String,
}

/// One listener-pair configuration owned by the extension manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRecord {
    pub id: i64,
    /// PBX extension answered by the agent (visitor side)
    pub ia_number: String,
    /// PBX extension the resident call returns on
    pub return_number: String,
    pub bind_ip: String,
    pub ia_port: u16,
    pub return_port: u16,
    pub building_id: i64,
}

impl ExtensionRecord {
    /// Parse the row shape carried by change notifications, e.g.
    /// `{"extension_ia_id": 3, "extension_ia_number": "1000", ...}`.
    /// Ports arrive as text in the source schema and are trimmed here.
    pub fn from_notification_row(row: &serde_json::Value) -> Result<Self, DirectoryError> {
        let field = |key: &str| -> Result<String, DirectoryError> {
            let value = row
                .get(key)
                .ok_or_else(|| DirectoryError::Malformed(format!("missing field {key}")))?;
            match value {
                serde_json::Value::String(s) => Ok(s.trim().to_string()),
                serde_json::Value::Number(n) => Ok(n.to_string()),
                other => Err(DirectoryError::Malformed(format!(
                    "field {key} has unexpected type: {other}"
                ))),
            }
        };

        let port = |key: &str| -> Result<u16, DirectoryError> {
            field(key)?
                .parse::<u16>()
                .map_err(|_| DirectoryError::Malformed(format!("field {key} is not a port")))
        };

        let int = |key: &str| -> Result<i64, DirectoryError> {
            field(key)?
                .parse::<i64>()
                .map_err(|_| DirectoryError::Malformed(format!("field {key} is not an integer")))
        };

        Ok(Self {
            id: int("extension_ia_id")?,
            ia_number: field("extension_ia_number")?,
            return_number: field("extension_ia_return")?,
            bind_ip: field("extension_ia_ip")?,
            ia_port: port("extension_ia_number_port")?,
            return_port: port("extension_ia_return_port")?,
            building_id: int("condominium_id").unwrap_or(0),
        })
    }

    /// Fields whose change requires a listener restart
    pub fn requires_restart(&self, other: &ExtensionRecord) -> bool {
        self.bind_ip != other.bind_ip
            || self.ia_port != other.ia_port
            || self.return_port != other.return_port
            || self.ia_number != other.ia_number
            || self.return_number != other.return_number
    }
}

/// Extract the dialable digits from a voip number.
///
/// Accepts bare digits (`"1003030"`) and SIP URIs
/// (`"sip:1003030@pbx.example"`); both normalize to `"1003030"`.
pub fn normalize_voip_number(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed.strip_prefix("sip:").unwrap_or(trimmed);
    match without_scheme.split_once('@') {
        Some((digits, _host)) => digits.to_string(),
        None => without_scheme.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bare_digits() {
        assert_eq!(normalize_voip_number("1003030"), "1003030");
    }

    #[test]
    fn test_normalize_sip_uri() {
        assert_eq!(normalize_voip_number("sip:1003030@pbx.local"), "1003030");
        assert_eq!(normalize_voip_number(" sip:42@h "), "42");
    }

    #[test]
    fn test_notification_row_parses_text_ports() {
        let row = serde_json::json!({
            "extension_ia_id": 7,
            "extension_ia_number": " 1000 ",
            "extension_ia_return": "1001",
            "extension_ia_ip": "10.0.0.5",
            "extension_ia_number_port": "9000",
            "extension_ia_return_port": "9001",
            "condominium_id": 3
        });

        let record = ExtensionRecord::from_notification_row(&row).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.ia_number, "1000");
        assert_eq!(record.ia_port, 9000);
        assert_eq!(record.return_port, 9001);
        assert_eq!(record.building_id, 3);
    }

    #[test]
    fn test_notification_row_missing_field() {
        let row = serde_json::json!({ "extension_ia_id": 1 });
        assert!(ExtensionRecord::from_notification_row(&row).is_err());
    }

    #[test]
    fn test_requires_restart_ignores_building() {
        let a = ExtensionRecord {
            id: 1,
            ia_number: "1000".into(),
            return_number: "1001".into(),
            bind_ip: "0.0.0.0".into(),
            ia_port: 8080,
            return_port: 8081,
            building_id: 1,
        };
        let mut b = a.clone();
        b.building_id = 9;
        assert!(!a.requires_restart(&b));

        b.ia_port = 9000;
        assert!(a.requires_restart(&b));
    }
}
