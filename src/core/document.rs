//! Policy documents
//!
//! Standalone JSON files describing one filtering policy, read by the CLI.
//! A `<file>.sha256` sidecar, when present, is checked and a mismatch is
//! logged (hand-edited documents are expected).

use crate::core::model::{DefaultAction, FilteringPolicy, MAX_RULES, Rule};
use crate::utils::write_atomic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Policy document not found: {0}")]
    NotFound(PathBuf),

    #[error("Policy document has {count} rules (max {MAX_RULES})")]
    TooManyRules { count: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid policy document: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// On-disk form of a policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub default_action: DefaultAction,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl PolicyDocument {
    pub fn from_policy(policy: &FilteringPolicy) -> Self {
        Self {
            name: policy.name.clone(),
            description: policy.description.clone(),
            default_action: policy.default_action,
            rules: policy.ordered_rules().into_iter().cloned().collect(),
        }
    }

    /// Builds a policy owned by `firewall_id`.
    ///
    /// When every rule leaves its position out, file order is used.
    /// Otherwise positions are kept as written so gaps and duplicates reach
    /// the compiler and get reported.
    pub fn into_policy(self, firewall_id: Uuid) -> FilteringPolicy {
        let mut policy = FilteringPolicy::new(firewall_id, self.name, self.default_action);
        policy.description = self.description;
        policy.rules = self.rules;
        if policy.rules.iter().all(|r| r.position == 0) {
            for (rule, position) in policy.rules.iter_mut().zip(1u32..) {
                rule.position = position;
            }
        }
        policy
    }
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha256");
    PathBuf::from(sidecar)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Loads a policy document.
///
/// # Errors
///
/// Returns `Err` if the file is missing, unparsable, or over [`MAX_RULES`].
pub async fn load_document(path: &Path) -> Result<PolicyDocument, DocumentError> {
    if !tokio::fs::try_exists(path).await? {
        return Err(DocumentError::NotFound(path.to_path_buf()));
    }
    let json = tokio::fs::read_to_string(path).await?;

    if let Ok(expected) = tokio::fs::read_to_string(checksum_path(path)).await {
        let actual = sha256_hex(json.as_bytes());
        if expected.trim() != actual {
            tracing::warn!(
                "Policy document {} checksum mismatch (expected: {}, got: {})",
                path.display(),
                expected.trim(),
                actual
            );
        }
    }

    let document: PolicyDocument = serde_json::from_str(&json)?;
    if document.rules.len() > MAX_RULES {
        return Err(DocumentError::TooManyRules {
            count: document.rules.len(),
        });
    }
    Ok(document)
}

/// Writes a document and its checksum sidecar atomically (mode 0o600).
pub async fn save_document(path: &Path, document: &PolicyDocument) -> Result<(), DocumentError> {
    let json = serde_json::to_string_pretty(document)?;
    let checksum = sha256_hex(json.as_bytes());
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        write_atomic(&path, json.as_bytes())?;
        write_atomic(&checksum_path(&path), checksum.as_bytes())
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Action, Protocol};

    #[test]
    fn test_minimal_document_uses_file_order() {
        let json = r#"{
            "name": "web",
            "default_action": "deny",
            "rules": [
                {"protocol": "tcp", "destination_ports": [{"start": 22, "end": 22}], "action": "allow"},
                {"protocol": "icmp", "action": "allow"}
            ]
        }"#;
        let document: PolicyDocument = serde_json::from_str(json).unwrap();
        let policy = document.into_policy(Uuid::new_v4());

        assert_eq!(policy.default_action, DefaultAction::Deny);
        let positions: Vec<u32> = policy.rules.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![1, 2]);
        assert!(policy.rules.iter().all(|r| r.enabled));
        assert_eq!(policy.rules[1].protocol, Protocol::Icmp);
    }

    #[test]
    fn test_explicit_positions_are_kept() {
        let mut a = Rule::new(3, Protocol::Tcp, Action::Allow);
        a.position = 3;
        let document = PolicyDocument {
            name: "p".to_string(),
            description: None,
            default_action: DefaultAction::Allow,
            rules: vec![a],
        };
        assert_eq!(document.into_policy(Uuid::nil()).rules[0].position, 3);
    }

    #[tokio::test]
    async fn test_save_and_load_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web.json");
        let document = PolicyDocument {
            name: "web".to_string(),
            description: Some("ingress".to_string()),
            default_action: DefaultAction::Deny,
            rules: vec![Rule::new(1, Protocol::Udp, Action::Allow)],
        };

        save_document(&path, &document).await.unwrap();
        assert!(checksum_path(&path).exists());
        assert_eq!(load_document(&path).await.unwrap(), document);
    }

    #[tokio::test]
    async fn test_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_document(&dir.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(err, DocumentError::NotFound(_)));
    }
}
