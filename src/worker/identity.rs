//! Node identity
//!
//! Native workers persist a generated hardware id so that restarts keep the
//! same ledger record. Browser-type workers derive theirs from the wallet.

use std::io;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::core::{NodeRegistration, WorkerType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub hardware_id: String,
    pub wallet_address: Option<String>,
    pub worker_type: WorkerType,
}

/// `WORKER-` followed by 8 upper-case hex characters
pub fn generate_hardware_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("WORKER-{}", id[..8].to_uppercase())
}

impl NodeIdentity {
    pub fn new(hardware_id: impl Into<String>, worker_type: WorkerType) -> Self {
        Self {
            hardware_id: hardware_id.into(),
            wallet_address: None,
            worker_type,
        }
    }

    pub fn with_wallet(mut self, wallet: Option<String>) -> Self {
        self.wallet_address = wallet;
        self
    }

    /// Reuse the id stored at `path`, or generate and store a new one
    pub fn load_or_create(path: &Path) -> io::Result<Self> {
        if let Ok(existing) = std::fs::read_to_string(path) {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(Self::new(existing, WorkerType::Native));
            }
        }

        let hardware_id = generate_hardware_id();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &hardware_id)?;
        info!("Generated node id {} ({})", hardware_id, path.display());
        Ok(Self::new(hardware_id, WorkerType::Native))
    }

    /// `BROWSER-` followed by wallet characters 2..10, upper-cased
    pub fn from_wallet(wallet: &str) -> Self {
        let tag: String = wallet.chars().skip(2).take(8).collect();
        Self::new(format!("BROWSER-{}", tag.to_uppercase()), WorkerType::Browser)
            .with_wallet(Some(wallet.to_string()))
    }

    pub fn registration(&self) -> NodeRegistration {
        NodeRegistration {
            hardware_id: self.hardware_id.clone(),
            wallet_address: self.wallet_address.clone(),
            worker_type: self.worker_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_format() {
        let id = generate_hardware_id();
        assert!(id.starts_with("WORKER-"));
        let suffix = &id["WORKER-".len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_load_or_create_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("node_id.txt");

        let first = NodeIdentity::load_or_create(&path).unwrap();
        let second = NodeIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.hardware_id, second.hardware_id);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            first.hardware_id
        );
    }

    #[test]
    fn test_from_wallet() {
        let identity = NodeIdentity::from_wallet("0xabcdef1234567890");
        assert_eq!(identity.hardware_id, "BROWSER-ABCDEF12");
        assert_eq!(identity.worker_type, WorkerType::Browser);
        assert_eq!(
            identity.registration().wallet_address.as_deref(),
            Some("0xabcdef1234567890")
        );
    }
}
