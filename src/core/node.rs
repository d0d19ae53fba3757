//! Worker node records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reputation assigned on first registration
pub const INITIAL_REPUTATION: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Offline => "offline",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(NodeStatus::Active),
            "offline" => Ok(NodeStatus::Offline),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Native,
    Browser,
    Python,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Native => "native",
            WorkerType::Browser => "browser",
            WorkerType::Python => "python",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(WorkerType::Native),
            "browser" => Ok(WorkerType::Browser),
            "python" => Ok(WorkerType::Python),
            other => Err(format!("unknown worker type: {}", other)),
        }
    }
}

/// A node as stored in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub hardware_id: String,
    pub wallet_address: Option<String>,
    pub status: NodeStatus,
    pub current_jobs: u32,
    pub total_jobs_completed: u64,
    pub reputation: f64,
    pub worker_type: WorkerType,
    pub last_seen: DateTime<Utc>,
}

/// Fields a worker sends when registering or refreshing itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub hardware_id: String,
    pub wallet_address: Option<String>,
    pub worker_type: WorkerType,
}

impl NodeRegistration {
    /// Node record for a first-time registration
    pub fn into_node(self, now: DateTime<Utc>) -> Node {
        Node {
            hardware_id: self.hardware_id,
            wallet_address: self.wallet_address,
            status: NodeStatus::Active,
            current_jobs: 0,
            total_jobs_completed: 0,
            reputation: INITIAL_REPUTATION,
            worker_type: self.worker_type,
            last_seen: now,
        }
    }
}

/// Reputation after a job reaches a terminal status
pub fn adjust_reputation(reputation: f64, succeeded: bool) -> f64 {
    if succeeded {
        reputation + 1.0
    } else {
        (reputation - 1.0).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_defaults() {
        let node = NodeRegistration {
            hardware_id: "WORKER-ABCD1234".to_string(),
            wallet_address: None,
            worker_type: WorkerType::Native,
        }
        .into_node(Utc::now());
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.current_jobs, 0);
        assert_eq!(node.reputation, INITIAL_REPUTATION);
    }

    #[test]
    fn test_reputation_floor() {
        assert_eq!(adjust_reputation(0.5, false), 0.0);
        assert_eq!(adjust_reputation(10.0, true), 11.0);
    }
}
