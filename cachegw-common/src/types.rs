//! # Operation Records
//!
//! Per-request bookkeeping handed from the gateway to the metrics recorder.
//! A record lives for exactly one request and is discarded after recording.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Logical gateway operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Get,
    Set,
}

impl OperationKind {
    /// All kinds, in index order.
    pub const ALL: [OperationKind; 2] = [OperationKind::Get, OperationKind::Set];

    /// Dense index used by fixed-size counter tables.
    pub const fn index(self) -> usize {
        match self {
            OperationKind::Get => 0,
            OperationKind::Set => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            OperationKind::Get => "get",
            OperationKind::Set => "set",
        }
    }
}

/// Result class of one operation.
///
/// For `set`, `Hit` means the backend acknowledged the write and `Miss` means
/// it did not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Hit,
    Miss,
    Error,
}

impl Outcome {
    /// All outcomes, in index order.
    pub const ALL: [Outcome; 3] = [Outcome::Hit, Outcome::Miss, Outcome::Error];

    pub const fn index(self) -> usize {
        match self {
            Outcome::Hit => 0,
            Outcome::Miss => 1,
            Outcome::Error => 2,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Hit => "hit",
            Outcome::Miss => "miss",
            Outcome::Error => "error",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral record of one gateway operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub outcome: Outcome,
    /// Time spent from admission through borrow and the backend round trip.
    pub latency: Duration,
}

impl OperationRecord {
    pub fn new(kind: OperationKind, outcome: Outcome, latency: Duration) -> Self {
        OperationRecord {
            kind,
            outcome,
            latency,
        }
    }
}
