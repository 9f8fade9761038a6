use std::fmt;

use serde::Serialize;

use crate::coordinates::{Coordinates, ERROR_SENTINEL};
use crate::ingestion::AddressRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Exact,
    Fallback,
    None,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Exact => "exact",
            Tier::Fallback => "fallback",
            Tier::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Success,
    Failed,
    Error(String),
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => f.write_str("success"),
            Status::Failed => f.write_str("failed"),
            Status::Error(detail) => write!(f, "error:{detail}"),
        }
    }
}

/// Result of one resolution attempt for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub id: String,
    pub address: String,
    pub target_used: String,
    pub resolved: String,
    pub coordinates: Option<Coordinates>,
    pub tier: Tier,
    pub status: Status,
}

impl ResolutionOutcome {
    pub fn success(
        record: &AddressRecord,
        target_used: impl Into<String>,
        resolved: impl Into<String>,
        coordinates: Coordinates,
        tier: Tier,
    ) -> Self {
        Self {
            id: record.id.clone(),
            address: record.address.clone(),
            target_used: target_used.into(),
            resolved: resolved.into(),
            coordinates: Some(coordinates),
            tier,
            status: Status::Success,
        }
    }

    pub fn failed(
        record: &AddressRecord,
        target_used: impl Into<String>,
        resolved: impl Into<String>,
    ) -> Self {
        Self {
            id: record.id.clone(),
            address: record.address.clone(),
            target_used: target_used.into(),
            resolved: resolved.into(),
            coordinates: None,
            tier: Tier::None,
            status: Status::Failed,
        }
    }

    pub fn error(record: &AddressRecord, detail: impl Into<String>) -> Self {
        Self {
            id: record.id.clone(),
            address: record.address.clone(),
            target_used: record.target.clone(),
            resolved: ERROR_SENTINEL.to_string(),
            coordinates: None,
            tier: Tier::None,
            status: Status::Error(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn used_fallback(&self) -> bool {
        self.is_success() && self.tier == Tier::Fallback
    }
}
