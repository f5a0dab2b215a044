use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::ContainerRecord;

/// Label keys attached to every lab container at creation. The runtime
/// itself is the source of truth: anything carrying these labels is a
/// lab instance, nothing else is.
pub mod labels {
    pub const MANAGED: &str = "laborc.managed";
    pub const OWNER: &str = "laborc.owner";
    pub const LAB: &str = "laborc.lab";
    pub const CREATED_AT: &str = "laborc.created_at";
    pub const EXPIRES_AT: &str = "laborc.expires_at";
    pub const PORT: &str = "laborc.port";
}

/// Derived state of an instance; never stored anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Expired,
    NotFound,
}

/// A live container plus the metadata it carries. Built from runtime
/// queries, not from a database row.
#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_id: String,
    pub instance_name: String,
    pub owner_id: String,
    pub lab_ref: Option<String>,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub host_port: Option<u16>,
    pub running: bool,
}

impl Instance {
    /// Parse a container record into an instance. Returns `None` for
    /// containers that do not carry the full label set; those are not
    /// ours to manage.
    pub fn from_record(record: &ContainerRecord) -> Option<Self> {
        let get = |key: &str| record.labels.get(key).cloned();

        let owner_id = get(labels::OWNER)?;
        let created_at = parse_timestamp(&get(labels::CREATED_AT)?)?;
        let expires_at = parse_timestamp(&get(labels::EXPIRES_AT)?)?;

        let lab_ref = get(labels::LAB).filter(|v| v != "unknown");
        let host_port = get(labels::PORT).and_then(|p| p.parse().ok());

        Some(Self {
            instance_id: record.id.clone(),
            instance_name: record.name.clone(),
            owner_id,
            lab_ref,
            image: record.image.clone(),
            created_at,
            expires_at,
            host_port,
            running: record.running,
        })
    }

    /// Status against a clock and the effective expiry, which may have
    /// been extended past the immutable label value.
    pub fn status(&self, now: DateTime<Utc>, effective_expiry: DateTime<Utc>) -> InstanceStatus {
        if !self.running {
            InstanceStatus::NotFound
        } else if now > effective_expiry {
            InstanceStatus::Expired
        } else {
            InstanceStatus::Running
        }
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_minutes()
    }
}

/// Build the label set for a new instance.
pub fn label_set(
    owner_id: &str,
    lab_ref: Option<&str>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    host_port: u16,
) -> HashMap<String, String> {
    let mut set = HashMap::new();
    set.insert(labels::MANAGED.to_string(), "true".to_string());
    set.insert(labels::OWNER.to_string(), owner_id.to_string());
    set.insert(
        labels::LAB.to_string(),
        lab_ref.unwrap_or("unknown").to_string(),
    );
    set.insert(labels::CREATED_AT.to_string(), created_at.to_rfc3339());
    set.insert(labels::EXPIRES_AT.to_string(), expires_at.to_rfc3339());
    set.insert(labels::PORT.to_string(), host_port.to_string());
    set
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Connection details returned by Status and admin listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub instance_name: String,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lab_ref: Option<String>,
    pub image: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: InstanceStatus,
}

/// Successful Spawn response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnedInstance {
    pub success: bool,
    pub simulated: bool,
    pub instance_id: String,
    pub instance_name: String,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lab_ref: Option<String>,
    pub image: String,
    pub host: String,
    pub port: u16,
    pub container_port: u16,
    pub connection: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub timeout_minutes: i64,
}

/// Kill outcome; partial failures are collected, not fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillReport {
    pub success: bool,
    pub killed_count: usize,
    pub instance_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<String>,
}

impl KillReport {
    pub fn empty() -> Self {
        Self {
            success: true,
            killed_count: 0,
            instance_ids: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Outcome of one reclamation sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub cleaned_count: usize,
    pub instance_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record_with_labels(labels: HashMap<String, String>, running: bool) -> ContainerRecord {
        ContainerRecord {
            id: "abc123".to_string(),
            name: "lab-7-dvwa-deadbeef".to_string(),
            image: "vulnerables/web-dvwa".to_string(),
            labels,
            running,
        }
    }

    #[test]
    fn label_round_trip() {
        let created = Utc::now();
        let expires = created + Duration::minutes(120);
        let set = label_set("7", Some("dvwa"), created, expires, 24123);

        let instance = Instance::from_record(&record_with_labels(set, true)).unwrap();

        assert_eq!(instance.owner_id, "7");
        assert_eq!(instance.lab_ref.as_deref(), Some("dvwa"));
        assert_eq!(instance.host_port, Some(24123));
        // RFC 3339 keeps sub-second precision, so timestamps survive intact.
        assert_eq!(instance.created_at, created);
        assert_eq!(instance.expires_at, expires);
    }

    #[test]
    fn unlabeled_container_is_not_an_instance() {
        let record = record_with_labels(HashMap::new(), true);
        assert!(Instance::from_record(&record).is_none());
    }

    #[test]
    fn unknown_lab_ref_becomes_none() {
        let set = label_set("7", None, Utc::now(), Utc::now(), 20001);
        let instance = Instance::from_record(&record_with_labels(set, true)).unwrap();
        assert!(instance.lab_ref.is_none());
    }

    #[test]
    fn status_derivation() {
        let now = Utc::now();
        let set = label_set("7", None, now, now + Duration::minutes(5), 20001);
        let instance = Instance::from_record(&record_with_labels(set, true)).unwrap();

        assert_eq!(
            instance.status(now, instance.expires_at),
            InstanceStatus::Running
        );
        assert_eq!(
            instance.status(now + Duration::minutes(10), instance.expires_at),
            InstanceStatus::Expired
        );
        // Extension moves the effective expiry without touching labels.
        assert_eq!(
            instance.status(now + Duration::minutes(10), now + Duration::minutes(20)),
            InstanceStatus::Running
        );

        let stopped = Instance::from_record(&record_with_labels(
            label_set("7", None, now, now + Duration::minutes(5), 20001),
            false,
        ))
        .unwrap();
        assert_eq!(
            stopped.status(now, stopped.expires_at),
            InstanceStatus::NotFound
        );
    }
}
