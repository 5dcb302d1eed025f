use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;


#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Finding {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub description: String,
}


/// One inspected resource. Everything besides the id and the findings is
/// carried through untouched, but still counts for equality.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    pub resource_id: String,
    #[serde(default)]
    pub misconfigurations: Vec<Finding>,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl ResourceRecord {
    pub fn new(resource_id: impl Into<String>, misconfigurations: Vec<Finding>) -> Self {
        Self {
            resource_id: resource_id.into(),
            misconfigurations,
            attributes: serde_json::Map::new(),
        }
    }
}


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(transparent)]
pub struct Snapshot {
    services: BTreeMap<String, Vec<ResourceRecord>>,
}

impl Snapshot {
    pub fn insert(&mut self, service: impl Into<String>, records: Vec<ResourceRecord>) {
        self.services.insert(service.into(), records);
    }

    pub fn records(&self, service: &str) -> &[ResourceRecord] {
        self.services.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn resource_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Vec<ResourceRecord>)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (S, Vec<ResourceRecord>)>>(iter: I) -> Self {
        Self {
            services: iter.into_iter().map(|(s, r)| (s.into(), r)).collect(),
        }
    }
}


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChangedRecord {
    pub resource_id: String,
    pub previous: ResourceRecord,
    pub current: ResourceRecord,
}


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ServiceChanges {
    #[serde(rename = "new_issues", default)]
    pub new: Vec<ResourceRecord>,
    #[serde(rename = "resolved_issues", default)]
    pub resolved: Vec<ResourceRecord>,
    #[serde(rename = "changed_issues", default)]
    pub changed: Vec<ChangedRecord>,
}

impl ServiceChanges {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.resolved.is_empty() && self.changed.is_empty()
    }
}


/// Drift between two snapshots. Services without any change are never
/// stored, so an empty set means nothing drifted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(transparent)]
pub struct ChangeSet {
    services: BTreeMap<String, ServiceChanges>,
}

impl ChangeSet {
    pub fn insert(&mut self, service: impl Into<String>, changes: ServiceChanges) {
        if changes.is_empty() {
            return;
        }
        self.services.insert(service.into(), changes);
    }

    pub fn get(&self, service: &str) -> Option<&ServiceChanges> {
        self.services.get(service)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceChanges)> {
        self.services.iter().map(|(s, c)| (s.as_str(), c))
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}


/// Everything pushed to a subscriber connection, one JSON line each.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorMessage {
    InitialState {
        data: Snapshot,
        timestamp: String,
    },
    ServiceScanComplete {
        service: String,
        data: Vec<ResourceRecord>,
        timestamp: String,
    },
    ChangesDetected {
        changes: ChangeSet,
        scan_duration: f64,
        timestamp: String,
    },
    Error {
        error: String,
        timestamp: String,
    },
}

impl MonitorMessage {
    pub fn initial_state(data: Snapshot) -> Self {
        MonitorMessage::InitialState { data, timestamp: now_rfc3339() }
    }

    pub fn service_scan_complete(service: impl Into<String>, data: Vec<ResourceRecord>) -> Self {
        MonitorMessage::ServiceScanComplete {
            service: service.into(),
            data,
            timestamp: now_rfc3339(),
        }
    }

    pub fn changes_detected(changes: ChangeSet, scan_duration: f64) -> Self {
        MonitorMessage::ChangesDetected {
            changes,
            scan_duration,
            timestamp: now_rfc3339(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        MonitorMessage::Error { error: error.into(), timestamp: now_rfc3339() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MonitorMessage::InitialState { .. } => "initial_state",
            MonitorMessage::ServiceScanComplete { .. } => "service_scan_complete",
            MonitorMessage::ChangesDetected { .. } => "changes_detected",
            MonitorMessage::Error { .. } => "error",
        }
    }
}


/// Commands a subscriber may send on its connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    ForceScan,
}


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum IpcRequest {
    Start,
    Stop,
    Status,
    Scan,
    Subscribe,
}


#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IpcResponse {
    pub success: bool,
    pub data: serde_json::Value,
}


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub running: bool,
    pub subscriber_count: usize,
    pub scan_interval: u64,
    pub last_scan_timestamp: Option<String>,
}


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub message: String,
    pub changes: Option<ChangeSet>,
    pub timestamp: String,
}


pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
