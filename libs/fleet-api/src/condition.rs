//! Condition ledger
//!
//! Every resource reports progress as a keyed set of conditions plus a
//! synthetic `Ready` rollup. A condition's `last_transition_time` only moves
//! when its status changes; rewriting the same status with a new message keeps it.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Well-known condition types
pub mod types {
    pub const READY: &str = "Ready";
    pub const INPUT_READY: &str = "InputReady";
    pub const ADDRESS_RESERVATION_READY: &str = "AddressReservationReady";
    pub const NAME_RESOLUTION_READY: &str = "NameResolutionReady";
    pub const SETUP_READY: &str = "SetupReady";
    pub const DEPLOYMENT_READY: &str = "DeploymentReady";

    /// Per-service progress entry, e.g. `configure-network` -> `ConfigureNetworkDeploymentReady`
    pub fn service_deployment_ready(service: &str) -> String {
        let mut out = String::with_capacity(service.len() + DEPLOYMENT_READY.len());
        for part in service.split(|c: char| !c.is_ascii_alphanumeric()) {
            let mut chars = part.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.extend(chars);
            }
        }
        out.push_str(DEPLOYMENT_READY);
        out
    }
}

/// Well-known condition reasons
pub mod reasons {
    pub const INIT: &str = "Init";
    pub const READY: &str = "Ready";
    pub const PENDING: &str = "Pending";
    pub const WAITING: &str = "Waiting";
    pub const REQUESTED: &str = "Requested";
    pub const NOT_REQUESTED: &str = "NotRequested";
    pub const DEPLOYING: &str = "Deploying";
    pub const MISSING: &str = "Missing";
    pub const ERROR: &str = "Error";
}

/// Tri-state condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// How bad a non-true condition is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

/// One named status entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            severity,
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    pub fn is_error(&self) -> bool {
        self.status == ConditionStatus::False && self.severity == Severity::Error
    }
}

/// Keyed, ordered collection of conditions for one owner
#[derive(Debug, Clone, Default)]
pub struct ConditionLedger {
    entries: Vec<Condition>,
    index: HashMap<String, usize>,
}

impl PartialEq for ConditionLedger {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for ConditionLedger {}

impl ConditionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to `Ready` plus the given types, all Unknown
    pub fn init(&mut self, condition_types: &[&str]) {
        self.entries.clear();
        self.index.clear();
        self.mark_unknown(types::READY, reasons::INIT, "initializing");
        for condition_type in condition_types {
            self.mark_unknown(condition_type, reasons::INIT, "initializing");
        }
    }

    pub fn get(&self, condition_type: &str) -> Option<&Condition> {
        self.index.get(condition_type).map(|&i| &self.entries[i])
    }

    pub fn is_true(&self, condition_type: &str) -> bool {
        self.get(condition_type).map(Condition::is_true).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mark_true(&mut self, condition_type: &str, reason: &str, message: impl Into<String>) {
        self.set(condition_type, ConditionStatus::True, reason, Severity::Info, message);
    }

    pub fn mark_false(
        &mut self,
        condition_type: &str,
        reason: &str,
        severity: Severity,
        message: impl Into<String>,
    ) {
        self.set(condition_type, ConditionStatus::False, reason, severity, message);
    }

    pub fn mark_unknown(&mut self, condition_type: &str, reason: &str, message: impl Into<String>) {
        self.set(condition_type, ConditionStatus::Unknown, reason, Severity::Info, message);
    }

    /// Write a condition, keeping the transition time when the status is unchanged
    pub fn set(
        &mut self,
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        severity: Severity,
        message: impl Into<String>,
    ) {
        let message = message.into();
        match self.index.get(condition_type) {
            Some(&i) => {
                let entry = &mut self.entries[i];
                if entry.status != status {
                    entry.last_transition_time = Utc::now();
                }
                entry.status = status;
                entry.reason = reason.to_string();
                entry.severity = severity;
                entry.message = message;
            }
            None => {
                self.index
                    .insert(condition_type.to_string(), self.entries.len());
                self.entries.push(Condition::new(
                    condition_type,
                    status,
                    reason,
                    severity,
                    message,
                ));
            }
        }
    }

    /// Store a condition computed elsewhere, e.g. by [`ConditionLedger::mirror`]
    pub fn apply(&mut self, condition: Condition) {
        match self.index.get(&condition.condition_type) {
            Some(&i) => {
                let entry = &mut self.entries[i];
                let last_transition_time = if entry.status == condition.status {
                    entry.last_transition_time
                } else {
                    condition.last_transition_time
                };
                *entry = Condition {
                    last_transition_time,
                    ..condition
                };
            }
            None => {
                self.index
                    .insert(condition.condition_type.clone(), self.entries.len());
                self.entries.push(condition);
            }
        }
    }

    /// True when every condition other than `Ready` is True
    pub fn all_sub_conditions_true(&self) -> bool {
        self.entries
            .iter()
            .filter(|c| c.condition_type != types::READY)
            .all(Condition::is_true)
    }

    /// Roll every other condition up into `target_type` without mutating the ledger.
    ///
    /// False wins over Unknown, which wins over True. The summary carries the
    /// reason, severity and message of the first condition with the winning status.
    pub fn mirror(&self, target_type: &str) -> Condition {
        let subs = || {
            self.entries
                .iter()
                .filter(|c| c.condition_type != target_type && c.condition_type != types::READY)
        };

        let summary = subs()
            .find(|c| c.status == ConditionStatus::False)
            .or_else(|| subs().find(|c| c.status == ConditionStatus::Unknown));

        let mut rollup = match summary {
            Some(c) => Condition::new(target_type, c.status, &c.reason, c.severity, &c.message),
            None => Condition::new(
                target_type,
                ConditionStatus::True,
                reasons::READY,
                Severity::Info,
                "Setup complete",
            ),
        };

        if let Some(existing) = self.get(target_type) {
            if existing.status == rollup.status {
                rollup.last_transition_time = existing.last_transition_time;
            }
        }
        rollup
    }

    /// Keep the persisted transition time of every condition whose status did
    /// not change relative to `previous`.
    pub fn restore_transition_times(&mut self, previous: &ConditionLedger) {
        for entry in &mut self.entries {
            if let Some(old) = previous.get(&entry.condition_type) {
                if old.status == entry.status {
                    entry.last_transition_time = old.last_transition_time;
                }
            }
        }
    }
}

impl Serialize for ConditionLedger {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConditionLedger {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries = Vec::<Condition>::deserialize(deserializer)?;
        let mut ledger = ConditionLedger::new();
        for condition in entries {
            ledger.apply(condition);
        }
        Ok(ledger)
    }
}
