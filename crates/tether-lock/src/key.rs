use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Identifies a lockable resource and carries per-store metadata.
///
/// A key is created per lock and owned by it. Stores keep their bookkeeping
/// (unique tokens, lock modes) in the key's state, namespaced by store.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    resource: String,
    expiring_time: Option<DateTime<Utc>>,
    state: HashMap<String, Value>,
    serializable: bool,
}

impl Key {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            expiring_time: None,
            state: HashMap::new(),
            serializable: true,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn has_state(&self, namespace: &str) -> bool {
        self.state.contains_key(namespace)
    }

    pub fn state(&self, namespace: &str) -> Option<&Value> {
        self.state.get(namespace)
    }

    pub fn set_state(&mut self, namespace: impl Into<String>, value: Value) {
        self.state.insert(namespace.into(), value);
    }

    pub fn remove_state(&mut self, namespace: &str) -> Option<Value> {
        self.state.remove(namespace)
    }

    /// Flag the key as bound to process-local resources (e.g. an open file).
    pub fn mark_unserializable(&mut self) {
        self.serializable = false;
    }

    pub fn is_serializable(&self) -> bool {
        self.serializable
    }

    pub fn reset_lifetime(&mut self) {
        self.expiring_time = None;
    }

    /// Bring the expiry forward to `now + ttl` unless it is already sooner.
    pub fn reduce_lifetime(&mut self, ttl: Duration) {
        let candidate = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta));

        // A ttl too large to represent never shortens anything.
        let Some(candidate) = candidate else { return };

        match self.expiring_time {
            Some(current) if current <= candidate => {}
            _ => self.expiring_time = Some(candidate),
        }
    }

    pub fn expiring_time(&self) -> Option<DateTime<Utc>> {
        self.expiring_time
    }

    /// Time left before expiry; negative once the key has expired.
    pub fn remaining_lifetime(&self) -> Option<TimeDelta> {
        self.expiring_time.map(|at| at - Utc::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_lifetime()
            .is_some_and(|remaining| remaining <= TimeDelta::zero())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)
    }
}

#[derive(Serialize)]
struct KeyRef<'a> {
    resource: &'a str,
    expiring_time: Option<DateTime<Utc>>,
    state: &'a HashMap<String, Value>,
}

#[derive(Deserialize)]
struct KeyOwned {
    resource: String,
    #[serde(default)]
    expiring_time: Option<DateTime<Utc>>,
    #[serde(default)]
    state: HashMap<String, Value>,
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.serializable {
            return Err(serde::ser::Error::custom(format!(
                "The key \"{}\" cannot be serialized.",
                self.resource
            )));
        }

        KeyRef {
            resource: &self.resource,
            expiring_time: self.expiring_time,
            state: &self.state,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let owned = KeyOwned::deserialize(deserializer)?;
        Ok(Self {
            resource: owned.resource,
            expiring_time: owned.expiring_time,
            state: owned.state,
            serializable: true,
        })
    }
}
