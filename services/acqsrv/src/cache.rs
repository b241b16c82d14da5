//! Status Cache
//!
//! Last-known snapshot per key (block id, or `weighing`). Every write
//! replaces the whole snapshot; readers get an `Arc` to an immutable value
//! and never observe a half-updated map.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::converter::{Measurement, QuantityValue};
use crate::parser::{FieldMap, RawValue};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SnapshotValue {
    Number(f64),
    Flag(bool),
    Unavailable,
}

impl From<RawValue> for SnapshotValue {
    fn from(raw: RawValue) -> Self {
        match raw {
            RawValue::Bit(b) => Self::Flag(b),
            other => other.as_f64().map_or(Self::Unavailable, Self::Number),
        }
    }
}

impl From<&QuantityValue> for SnapshotValue {
    fn from(value: &QuantityValue) -> Self {
        value.value().map_or(Self::Unavailable, Self::Number)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub key: String,
    pub updated_at: DateTime<Utc>,
    pub values: BTreeMap<String, SnapshotValue>,
    /// Quantities currently outside their alarm band
    pub alarms: Vec<String>,
}

impl StatusSnapshot {
    /// Raw fields plus converted quantities; a quantity shadows a field of the same name
    pub fn from_block(
        key: impl Into<String>,
        fields: &FieldMap,
        measurement: &Measurement,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let mut values: BTreeMap<String, SnapshotValue> = fields
            .iter()
            .map(|(name, raw)| (name.to_string(), raw.into()))
            .collect();
        for quantity in &measurement.quantities {
            values.insert(quantity.name.clone(), (&quantity.value).into());
        }
        Self {
            key: key.into(),
            updated_at,
            values,
            alarms: measurement.alarms().map(|q| q.name.clone()).collect(),
        }
    }

    /// Single value snapshot (`None` becomes `Unavailable`)
    pub fn single(
        key: impl Into<String>,
        name: impl Into<String>,
        value: Option<f64>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let mut values = BTreeMap::new();
        values.insert(
            name.into(),
            value.map_or(SnapshotValue::Unavailable, SnapshotValue::Number),
        );
        Self {
            key: key.into(),
            updated_at,
            values,
            alarms: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<SnapshotValue> {
        self.values.get(name).copied()
    }
}

/// Thread-safe last-writer-wins snapshot store
#[derive(Debug, Default)]
pub struct StatusCache {
    entries: DashMap<String, Arc<StatusSnapshot>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot stored under its key
    pub fn update(&self, snapshot: StatusSnapshot) {
        self.entries
            .insert(snapshot.key.clone(), Arc::new(snapshot));
    }

    pub fn get(&self, key: &str) -> Option<Arc<StatusSnapshot>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// All snapshots, ordered by key
    pub fn snapshot_all(&self) -> Vec<Arc<StatusSnapshot>> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{convert, QuantitySpec};

    #[test]
    fn test_update_replaces_whole_snapshot() {
        let cache = StatusCache::new();
        let now = Utc::now();

        let mut fields = FieldMap::default();
        fields.insert("done", RawValue::Bit(true));
        fields.insert("code", RawValue::Int(3));
        cache.update(StatusSnapshot::from_block(
            "status",
            &fields,
            &Measurement::default(),
            now,
        ));

        let first = cache.get("status").unwrap();
        assert_eq!(first.get("done"), Some(SnapshotValue::Flag(true)));

        let mut fields = FieldMap::default();
        fields.insert("code", RawValue::Invalid);
        cache.update(StatusSnapshot::from_block(
            "status",
            &fields,
            &Measurement::default(),
            now,
        ));

        let second = cache.get("status").unwrap();
        assert_eq!(second.get("done"), None);
        assert_eq!(second.get("code"), Some(SnapshotValue::Unavailable));
        // Earlier readers keep their consistent copy
        assert_eq!(first.get("code"), Some(SnapshotValue::Number(3.0)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_quantities_shadow_fields() {
        let mut fields = FieldMap::default();
        fields.insert("level", RawValue::Int(250));
        let specs: Vec<QuantitySpec> = serde_yaml::from_str(
            "- { name: level, source: level, conversion: { style: direct, scale: 0.1 } }",
        )
        .unwrap();
        let snapshot =
            StatusSnapshot::from_block("tank", &fields, &convert(&fields, &specs), Utc::now());
        assert_eq!(snapshot.get("level"), Some(SnapshotValue::Number(25.0)));
    }

    #[test]
    fn test_snapshot_all_is_ordered() {
        let cache = StatusCache::new();
        cache.update(StatusSnapshot::single("weighing", "weight", None, Utc::now()));
        cache.update(StatusSnapshot::single("arc", "x", Some(1.0), Utc::now()));
        let keys: Vec<_> = cache.snapshot_all().iter().map(|s| s.key.clone()).collect();
        assert_eq!(keys, vec!["arc", "weighing"]);
        assert_eq!(
            cache.get("weighing").unwrap().get("weight"),
            Some(SnapshotValue::Unavailable)
        );
    }
}
