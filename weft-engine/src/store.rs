//! Record store interface and the in-memory reference backend.
//!
//! The interpreter only calls a store after the mutation gate allowed the
//! write. Every write returns the `RecordChange`s it produced so the context
//! can append them to its change log (used for audit slices).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use weft::{RuntimeError, RuntimeResult, Value, ValueMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Create,
    Save,
    Update,
    Delete,
}

impl RecordAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordAction::Create => "create",
            RecordAction::Save => "save",
            RecordAction::Update => "update",
            RecordAction::Delete => "delete",
        }
    }
}

impl fmt::Display for RecordAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordChange {
    pub action: RecordAction,
    pub record: String,
    pub id: Value,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Equality filter: every listed field must equal the given value.
pub type RecordFilter = ValueMap;

pub trait RecordStore: fmt::Debug {
    fn save(&mut self, record: &str, values: ValueMap) -> RuntimeResult<RecordChange>;
    fn create(&mut self, record: &str, values: ValueMap) -> RuntimeResult<RecordChange>;
    fn find(&self, record: &str, filter: &RecordFilter) -> RuntimeResult<Vec<Value>>;
    fn update(
        &mut self,
        record: &str,
        filter: &RecordFilter,
        updates: &ValueMap,
    ) -> RuntimeResult<Vec<RecordChange>>;
    fn delete(&mut self, record: &str, filter: &RecordFilter) -> RuntimeResult<Vec<RecordChange>>;
}

/// In-memory store keyed by record name. Ids are assigned per store, starting at 1.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: IndexMap<String, Vec<ValueMap>>,
    next_id: i64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self, record: &str) -> Vec<Value> {
        self.records
            .get(record)
            .map(|rows| rows.iter().cloned().map(Value::Map).collect())
            .unwrap_or_default()
    }

    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn matches(row: &ValueMap, filter: &RecordFilter) -> bool {
        filter
            .iter()
            .all(|(field, expected)| row.get(field).map(|v| v.loose_eq(expected)).unwrap_or(false))
    }
}

impl RecordStore for MemoryRecordStore {
    /// Upsert by `id` when present, otherwise insert with a fresh id.
    fn save(&mut self, record: &str, mut values: ValueMap) -> RuntimeResult<RecordChange> {
        if let Some(id) = values.get("id").cloned() {
            let rows = self.records.entry(record.to_string()).or_default();
            if let Some(row) = rows.iter_mut().find(|r| r.get("id") == Some(&id)) {
                let before = Value::Map(row.clone());
                *row = values.clone();
                return Ok(RecordChange {
                    action: RecordAction::Save,
                    record: record.to_string(),
                    id,
                    before: Some(before),
                    after: Some(Value::Map(values)),
                });
            }
            rows.push(values.clone());
            return Ok(RecordChange {
                action: RecordAction::Save,
                record: record.to_string(),
                id,
                before: None,
                after: Some(Value::Map(values)),
            });
        }
        let id = Value::Integer(self.allocate_id());
        values.insert("id".to_string(), id.clone());
        self.records
            .entry(record.to_string())
            .or_default()
            .push(values.clone());
        Ok(RecordChange {
            action: RecordAction::Save,
            record: record.to_string(),
            id,
            before: None,
            after: Some(Value::Map(values)),
        })
    }

    fn create(&mut self, record: &str, mut values: ValueMap) -> RuntimeResult<RecordChange> {
        if values.contains_key("id") {
            return Err(RuntimeError::domain(format!(
                "Cannot create {} with an explicit id; use save instead",
                record
            )));
        }
        let id = Value::Integer(self.allocate_id());
        values.insert("id".to_string(), id.clone());
        self.records
            .entry(record.to_string())
            .or_default()
            .push(values.clone());
        Ok(RecordChange {
            action: RecordAction::Create,
            record: record.to_string(),
            id,
            before: None,
            after: Some(Value::Map(values)),
        })
    }

    fn find(&self, record: &str, filter: &RecordFilter) -> RuntimeResult<Vec<Value>> {
        Ok(self
            .records
            .get(record)
            .map(|rows| {
                rows.iter()
                    .filter(|row| Self::matches(row, filter))
                    .cloned()
                    .map(Value::Map)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn update(
        &mut self,
        record: &str,
        filter: &RecordFilter,
        updates: &ValueMap,
    ) -> RuntimeResult<Vec<RecordChange>> {
        let mut changes = Vec::new();
        if let Some(rows) = self.records.get_mut(record) {
            for row in rows.iter_mut().filter(|row| Self::matches(row, filter)) {
                let before = Value::Map(row.clone());
                for (field, value) in updates {
                    row.insert(field.clone(), value.clone());
                }
                changes.push(RecordChange {
                    action: RecordAction::Update,
                    record: record.to_string(),
                    id: row.get("id").cloned().unwrap_or(Value::Null),
                    before: Some(before),
                    after: Some(Value::Map(row.clone())),
                });
            }
        }
        Ok(changes)
    }

    fn delete(&mut self, record: &str, filter: &RecordFilter) -> RuntimeResult<Vec<RecordChange>> {
        let mut changes = Vec::new();
        if let Some(rows) = self.records.get_mut(record) {
            rows.retain(|row| {
                if Self::matches(row, filter) {
                    changes.push(RecordChange {
                        action: RecordAction::Delete,
                        record: record.to_string(),
                        id: row.get("id").cloned().unwrap_or(Value::Null),
                        before: Some(Value::Map(row.clone())),
                        after: None,
                    });
                    false
                } else {
                    true
                }
            });
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(total: i64) -> ValueMap {
        let mut m = ValueMap::new();
        m.insert("total".to_string(), Value::Integer(total));
        m
    }

    #[test]
    fn test_create_assigns_increasing_ids() {
        let mut store = MemoryRecordStore::new();
        let a = store.create("Order", order(10)).unwrap();
        let b = store.create("Order", order(20)).unwrap();
        assert_eq!(a.id, Value::Integer(1));
        assert_eq!(b.id, Value::Integer(2));
        assert_eq!(store.all("Order").len(), 2);
    }

    #[test]
    fn test_update_and_delete_respect_filter() {
        let mut store = MemoryRecordStore::new();
        store.create("Order", order(10)).unwrap();
        store.create("Order", order(20)).unwrap();

        let mut filter = RecordFilter::new();
        filter.insert("total".to_string(), Value::Float(20.0));
        let mut updates = ValueMap::new();
        updates.insert("status".to_string(), Value::text("paid"));
        let changes = store.update("Order", &filter, &updates).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].after.as_ref().unwrap().get_path(&["status"]),
            Some(&Value::text("paid"))
        );

        let removed = store.delete("Order", &filter).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(store.all("Order").len(), 1);
    }

    #[test]
    fn test_save_upserts_by_id() {
        let mut store = MemoryRecordStore::new();
        let first = store.save("Order", order(5)).unwrap();
        let mut again = order(7);
        again.insert("id".to_string(), first.id.clone());
        let second = store.save("Order", again).unwrap();
        assert!(second.before.is_some());
        assert_eq!(store.all("Order").len(), 1);
    }
}
