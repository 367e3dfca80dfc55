//! The user-facing record store handlers mutate.
//!
//! An in-process table store with the CRUD surface handlers see
//! (`create`/`update`/`upsert`/`delete`/`find_unique`/`find_many`/
//! `create_many`/`update_many`). Mutations run inside a transaction that
//! commits together with the dispatcher's checkpoint; every committed
//! mutation appends its inverse to a write-ahead log keyed by event
//! position, which is what makes reorg rewind possible.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use chainfeed_core::EngineError;

// ─── Positions ───────────────────────────────────────────────────────────────

/// The chain position a transaction's mutations are attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPosition {
    pub chain_id: u64,
    pub block_number: u64,
    pub log_index: u32,
}

// ─── Query surface ───────────────────────────────────────────────────────────

/// One `find_many` filter condition; conditions AND-combine.
#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// Arguments for `find_many`.
#[derive(Debug, Clone, Default)]
pub struct FindMany {
    pub conditions: Vec<Condition>,
    pub order_by: Option<(String, SortDir)>,
    pub skip: usize,
    pub take: Option<usize>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

struct WalEntry {
    position: EventPosition,
    table: String,
    id: String,
    /// Committed value before this mutation; `None` means the row did not
    /// exist (the inverse of a create is a delete).
    prior: Option<Value>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, BTreeMap<String, Value>>,
    wal: Vec<WalEntry>,
}

/// The record store. Mutated only through [`StoreTxn`]s, one at a time
/// (the dispatcher is single-tasked).
#[derive(Default)]
pub struct RecordStore {
    inner: Mutex<Inner>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction. `position` is the event being dispatched;
    /// `None` for setup transactions, whose mutations never roll back.
    pub fn begin(&self, position: Option<EventPosition>) -> StoreTxn<'_> {
        StoreTxn {
            store: self,
            position,
            overlay: Vec::new(),
        }
    }

    /// Rewind every mutation attributed to `chain_id` at or above
    /// `from_block`, newest first, restoring prior values.
    pub fn rollback(&self, chain_id: u64, from_block: u64) {
        let mut inner = self.inner.lock().unwrap();
        let mut undone = 0usize;
        let mut idx = inner.wal.len();
        while idx > 0 {
            idx -= 1;
            let matches = {
                let entry = &inner.wal[idx];
                entry.position.chain_id == chain_id && entry.position.block_number >= from_block
            };
            if !matches {
                continue;
            }
            let entry = inner.wal.remove(idx);
            let table = inner.tables.entry(entry.table).or_default();
            match entry.prior {
                Some(value) => {
                    table.insert(entry.id, value);
                }
                None => {
                    table.remove(&entry.id);
                }
            }
            undone += 1;
        }
        debug!(chain_id, from_block, undone, "record store rewound");
    }

    /// Committed view of a table (for queries outside a transaction and
    /// for tests).
    pub fn snapshot(&self, table: &str) -> BTreeMap<String, Value> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn wal_len(&self) -> usize {
        self.inner.lock().unwrap().wal.len()
    }
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// A buffered transaction; nothing is visible outside until `commit`.
pub struct StoreTxn<'a> {
    store: &'a RecordStore,
    position: Option<EventPosition>,
    /// `(table, id, new_value)` in op order; `None` is a delete. Later
    /// entries for the same key win.
    overlay: Vec<(String, String, Option<Value>)>,
}

impl StoreTxn<'_> {
    /// The value of `(table, id)` as this transaction sees it.
    pub fn find_unique(&self, table: &str, id: &str) -> Option<Value> {
        for (t, i, v) in self.overlay.iter().rev() {
            if t == table && i == id {
                return v.clone();
            }
        }
        self.store
            .inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .and_then(|t| t.get(id))
            .cloned()
    }

    /// All rows of `table` as this transaction sees them, filtered,
    /// ordered, and paginated.
    pub fn find_many(&self, table: &str, args: &FindMany) -> Vec<(String, Value)> {
        let mut rows = self
            .store
            .inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default();
        for (t, id, value) in &self.overlay {
            if t != table {
                continue;
            }
            match value {
                Some(v) => {
                    rows.insert(id.clone(), v.clone());
                }
                None => {
                    rows.remove(id);
                }
            }
        }

        let mut rows: Vec<(String, Value)> = rows
            .into_iter()
            .filter(|(_, row)| args.conditions.iter().all(|c| matches_condition(row, c)))
            .collect();

        if let Some((field, dir)) = &args.order_by {
            rows.sort_by(|(_, a), (_, b)| {
                let ord = compare_values(field_of(a, field), field_of(b, field));
                match dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                }
            });
        }

        rows.into_iter()
            .skip(args.skip)
            .take(args.take.unwrap_or(usize::MAX))
            .collect()
    }

    /// Insert a new row; errors if the id already exists.
    pub fn create(&mut self, table: &str, id: &str, data: Value) -> Result<(), EngineError> {
        if self.find_unique(table, id).is_some() {
            return Err(EngineError::Handler {
                source_name: table.into(),
                event: "create".into(),
                reason: format!("record `{id}` already exists"),
            });
        }
        self.overlay
            .push((table.to_string(), id.to_string(), Some(data)));
        Ok(())
    }

    pub fn create_many(
        &mut self,
        table: &str,
        rows: Vec<(String, Value)>,
    ) -> Result<(), EngineError> {
        for (id, data) in rows {
            self.create(table, &id, data)?;
        }
        Ok(())
    }

    /// Merge `data`'s fields into an existing row.
    pub fn update(&mut self, table: &str, id: &str, data: Value) -> Result<(), EngineError> {
        let current = self.find_unique(table, id).ok_or_else(|| EngineError::Handler {
            source_name: table.into(),
            event: "update".into(),
            reason: format!("record `{id}` not found"),
        })?;
        let merged = merge(current, data);
        self.overlay
            .push((table.to_string(), id.to_string(), Some(merged)));
        Ok(())
    }

    /// Update via a function of the current value.
    pub fn update_with(
        &mut self,
        table: &str,
        id: &str,
        f: impl FnOnce(&Value) -> Value,
    ) -> Result<(), EngineError> {
        let current = self.find_unique(table, id).ok_or_else(|| EngineError::Handler {
            source_name: table.into(),
            event: "update".into(),
            reason: format!("record `{id}` not found"),
        })?;
        let partial = f(&current);
        let merged = merge(current, partial);
        self.overlay
            .push((table.to_string(), id.to_string(), Some(merged)));
        Ok(())
    }

    /// Create the row or merge `update` into the existing one.
    pub fn upsert(
        &mut self,
        table: &str,
        id: &str,
        create: Value,
        update: Value,
    ) -> Result<(), EngineError> {
        match self.find_unique(table, id) {
            None => self.create(table, id, create),
            Some(current) => {
                let merged = merge(current, update);
                self.overlay
                    .push((table.to_string(), id.to_string(), Some(merged)));
                Ok(())
            }
        }
    }

    /// Merge `data` into every row matching `conditions`.
    pub fn update_many(
        &mut self,
        table: &str,
        conditions: &[Condition],
        data: Value,
    ) -> Result<(), EngineError> {
        let matching = self.find_many(
            table,
            &FindMany {
                conditions: conditions.to_vec(),
                ..Default::default()
            },
        );
        for (id, current) in matching {
            let merged = merge(current, data.clone());
            self.overlay.push((table.to_string(), id, Some(merged)));
        }
        Ok(())
    }

    /// Delete a row; returns `true` if it existed.
    pub fn delete(&mut self, table: &str, id: &str) -> bool {
        let existed = self.find_unique(table, id).is_some();
        if existed {
            self.overlay.push((table.to_string(), id.to_string(), None));
        }
        existed
    }

    /// Apply the buffered mutations and append their inverses to the WAL.
    pub fn commit(self) {
        let mut inner = self.store.inner.lock().unwrap();
        for (table, id, value) in self.overlay {
            let rows = inner.tables.entry(table.clone()).or_default();
            let prior = match &value {
                Some(v) => rows.insert(id.clone(), v.clone()),
                None => rows.remove(&id),
            };
            if let Some(position) = self.position {
                inner.wal.push(WalEntry {
                    position,
                    table,
                    id,
                    prior,
                });
            }
        }
    }

    /// Drop the buffered mutations.
    pub fn abort(self) {}
}

// ─── Value helpers ───────────────────────────────────────────────────────────

fn field_of<'v>(row: &'v Value, field: &str) -> Option<&'v Value> {
    row.get(field)
}

/// Shallow-merge `partial`'s fields over `base` (both objects), the
/// update semantics handlers expect. Non-object partials replace.
fn merge(base: Value, partial: Value) -> Value {
    match (base, partial) {
        (Value::Object(mut base), Value::Object(partial)) => {
            for (k, v) in partial {
                base.insert(k, v);
            }
            Value::Object(base)
        }
        (_, partial) => partial,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a
                .as_str()
                .unwrap_or_default()
                .cmp(b.as_str().unwrap_or_default()),
        },
    }
}

fn matches_condition(row: &Value, condition: &Condition) -> bool {
    use std::cmp::Ordering;
    let field = field_of(row, &condition.field);
    match condition.op {
        FilterOp::Eq => field == Some(&condition.value),
        FilterOp::Gt => compare_values(field, Some(&condition.value)) == Ordering::Greater,
        FilterOp::Gte => compare_values(field, Some(&condition.value)) != Ordering::Less,
        FilterOp::Lt => compare_values(field, Some(&condition.value)) == Ordering::Less,
        FilterOp::Lte => compare_values(field, Some(&condition.value)) != Ordering::Greater,
        FilterOp::In => condition
            .value
            .as_array()
            .is_some_and(|values| field.is_some_and(|f| values.contains(f))),
        FilterOp::NotIn => !condition
            .value
            .as_array()
            .is_some_and(|values| field.is_some_and(|f| values.contains(f))),
        FilterOp::Contains => match field {
            Some(Value::String(s)) => condition
                .value
                .as_str()
                .is_some_and(|needle| s.contains(needle)),
            Some(Value::Array(items)) => items.contains(&condition.value),
            _ => false,
        },
        FilterOp::StartsWith => field
            .and_then(Value::as_str)
            .zip(condition.value.as_str())
            .is_some_and(|(s, prefix)| s.starts_with(prefix)),
        FilterOp::EndsWith => field
            .and_then(Value::as_str)
            .zip(condition.value.as_str())
            .is_some_and(|(s, suffix)| s.ends_with(suffix)),
    }
}
