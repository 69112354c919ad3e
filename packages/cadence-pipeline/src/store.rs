use cadence_scheduler::{AsyncOperation, Callback, EventLoop, Phase};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{collection} {id} does not exist")]
    NotFound { collection: String, id: u64 },
    #[error("unknown collection `{0}`")]
    UnknownCollection(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

/// Selects records by field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// Every listed field equals the given value.
    Eq(Vec<(String, Value)>),
    /// The string field contains `needle`, ignoring case.
    Contains { field: String, needle: String },
    /// The field equals one of `values`.
    AnyOf { field: String, values: Vec<Value> },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(vec![(field.into(), value.into())])
    }

    /// Adds another equality to an `Eq` filter; other filters are replaced.
    pub fn and(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        match self {
            Filter::Eq(mut pairs) => {
                pairs.push((field.into(), value.into()));
                Filter::Eq(pairs)
            }
            _ => Filter::eq(field, value),
        }
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Filter::Contains {
            field: field.into(),
            needle: needle.into(),
        }
    }

    pub fn any_of<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::AnyOf {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(pairs) => pairs
                .iter()
                .all(|(field, expected)| record.get(field) == Some(expected)),
            Filter::Contains { field, needle } => record
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|text| text.to_lowercase().contains(&needle.to_lowercase())),
            Filter::AnyOf { field, values } => record
                .get(field)
                .is_some_and(|value| values.contains(value)),
        }
    }
}

/// Record storage consumed by the data-access stages.
///
/// Every call returns immediately with a pending operation that settles
/// later on the loop; implementations never block.
pub trait Datastore {
    fn find(&self, lp: &EventLoop, collection: &str, id: u64) -> AsyncOperation<Value, StoreError>;

    /// Matching records as a JSON array, in id order.
    fn find_many(
        &self,
        lp: &EventLoop,
        collection: &str,
        filter: Filter,
    ) -> AsyncOperation<Value, StoreError>;

    /// Stores `record` under a fresh id and yields that id.
    fn create(&self, lp: &EventLoop, collection: &str, record: Value) -> AsyncOperation<u64, StoreError>;

    /// Merges `patch` into the record; yields the number of records changed.
    fn update(
        &self,
        lp: &EventLoop,
        collection: &str,
        id: u64,
        patch: Value,
    ) -> AsyncOperation<u64, StoreError>;

    fn remove(&self, lp: &EventLoop, collection: &str, id: u64) -> AsyncOperation<u64, StoreError>;

    fn update_where(
        &self,
        lp: &EventLoop,
        collection: &str,
        filter: Filter,
        patch: Value,
    ) -> AsyncOperation<u64, StoreError>;

    fn remove_where(
        &self,
        lp: &EventLoop,
        collection: &str,
        filter: Filter,
    ) -> AsyncOperation<u64, StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Simulated latency per call. Zero settles in the next I/O phase.
    pub latency_ms: u64,
}

#[derive(Debug, Default)]
struct Collection {
    next_id: u64,
    records: BTreeMap<u64, Value>,
}

impl Collection {
    fn insert(&mut self, record: Value) -> Result<u64, StoreError> {
        let Value::Object(mut fields) = record else {
            return Err(StoreError::InvalidRecord("records must be JSON objects".into()));
        };
        let id = match fields.get("id").and_then(Value::as_u64) {
            Some(id) if self.records.contains_key(&id) => {
                return Err(StoreError::InvalidRecord(format!("duplicate id {id}")));
            }
            Some(id) => id,
            None => self
                .next_id
                .checked_add(1)
                .ok_or_else(|| StoreError::InvalidRecord("record ids exhausted".into()))?,
        };
        self.next_id = self.next_id.max(id);
        fields.insert("id".into(), Value::from(id));
        self.records.insert(id, Value::Object(fields));
        Ok(id)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    collections: FxHashMap<String, Collection>,
    failures: Vec<String>,
}

impl StoreState {
    fn collection(&mut self, name: &str) -> Result<&mut Collection, StoreError> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }
}

/// In-memory [`Datastore`] with numeric ids per collection.
///
/// Clones share the same records. Calls run their query when the
/// simulated I/O completes, not when they are issued.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Rc<RefCell<StoreState>>,
    config: StoreConfig,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            state: Rc::default(),
            config,
        }
    }

    pub fn with_collection(self, name: &str) -> Self {
        self.state
            .borrow_mut()
            .collections
            .entry(name.to_string())
            .or_default();
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Inserts records directly, bypassing the loop. Records without an
    /// `id` get the next free one.
    pub fn seed(&self, collection: &str, records: Vec<Value>) -> Result<Vec<u64>, StoreError> {
        let mut state = self.state.borrow_mut();
        let collection = state.collection(collection)?;
        records
            .into_iter()
            .map(|record| collection.insert(record))
            .collect()
    }

    /// Seeds from a JSON object mapping collection names to record arrays.
    pub fn seed_json(&self, json: &str) -> Result<usize, StoreError> {
        let parsed: BTreeMap<String, Vec<Value>> = serde_json::from_str(json)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        let mut total = 0;
        for (collection, records) in parsed {
            total += self.seed(&collection, records)?.len();
        }
        tracing::debug!(records = total, "datastore seeded");
        Ok(total)
    }

    /// Makes the next call fail with `Unavailable(message)`. Queued
    /// failures are consumed one per call, oldest first.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state.borrow_mut().failures.push(message.into());
    }

    /// Current record, read synchronously.
    pub fn get(&self, collection: &str, id: u64) -> Option<Value> {
        self.state
            .borrow()
            .collections
            .get(collection)
            .and_then(|c| c.records.get(&id).cloned())
    }

    pub fn count(&self, collection: &str) -> usize {
        self.state
            .borrow()
            .collections
            .get(collection)
            .map_or(0, |c| c.records.len())
    }

    fn submit<T, F>(&self, lp: &EventLoop, label: &'static str, query: F) -> AsyncOperation<T, StoreError>
    where
        T: Clone + 'static,
        F: FnOnce(&mut StoreState) -> Result<T, StoreError> + 'static,
    {
        let operation = AsyncOperation::new(lp);
        let state = self.state.clone();
        let target = operation.clone();
        let complete = move |_: &EventLoop| {
            let outcome = {
                let mut state = state.borrow_mut();
                if state.failures.is_empty() {
                    query(&mut state)
                } else {
                    Err(StoreError::Unavailable(state.failures.remove(0)))
                }
            };
            let settled = match outcome {
                Ok(value) => target.complete(value),
                Err(error) => {
                    tracing::debug!(call = label, %error, "datastore call failed");
                    target.fail(error)
                }
            };
            if let Err(error) = settled {
                tracing::warn!(call = label, %error, "datastore result discarded");
            }
        };

        tracing::trace!(call = label, latency_ms = self.config.latency_ms, "datastore call issued");
        if self.config.latency_ms == 0 {
            lp.enqueue_task(Phase::Io, Callback::new(complete).with_label(label));
        } else {
            lp.set_timeout(self.config.latency_ms, complete);
        }
        operation
    }
}

fn merge(record: &mut Value, patch: &Map<String, Value>) {
    if let Value::Object(fields) = record {
        for (key, value) in patch {
            if key != "id" {
                fields.insert(key.clone(), value.clone());
            }
        }
    }
}

fn patch_fields(patch: Value) -> Result<Map<String, Value>, StoreError> {
    match patch {
        Value::Object(fields) => Ok(fields),
        _ => Err(StoreError::InvalidRecord("patch must be a JSON object".into())),
    }
}

impl Datastore for MemoryStore {
    fn find(&self, lp: &EventLoop, collection: &str, id: u64) -> AsyncOperation<Value, StoreError> {
        let name = collection.to_string();
        self.submit(lp, "find", move |state| {
            state
                .collection(&name)?
                .records
                .get(&id)
                .cloned()
                .ok_or(StoreError::NotFound {
                    collection: name.clone(),
                    id,
                })
        })
    }

    fn find_many(
        &self,
        lp: &EventLoop,
        collection: &str,
        filter: Filter,
    ) -> AsyncOperation<Value, StoreError> {
        let name = collection.to_string();
        self.submit(lp, "find_many", move |state| {
            let records = state
                .collection(&name)?
                .records
                .values()
                .filter(|record| filter.matches(record))
                .cloned()
                .collect();
            Ok(Value::Array(records))
        })
    }

    fn create(&self, lp: &EventLoop, collection: &str, record: Value) -> AsyncOperation<u64, StoreError> {
        let name = collection.to_string();
        self.submit(lp, "create", move |state| {
            let mut record = record;
            if let Value::Object(fields) = &mut record {
                fields.remove("id");
            }
            state.collection(&name)?.insert(record)
        })
    }

    fn update(
        &self,
        lp: &EventLoop,
        collection: &str,
        id: u64,
        patch: Value,
    ) -> AsyncOperation<u64, StoreError> {
        let name = collection.to_string();
        self.submit(lp, "update", move |state| {
            let patch = patch_fields(patch)?;
            match state.collection(&name)?.records.get_mut(&id) {
                Some(record) => {
                    merge(record, &patch);
                    Ok(1)
                }
                None => Ok(0),
            }
        })
    }

    fn remove(&self, lp: &EventLoop, collection: &str, id: u64) -> AsyncOperation<u64, StoreError> {
        let name = collection.to_string();
        self.submit(lp, "remove", move |state| {
            Ok(u64::from(state.collection(&name)?.records.remove(&id).is_some()))
        })
    }

    fn update_where(
        &self,
        lp: &EventLoop,
        collection: &str,
        filter: Filter,
        patch: Value,
    ) -> AsyncOperation<u64, StoreError> {
        let name = collection.to_string();
        self.submit(lp, "update_where", move |state| {
            let patch = patch_fields(patch)?;
            let mut changed = 0;
            for record in state.collection(&name)?.records.values_mut() {
                if filter.matches(record) {
                    merge(record, &patch);
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    fn remove_where(
        &self,
        lp: &EventLoop,
        collection: &str,
        filter: Filter,
    ) -> AsyncOperation<u64, StoreError> {
        let name = collection.to_string();
        self.submit(lp, "remove_where", move |state| {
            let records = &mut state.collection(&name)?.records;
            let before = records.len();
            records.retain(|_, record| !filter.matches(record));
            Ok((before - records.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_scheduler::{Clock, ManualClock};
    use serde_json::json;

    fn setup(latency_ms: u64) -> (ManualClock, EventLoop, MemoryStore) {
        let clock = ManualClock::new();
        let lp = EventLoop::builder().clock(clock.clone()).build();
        let store = MemoryStore::new(StoreConfig { latency_ms }).with_collection("item");
        (clock, lp, store)
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let (_, lp, store) = setup(0);
        let first = store.create(&lp, "item", json!({ "description": "milk" }));
        let second = store.create(&lp, "item", json!({ "id": 99, "description": "eggs" }));
        lp.run().unwrap();

        assert_eq!(first.result(), Some(1));
        assert_eq!(second.result(), Some(2));
        assert_eq!(store.get("item", 2), Some(json!({ "id": 2, "description": "eggs" })));
    }

    #[test]
    fn test_latency_settles_from_timer() {
        let (clock, lp, store) = setup(25);
        store.seed("item", vec![json!({ "description": "bread" })]).unwrap();
        let found = store.find(&lp, "item", 1);

        assert!(lp.tick());
        assert!(found.is_pending());

        lp.run().unwrap();
        assert_eq!(clock.now(), 25);
        assert_eq!(found.result(), Some(json!({ "id": 1, "description": "bread" })));
    }

    #[test]
    fn test_missing_record_and_collection() {
        let (_, lp, store) = setup(0);
        let missing = store.find(&lp, "item", 42);
        let unknown = store.find_many(&lp, "brand", Filter::All);
        lp.run().unwrap();

        assert_eq!(
            missing.error(),
            Some(StoreError::NotFound {
                collection: "item".into(),
                id: 42
            })
        );
        assert_eq!(unknown.error(), Some(StoreError::UnknownCollection("brand".into())));
    }

    #[test]
    fn test_injected_failure_hits_next_call_only() {
        let (_, lp, store) = setup(0);
        store.fail_next("disk on fire");
        let failed = store.find_many(&lp, "item", Filter::All);
        let fine = store.find_many(&lp, "item", Filter::All);
        lp.run().unwrap();

        assert_eq!(failed.error(), Some(StoreError::Unavailable("disk on fire".into())));
        assert_eq!(fine.result(), Some(json!([])));
    }

    #[test]
    fn test_where_variants_use_filters() {
        let (_, lp, store) = setup(0);
        store
            .seed(
                "item",
                vec![
                    json!({ "list": 1, "sku": 10, "quantity": 1 }),
                    json!({ "list": 1, "sku": 11, "quantity": 1 }),
                    json!({ "list": 2, "sku": 10, "quantity": 1 }),
                ],
            )
            .unwrap();

        let updated = store.update_where(
            &lp,
            "item",
            Filter::eq("list", 1).and("sku", 10),
            json!({ "quantity": 4 }),
        );
        let removed = store.remove_where(&lp, "item", Filter::eq("list", 2));
        lp.run().unwrap();

        assert_eq!(updated.result(), Some(1));
        assert_eq!(removed.result(), Some(1));
        assert_eq!(store.get("item", 1).unwrap()["quantity"], json!(4));
        assert_eq!(store.count("item"), 2);
    }

    #[test]
    fn test_exhausted_ids_are_an_error() {
        let (_, lp, store) = setup(0);
        store.seed("item", vec![json!({ "id": u64::MAX })]).unwrap();
        let created = store.create(&lp, "item", json!({ "description": "one more" }));
        lp.run().unwrap();

        assert_eq!(
            created.error(),
            Some(StoreError::InvalidRecord("record ids exhausted".into()))
        );
        assert_eq!(store.count("item"), 1);
    }

    #[test]
    fn test_any_of_matches_listed_values() {
        let filter = Filter::any_of("id", [1u64, 3]);
        assert!(filter.matches(&json!({ "id": 3 })));
        assert!(!filter.matches(&json!({ "id": 2 })));
        assert!(!Filter::any_of("id", Vec::<u64>::new()).matches(&json!({ "id": 1 })));
    }

    #[test]
    fn test_contains_is_case_insensitive() {
        let filter = Filter::contains("description", "MILK");
        assert!(filter.matches(&json!({ "description": "Whole milk" })));
        assert!(!filter.matches(&json!({ "description": "Bread" })));
        assert!(!filter.matches(&json!({ "upc": "123" })));
    }
}
