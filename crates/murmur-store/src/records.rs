//! Named record collections backed by one JSON array file each.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, instrument};

use murmur_core::records::{ids_match, record_id, Record, ID_FIELD};

use crate::error::StoreError;
use crate::json_file;

/// How a collection assigns record identity on append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdPolicy {
    /// `max(id) + 1`, starting at 1. Any caller-supplied id is overwritten.
    Sequential,
    /// Caller provides `id`; appending an existing id is a conflict.
    CallerSupplied,
    /// Caller provides `id`; appending an existing id replaces that record.
    Upsert,
    /// Stored exactly as given, no identity checks.
    Unmanaged,
}

#[derive(Clone, Debug)]
pub struct CollectionSpec {
    pub name: &'static str,
    pub id_policy: IdPolicy,
    /// Fields whose values must be unique across the collection.
    pub unique_fields: &'static [&'static str],
    /// Filled in when absent on append.
    pub defaults: Vec<(&'static str, Value)>,
    /// Always written on append, whatever the caller sent.
    pub forced: Vec<(&'static str, Value)>,
}

impl CollectionSpec {
    pub fn users() -> Self {
        Self {
            name: "users",
            id_policy: IdPolicy::Sequential,
            unique_fields: &["email"],
            defaults: vec![("picture", Value::Null)],
            forced: Vec::new(),
        }
    }

    pub fn devices() -> Self {
        Self {
            name: "devices",
            id_policy: IdPolicy::Upsert,
            unique_fields: &[],
            defaults: Vec::new(),
            forced: vec![("state", Value::from("active"))],
        }
    }

    pub fn conversations() -> Self {
        Self {
            name: "conversations",
            id_policy: IdPolicy::CallerSupplied,
            unique_fields: &[],
            defaults: vec![("participantIds", Value::Array(Vec::new()))],
            forced: Vec::new(),
        }
    }

    pub fn conversation_permissions() -> Self {
        Self {
            name: "conversation_permissions",
            id_policy: IdPolicy::Unmanaged,
            unique_fields: &[],
            defaults: Vec::new(),
            forced: Vec::new(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.name)
    }
}

/// A collection of schemaless records.
///
/// The `RwLock` is the collection's access token: reads share it, every write
/// holds it exclusively across the whole read-modify-persist sequence.
pub struct RecordStore {
    spec: CollectionSpec,
    path: PathBuf,
    lock: RwLock<()>,
}

impl RecordStore {
    /// Open the collection in `dir`, creating an empty file if needed.
    pub fn open(dir: &Path, spec: CollectionSpec) -> Result<Self, StoreError> {
        let path = dir.join(spec.file_name());
        json_file::ensure_array_file(&path)?;
        Ok(Self {
            spec,
            path,
            lock: RwLock::new(()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn list_all(&self) -> Result<Vec<Record>, StoreError> {
        let _guard = self.lock.read();
        self.load()
    }

    pub fn get(&self, id: &Value) -> Result<Record, StoreError> {
        self.find(|r| record_id(r).is_some_and(|rid| ids_match(rid, id)))?
            .ok_or_else(|| StoreError::NotFound(format!("{} {id}", self.spec.name)))
    }

    /// First record whose `field` equals `value`.
    pub fn find_by(&self, field: &str, value: &Value) -> Result<Option<Record>, StoreError> {
        self.find(|r| r.get(field).is_some_and(|v| ids_match(v, value)))
    }

    pub fn find<F>(&self, predicate: F) -> Result<Option<Record>, StoreError>
    where
        F: Fn(&Record) -> bool,
    {
        let _guard = self.lock.read();
        Ok(self.load()?.into_iter().find(|r| predicate(r)))
    }

    /// Append a record, applying the collection's id policy, defaults and
    /// uniqueness constraints. Returns the stored copy.
    #[instrument(skip(self, record), fields(collection = self.spec.name))]
    pub fn append(&self, mut record: Record) -> Result<Record, StoreError> {
        let _guard = self.lock.write();
        let mut rows = self.load()?;

        for field in self.spec.unique_fields {
            if let Some(value) = record.get(*field) {
                if rows.iter().any(|r| r.get(*field) == Some(value)) {
                    return Err(StoreError::Conflict(format!(
                        "{} with {field} {value} already exists",
                        self.spec.name
                    )));
                }
            }
        }

        for (field, value) in &self.spec.defaults {
            record
                .entry(field.to_string())
                .or_insert_with(|| value.clone());
        }
        for (field, value) in &self.spec.forced {
            record.insert(field.to_string(), value.clone());
        }

        match self.spec.id_policy {
            IdPolicy::Sequential => {
                let next = rows
                    .iter()
                    .filter_map(|r| record_id(r).and_then(Value::as_i64))
                    .max()
                    .unwrap_or(0)
                    + 1;
                record.insert(ID_FIELD.into(), Value::from(next));
                rows.push(record.clone());
            }
            IdPolicy::CallerSupplied | IdPolicy::Upsert => {
                let id = self.require_id(&record)?;
                let existing = rows
                    .iter()
                    .position(|r| record_id(r).is_some_and(|rid| ids_match(rid, &id)));
                match (existing, self.spec.id_policy) {
                    (Some(_), IdPolicy::CallerSupplied) => {
                        return Err(StoreError::Conflict(format!(
                            "{} {id} already exists",
                            self.spec.name
                        )));
                    }
                    (Some(pos), _) => rows[pos] = record.clone(),
                    (None, _) => rows.push(record.clone()),
                }
            }
            IdPolicy::Unmanaged => rows.push(record.clone()),
        }

        self.save(&rows)?;
        debug!(id = ?record_id(&record), count = rows.len(), "record appended");
        Ok(record)
    }

    /// Replace the stored record with the same id.
    #[instrument(skip(self, record), fields(collection = self.spec.name))]
    pub fn update(&self, record: Record) -> Result<(), StoreError> {
        let id = self.require_id(&record)?;
        let _guard = self.lock.write();
        let mut rows = self.load()?;
        let slot = rows
            .iter_mut()
            .find(|r| record_id(r).is_some_and(|rid| ids_match(rid, &id)))
            .ok_or_else(|| StoreError::NotFound(format!("{} {id}", self.spec.name)))?;
        *slot = record;
        self.save(&rows)
    }

    /// Read-modify-write a single record under the collection's exclusive
    /// token. `f` returns whether it changed the record; unchanged records
    /// are not rewritten. Returns the record as it stands afterwards.
    #[instrument(skip(self, f), fields(collection = self.spec.name))]
    pub fn modify<F>(&self, id: &Value, f: F) -> Result<(Record, bool), StoreError>
    where
        F: FnOnce(&mut Record) -> bool,
    {
        let _guard = self.lock.write();
        let mut rows = self.load()?;
        let slot = rows
            .iter_mut()
            .find(|r| record_id(r).is_some_and(|rid| ids_match(rid, id)))
            .ok_or_else(|| StoreError::NotFound(format!("{} {id}", self.spec.name)))?;

        let changed = f(slot);
        let updated = slot.clone();
        if changed {
            self.save(&rows)?;
        }
        Ok((updated, changed))
    }

    fn require_id(&self, record: &Record) -> Result<Value, StoreError> {
        match record_id(record) {
            Some(id @ (Value::String(_) | Value::Number(_))) => Ok(id.clone()),
            _ => Err(StoreError::InvalidKey(format!(
                "{} record requires a string or numeric id",
                self.spec.name
            ))),
        }
    }

    fn load(&self) -> Result<Vec<Record>, StoreError> {
        json_file::read_array(&self.path)
    }

    fn save(&self, rows: &[Record]) -> Result<(), StoreError> {
        json_file::write_atomic(&self.path, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn rec(v: Value) -> Record {
        match v {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn users(dir: &TempDir) -> RecordStore {
        RecordStore::open(dir.path(), CollectionSpec::users()).unwrap()
    }

    #[test]
    fn open_creates_empty_file() {
        let dir = TempDir::new().unwrap();
        let store = users(&dir);
        assert!(dir.path().join("users.json").exists());
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn sequential_ids_start_at_one() {
        let dir = TempDir::new().unwrap();
        let store = users(&dir);
        let a = store.append(rec(json!({"email": "a@x", "name": "A"}))).unwrap();
        let b = store.append(rec(json!({"email": "b@x", "name": "B", "id": 77}))).unwrap();
        assert_eq!(a["id"], 1);
        assert_eq!(b["id"], 2);
    }

    #[test]
    fn duplicate_email_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = users(&dir);
        store.append(rec(json!({"email": "a@x"}))).unwrap();
        let err = store.append(rec(json!({"email": "a@x"}))).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn missing_picture_defaults_to_null() {
        let dir = TempDir::new().unwrap();
        let store = users(&dir);
        let user = store.append(rec(json!({"email": "a@x"}))).unwrap();
        assert_eq!(user.get("picture"), Some(&Value::Null));

        let user = store
            .append(rec(json!({"email": "b@x", "picture": "p.png"})))
            .unwrap();
        assert_eq!(user["picture"], "p.png");
    }

    #[test]
    fn device_upsert_replaces_and_activates() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path(), CollectionSpec::devices()).unwrap();
        store
            .append(rec(json!({"id": "dev1", "ownerId": 1, "state": "blocked"})))
            .unwrap();
        let again = store
            .append(rec(json!({"id": "dev1", "ownerId": 2})))
            .unwrap();
        assert_eq!(again["state"], "active");

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["ownerId"], 2);
    }

    #[test]
    fn device_without_id_rejected() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path(), CollectionSpec::devices()).unwrap();
        let err = store.append(rec(json!({"ownerId": 1}))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[test]
    fn conversation_duplicate_id_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path(), CollectionSpec::conversations()).unwrap();
        let conv = store.append(rec(json!({"id": "c1"}))).unwrap();
        assert_eq!(conv["participantIds"], json!([]));
        let err = store.append(rec(json!({"id": "c1"}))).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn get_and_find_by() {
        let dir = TempDir::new().unwrap();
        let store = users(&dir);
        store.append(rec(json!({"email": "a@x", "name": "A"}))).unwrap();
        store.append(rec(json!({"email": "b@x", "name": "B"}))).unwrap();

        assert_eq!(store.get(&json!(2)).unwrap()["name"], "B");
        assert!(matches!(
            store.get(&json!(3)).unwrap_err(),
            StoreError::NotFound(_)
        ));

        let found = store.find_by("email", &json!("a@x")).unwrap().unwrap();
        assert_eq!(found["id"], 1);
        assert!(store.find_by("email", &json!("z@x")).unwrap().is_none());
    }

    #[test]
    fn find_matches_compound_predicate() {
        let dir = TempDir::new().unwrap();
        let store =
            RecordStore::open(dir.path(), CollectionSpec::conversation_permissions()).unwrap();
        store
            .append(rec(json!({"conversationKeyId": "k1", "ownerId": 1, "conversationId": "c1"})))
            .unwrap();
        store
            .append(rec(json!({"conversationKeyId": "k1", "ownerId": 2, "conversationId": "c1"})))
            .unwrap();

        let hit = store
            .find(|r| r["conversationKeyId"] == "k1" && r["ownerId"] == 2)
            .unwrap()
            .unwrap();
        assert_eq!(hit["ownerId"], 2);
        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[test]
    fn update_replaces_whole_record() {
        let dir = TempDir::new().unwrap();
        let store = users(&dir);
        store.append(rec(json!({"email": "a@x", "name": "A"}))).unwrap();
        store
            .update(rec(json!({"id": 1, "email": "a@x", "name": "Renamed"})))
            .unwrap();
        let user = store.get(&json!(1)).unwrap();
        assert_eq!(user["name"], "Renamed");
        assert!(user.get("picture").is_none());
    }

    #[test]
    fn update_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = users(&dir);
        let err = store.update(rec(json!({"id": 9}))).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn modify_skips_write_when_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path(), CollectionSpec::conversations()).unwrap();
        store.append(rec(json!({"id": "c1", "title": "t"}))).unwrap();

        let (after, changed) = store.modify(&json!("c1"), |_| false).unwrap();
        assert!(!changed);
        assert_eq!(after["title"], "t");

        let (after, changed) = store
            .modify(&json!("c1"), |r| {
                r.insert("title".into(), json!("u"));
                true
            })
            .unwrap();
        assert!(changed);
        assert_eq!(after["title"], "u");
        assert_eq!(store.get(&json!("c1")).unwrap()["title"], "u");
    }

    #[test]
    fn concurrent_modify_loses_no_updates() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::open(dir.path(), CollectionSpec::conversations()).unwrap());
        store.append(rec(json!({"id": "c1"}))).unwrap();

        let handles: Vec<_> = (1..=16)
            .map(|user| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .modify(&json!("c1"), |r| {
                            murmur_core::records::add_participant(r, murmur_core::UserId(user))
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let conv = store.get(&json!("c1")).unwrap();
        assert_eq!(murmur_core::records::participant_ids(&conv).len(), 16);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        users(&dir).append(rec(json!({"email": "a@x"}))).unwrap();
        let reopened = users(&dir);
        assert_eq!(reopened.list_all().unwrap().len(), 1);
    }
}
