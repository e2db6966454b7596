//! Schemaless records stored in the JSON collections.
//!
//! Records are plain JSON objects; the only field the store relies on is `id`.
//! Conversations additionally carry an ordered `participantIds` array, which
//! join/leave mutate through the helpers below.

use serde_json::{Map, Value};

use crate::ids::UserId;

pub type Record = Map<String, Value>;

pub const ID_FIELD: &str = "id";
pub const PARTICIPANTS_FIELD: &str = "participantIds";

pub fn record_id(record: &Record) -> Option<&Value> {
    record.get(ID_FIELD)
}

/// Compare two id values. Integers compare numerically, so `5` and `5.0`
/// address the same record; everything else compares structurally.
pub fn ids_match(a: &Value, b: &Value) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

pub fn participant_ids(record: &Record) -> Vec<UserId> {
    record
        .get(PARTICIPANTS_FIELD)
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_i64).map(UserId).collect())
        .unwrap_or_default()
}

pub fn is_participant(record: &Record, user: UserId) -> bool {
    participant_ids(record).contains(&user)
}

/// Append `user` to the conversation's participants. Returns `false` when
/// the user was already a member (the record is left untouched).
pub fn add_participant(record: &mut Record, user: UserId) -> bool {
    if is_participant(record, user) {
        return false;
    }
    let entry = record
        .entry(PARTICIPANTS_FIELD)
        .or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
        *entry = Value::Array(Vec::new());
    }
    if let Value::Array(ids) = entry {
        ids.push(Value::from(user.get()));
    }
    true
}

/// Remove every occurrence of `user`. Returns `false` when the user was not
/// a member.
pub fn remove_participant(record: &mut Record, user: UserId) -> bool {
    let Some(Value::Array(ids)) = record.get_mut(PARTICIPANTS_FIELD) else {
        return false;
    };
    let before = ids.len();
    ids.retain(|v| v.as_i64() != Some(user.get()));
    ids.len() != before
}
