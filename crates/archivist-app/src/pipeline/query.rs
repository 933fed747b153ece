use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};

/// Path of the id list inside a saved set document.
pub const SET_IDS_PATH: &str = "ids";

/// Query clause sent to the document index (Elasticsearch query DSL).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct IndexQuery(Value);

impl IndexQuery {
    pub fn match_all() -> Self {
        IndexQuery(json!({ "match_all": {} }))
    }

    /// Records whose `field` is at or before `cutoff`.
    pub fn updated_up_to(field: &str, cutoff: DateTime<Utc>) -> Self {
        debug_assert!(!field.is_empty());
        IndexQuery(json!({
            "range": {
                field: { "lte": format_instant(cutoff) }
            }
        }))
    }

    /// Records whose `id_field` appears in the saved set `set_id` (terms lookup).
    pub fn in_saved_set(id_field: &str, sets_index: &str, set_id: &str) -> Self {
        debug_assert!(!id_field.is_empty());
        debug_assert!(!set_id.is_empty());
        IndexQuery(json!({
            "terms": {
                id_field: {
                    "index": sets_index,
                    "id": set_id,
                    "path": SET_IDS_PATH,
                }
            }
        }))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for IndexQuery {
    fn from(value: Value) -> Self {
        IndexQuery(value)
    }
}

pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}
