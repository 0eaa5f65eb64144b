//! Shell scripts evaluated by `mongosh`.

use super::IndexSpec;

pub const PING: &str = "db.adminCommand({ ping: 1 }).ok";

pub const DROP_DATABASE: &str = "db.dropDatabase().ok";

pub const COLLECTION_COUNTS: &str = "JSON.stringify(db.getCollectionNames().sort().map(function (name) { return { name: name, count: db.getCollection(name).countDocuments({}) }; }))";

pub const EXPORT_USERS: &str =
    "JSON.stringify(db.system.users.find({}, { credentials: 0 }).toArray())";

/// Quote a value as a JavaScript string literal.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

pub fn create_index(collection: &str, index: &IndexSpec<'_>) -> String {
    format!(
        "db.getCollection({}).createIndex({{ {}: 1 }}, {{ unique: {}, sparse: {} }})",
        js_string(collection),
        js_string(index.field),
        index.unique,
        index.sparse
    )
}

/// Distinct string values of `field`, as a JSON array.
pub fn distinct(collection: &str, field: &str) -> String {
    format!(
        "JSON.stringify(db.getCollection({}).distinct({}).filter(function (v) {{ return typeof v === 'string'; }}))",
        js_string(collection),
        js_string(field)
    )
}
