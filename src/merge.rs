use crate::errors::{EngineError, EngineResult};
use crate::models::{Bookmark, BookmarkGroup};
use crate::registry::parse_timestamp;
use serde_json::{json, Map, Value};
use uuid::Uuid;

const UNTITLED_GROUP_NAME: &str = "Untitled";
const MAX_REPORTED_SCHEMA_ERRORS: usize = 3;

pub fn new_group_id() -> String {
    format!("grp_{}", Uuid::new_v4().simple())
}

pub fn new_bookmark_id() -> String {
    format!("bm_{}", Uuid::new_v4().simple())
}

/// Maps loosely shaped group/bookmark objects into canonical groups. Missing
/// ids are allocated; a bookmark without a name is named after its URL and a
/// bookmark without a URL is dropped.
pub fn normalize(raw_groups: &[Value]) -> Vec<BookmarkGroup> {
    raw_groups
        .iter()
        .filter_map(Value::as_object)
        .map(|object| {
            let bookmarks = first_array(object, &["bookmarks", "items", "children"])
                .map(|items| items.iter().filter_map(normalize_bookmark).collect())
                .unwrap_or_default();
            BookmarkGroup {
                id: id_field(object).unwrap_or_else(new_group_id),
                group_name: first_text(object, &["groupName", "name", "title"])
                    .unwrap_or_else(|| UNTITLED_GROUP_NAME.to_string()),
                bookmarks,
            }
        })
        .collect()
}

fn normalize_bookmark(raw: &Value) -> Option<Bookmark> {
    let object = raw.as_object()?;
    let url = first_text(object, &["url", "href"])?;
    Some(Bookmark {
        id: id_field(object).unwrap_or_else(new_bookmark_id),
        name: first_text(object, &["name", "title"]).unwrap_or_else(|| url.clone()),
        favicon_url: first_text(object, &["faviconUrl", "favicon", "icon"]),
        created_at: object.get("createdAt").and_then(parse_timestamp),
        url,
    })
}

fn id_field(object: &Map<String, Value>) -> Option<String> {
    match object.get("id")? {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn first_text(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(ToString::to_string)
}

fn first_array<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Vec<Value>> {
    keys.iter().find_map(|key| object.get(*key).and_then(Value::as_array))
}

/// Inserts `new_groups` right before the first placeholder group, or appends
/// them when there is none.
pub fn insert_groups(current: &[BookmarkGroup], new_groups: Vec<BookmarkGroup>) -> Vec<BookmarkGroup> {
    let mut merged = current.to_vec();
    match merged.iter().position(BookmarkGroup::is_placeholder) {
        Some(index) => {
            merged.splice(index..index, new_groups);
        }
        None => merged.extend(new_groups),
    }
    merged
}

/// Keeps only the first placeholder group and, with `move_to_end`, puts it last.
pub fn ensure_single_empty(groups: Vec<BookmarkGroup>, move_to_end: bool) -> Vec<BookmarkGroup> {
    let mut seen = false;
    let mut placeholder = None;
    let mut kept = Vec::with_capacity(groups.len());
    for group in groups {
        if !group.is_placeholder() {
            kept.push(group);
            continue;
        }
        if seen {
            continue;
        }
        seen = true;
        if move_to_end {
            placeholder = Some(group);
        } else {
            kept.push(group);
        }
    }
    kept.extend(placeholder);
    kept
}

pub fn merge_groups(current: &[BookmarkGroup], new_groups: Vec<BookmarkGroup>) -> Vec<BookmarkGroup> {
    ensure_single_empty(insert_groups(current, new_groups), true)
}

fn upload_schema() -> Value {
    let group = json!({
        "type": "object",
        "properties": {
            "groupName": { "type": "string" },
            "bookmarks": { "type": "array", "items": { "type": "object" } },
            "items": { "type": "array", "items": { "type": "object" } },
            "children": { "type": "array", "items": { "type": "object" } }
        }
    });
    json!({
        "oneOf": [
            { "type": "array", "items": group.clone() },
            {
                "type": "object",
                "required": ["groups"],
                "properties": { "groups": { "type": "array", "items": group } }
            }
        ]
    })
}

/// Parses an uploaded export. Accepts a bare array of groups or an object
/// with a `groups` array.
pub fn parse_upload(raw: &str) -> EngineResult<Vec<Value>> {
    let value: Value = serde_json::from_str(raw.trim()).map_err(|err| {
        EngineError::Validation(format!(
            "Upload is not valid JSON (line {}, column {}): {}",
            err.line(),
            err.column(),
            err
        ))
    })?;

    let schema = upload_schema();
    let compiled = jsonschema::JSONSchema::compile(&schema)
        .map_err(|err| EngineError::Internal(format!("Failed to compile upload schema: {}", err)))?;
    let errors: Vec<String> = compiled
        .validate(&value)
        .err()
        .map(|errors| {
            errors
                .take(MAX_REPORTED_SCHEMA_ERRORS)
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    if !errors.is_empty() {
        return Err(EngineError::Validation(format!(
            "Upload does not look like a bookmark export: {}",
            errors.join("; ")
        )));
    }

    let groups = match value {
        Value::Array(groups) => groups,
        Value::Object(mut object) => match object.remove("groups") {
            Some(Value::Array(groups)) => groups,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    if groups.is_empty() {
        return Err(EngineError::Validation("Upload contains no groups".to_string()));
    }
    Ok(groups)
}

pub fn export_json(groups: &[BookmarkGroup]) -> EngineResult<String> {
    Ok(serde_json::to_string_pretty(groups)?)
}
