//! Update-expression and filter evaluation on in-memory documents
//!
//! Covers the subset the buffer produces itself: replacement documents,
//! `$set`, `$unset` and `$inc` with dotted paths, and equality filters with
//! `$eq`, `$ne`, `$in` and `$exists`. Used by the cache projector and the
//! in-memory document store.

use bson::{Bson, Document};

use crate::types::{BufferError, Result};

/// Whether an update expression uses operators (`$set`, ...) rather than
/// being a replacement document
pub fn is_operator_update(update: &Document) -> bool {
    update.keys().next().is_some_and(|k| k.starts_with('$'))
}

/// Apply an update expression to a document in place.
///
/// Replacement documents keep the target's `_id`.
pub fn apply_update(target: &mut Document, update: &Document) -> Result<()> {
    if !is_operator_update(update) {
        let id = target.get("_id").cloned();
        *target = update.clone();
        if let Some(id) = id {
            if !target.contains_key("_id") {
                target.insert("_id", id);
            }
        }
        return Ok(());
    }

    for (operator, fields) in update {
        let fields = fields.as_document().ok_or_else(|| {
            BufferError::InvalidOperation(format!("{} expects a document", operator))
        })?;

        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(target, path, value.clone())?;
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    unset_path(target, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let current = get_path(target, path).cloned();
                    let next = add_numbers(current.as_ref(), delta)?;
                    set_path(target, path, next)?;
                }
            }
            other => {
                return Err(BufferError::InvalidOperation(format!(
                    "unsupported update operator {}",
                    other
                )));
            }
        }
    }

    Ok(())
}

/// Build the document an upsert inserts when nothing matched
pub fn upsert_document(filter: &Document, update: &Document) -> Result<Document> {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        if let Bson::Document(inner) = value {
            if is_operator_update(inner) {
                continue;
            }
        }
        set_path(&mut seed, key, value.clone())?;
    }
    apply_update(&mut seed, update)?;
    Ok(seed)
}

/// Check whether a document matches a filter
pub fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(path, expected)| {
        let actual = get_path(document, path);
        match expected {
            Bson::Document(ops) if is_operator_update(ops) => {
                ops.iter().all(|(op, arg)| match op.as_str() {
                    "$eq" => actual.is_some_and(|a| values_equal(a, arg)),
                    "$ne" => !actual.is_some_and(|a| values_equal(a, arg)),
                    "$in" => match (actual, arg) {
                        (Some(a), Bson::Array(items)) => items.iter().any(|i| values_equal(a, i)),
                        _ => false,
                    },
                    "$exists" => actual.is_some() == arg.as_bool().unwrap_or(true),
                    _ => false,
                })
            }
            _ => actual.is_some_and(|a| values_equal(a, expected)),
        }
    })
}

/// Equality that treats Int32, Int64 and Double of the same value as equal
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Read a dotted path
pub fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }
    Some(current)
}

fn set_path(document: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !document.contains_key(head) {
                document.insert(head, Document::new());
            }
            match document.get_mut(head) {
                Some(Bson::Document(inner)) => set_path(inner, rest, value),
                _ => Err(BufferError::InvalidOperation(format!(
                    "cannot set '{}': '{}' is not a document",
                    path, head
                ))),
            }
        }
    }
}

fn unset_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = document.get_mut(head) {
                unset_path(inner, rest);
            }
        }
    }
}

fn add_numbers(current: Option<&Bson>, delta: &Bson) -> Result<Bson> {
    let sum = match (current, delta) {
        (None, d) if as_f64(d).is_some() => d.clone(),
        (Some(Bson::Int32(a)), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(v) => Bson::Int32(v),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Some(Bson::Int32(a)), Bson::Int64(b)) => Bson::Int64(i64::from(*a) + b),
        (Some(Bson::Int64(a)), Bson::Int32(b)) => Bson::Int64(a + i64::from(*b)),
        (Some(Bson::Int64(a)), Bson::Int64(b)) => Bson::Int64(a + b),
        (Some(a), b) => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => Bson::Double(x + y),
            _ => {
                return Err(BufferError::InvalidOperation(
                    "$inc applies only to numeric fields".into(),
                ))
            }
        },
        _ => {
            return Err(BufferError::InvalidOperation(
                "$inc requires a numeric delta".into(),
            ))
        }
    };
    Ok(sum)
}
