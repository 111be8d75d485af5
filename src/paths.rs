//! Path semantics over [`ResourceId`]s.
//!
//! A directory is named by a trailing delimiter: `gs://b/a/` is the directory
//! form of `gs://b/a`. Buckets and the root are directories by definition.

use std::cmp::Ordering;

use crate::resource::{PATH_DELIMITER, ResourceId};

/// Converts to the directory form (trailing delimiter). Identity for root,
/// buckets, and objects that already carry the delimiter.
pub fn to_directory_path(id: &ResourceId) -> ResourceId {
    match id {
        ResourceId::Object { bucket, name } if !name.ends_with(PATH_DELIMITER) => {
            ResourceId::Object { bucket: bucket.clone(), name: format!("{name}{PATH_DELIMITER}") }
        }
        other => other.clone(),
    }
}

/// Converts to the file form, stripping a single trailing delimiter.
pub fn to_file_path(id: &ResourceId) -> ResourceId {
    match id {
        ResourceId::Object { bucket, name } if name.ends_with(PATH_DELIMITER) => {
            let stripped = &name[..name.len() - 1];
            ResourceId::Object { bucket: bucket.clone(), name: stripped.to_string() }
        }
        other => other.clone(),
    }
}

/// The longest proper directory prefix. The root is its own parent (POSIX
/// `/..` convention); a bucket's parent is the root; a top-level object's
/// parent is its bucket.
pub fn parent(id: &ResourceId) -> ResourceId {
    match id {
        ResourceId::Root => ResourceId::Root,
        ResourceId::Bucket(_) => ResourceId::Root,
        ResourceId::Object { bucket, name } => {
            let trimmed = name.strip_suffix(PATH_DELIMITER).unwrap_or(name);
            match trimmed.rfind(PATH_DELIMITER) {
                Some(idx) => ResourceId::Object {
                    bucket: bucket.clone(),
                    name: trimmed[..=idx].to_string(),
                },
                None => ResourceId::Bucket(bucket.clone()),
            }
        }
    }
}

/// The last non-empty path segment, accounting for a trailing delimiter.
/// `None` for the root.
pub fn leaf_name(id: &ResourceId) -> Option<String> {
    match id {
        ResourceId::Root => None,
        ResourceId::Bucket(name) => Some(name.clone()),
        ResourceId::Object { name, .. } => {
            let trimmed = name.strip_suffix(PATH_DELIMITER).unwrap_or(name);
            match trimmed.rfind(PATH_DELIMITER) {
                Some(idx) => Some(trimmed[idx + 1..].to_string()),
                None => Some(trimmed.to_string()),
            }
        }
    }
}

/// All strict prefixes of an object path, as directory paths, bucket first:
/// `gs://b/a/b/c/` yields `[gs://b/, gs://b/a/, gs://b/a/b/]`.
pub fn directory_prefixes(id: &ResourceId) -> Vec<ResourceId> {
    let ResourceId::Object { bucket, name } = id else {
        return match id {
            ResourceId::Bucket(_) => vec![ResourceId::Root],
            _ => Vec::new(),
        };
    };
    let mut prefixes = vec![ResourceId::Bucket(bucket.clone())];
    let trimmed = name.strip_suffix(PATH_DELIMITER).unwrap_or(name);
    for (idx, ch) in trimmed.char_indices() {
        if ch == PATH_DELIMITER {
            prefixes.push(ResourceId::Object {
                bucket: bucket.clone(),
                name: trimmed[..=idx].to_string(),
            });
        }
    }
    prefixes
}

/// Length first, then lexicographic. Ascending order puts ancestors before
/// descendants; descending order puts descendants first — the only
/// topological property multi-object operations rely on.
pub fn compare_length_then_lex(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Truncates an object name to the depth-1 form a delimiter listing under
/// `prefix` would report it as, or `None` when the name is outside `prefix`.
///
/// `("d/", '/', "d/x")` maps to `d/x`; `("d/", '/', "d/x/y")` maps to the
/// synthetic prefix entry `d/x/`; the placeholder `d/` maps to itself.
pub fn match_list_prefix(prefix: &str, delimiter: Option<char>, name: &str) -> Option<String> {
    let rest = name.strip_prefix(prefix)?;
    let Some(delim) = delimiter else {
        return Some(name.to_string());
    };
    match rest.find(delim) {
        // A trailing delimiter is the entry's own directory marker, not a
        // deeper level.
        Some(idx) if idx + delim.len_utf8() == rest.len() => Some(name.to_string()),
        Some(idx) => Some(format!("{prefix}{}", &rest[..=idx])),
        None => Some(name.to_string()),
    }
}
