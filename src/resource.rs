//! Identifiers for entities in the flat store, parsed from `gs://` URIs.
//!
//! The store namespace is two-level: buckets, and objects within a bucket.
//! Escaped sequences in object names (e.g. `%3A`) are preserved verbatim and
//! `+` is never decoded; the URI is treated as an opaque path, not a URL.

use std::fmt;

use crate::error::FsError;

pub const SCHEME: &str = "gs";
pub const PATH_DELIMITER: char = '/';

/// One entity in the store namespace: the root of the scheme, a bucket, or an
/// object within a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Root,
    Bucket(String),
    Object { bucket: String, name: String },
}

impl ResourceId {
    /// Builds a bucket id. The bucket must be non-empty and contain no `/`.
    pub fn bucket(name: impl Into<String>) -> Result<ResourceId, FsError> {
        let name = name.into();
        validate_bucket(&name)?;
        Ok(ResourceId::Bucket(name))
    }

    /// Builds an object id. A single leading `/` in the object name is
    /// stripped; consecutive `/` anywhere else is rejected.
    pub fn object(bucket: impl Into<String>, name: impl Into<String>) -> Result<ResourceId, FsError> {
        let bucket = bucket.into();
        validate_bucket(&bucket)?;
        let name = name.into();
        let name = name.strip_prefix(PATH_DELIMITER).map(str::to_owned).unwrap_or(name);
        validate_object_name(&name)?;
        Ok(ResourceId::Object { bucket, name })
    }

    /// Parses a `gs://bucket/object` URI.
    ///
    /// `gs:/` is the root. With `allow_empty_object`, `gs://bucket` and
    /// `gs://bucket/` resolve to the bucket itself; otherwise an empty object
    /// name is an error.
    pub fn parse(uri: &str, allow_empty_object: bool) -> Result<ResourceId, FsError> {
        let rest = uri
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| FsError::InvalidArgument(format!("unsupported scheme in '{uri}'")))?;

        if rest.is_empty() || rest == "/" {
            return Ok(ResourceId::Root);
        }
        let authority = rest.strip_prefix("//").ok_or_else(|| {
            FsError::InvalidArgument(format!("malformed URI '{uri}': expected gs://bucket/object"))
        })?;

        let (bucket, object) = match authority.split_once(PATH_DELIMITER) {
            Some((bucket, object)) => (bucket, object),
            None => (authority, ""),
        };
        validate_bucket(bucket)
            .map_err(|_| FsError::InvalidArgument(format!("invalid bucket in '{uri}'")))?;

        if object.is_empty() {
            if allow_empty_object {
                return Ok(ResourceId::Bucket(bucket.to_string()));
            }
            return Err(FsError::InvalidArgument(format!("empty object name in '{uri}'")));
        }
        ResourceId::object(bucket, object)
            .map_err(|_| FsError::InvalidArgument(format!("invalid object name in '{uri}'")))
    }

    pub fn is_root(&self) -> bool {
        matches!(self, ResourceId::Root)
    }

    pub fn is_bucket(&self) -> bool {
        matches!(self, ResourceId::Bucket(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, ResourceId::Object { .. })
    }

    pub fn bucket_name(&self) -> Option<&str> {
        match self {
            ResourceId::Root => None,
            ResourceId::Bucket(name) => Some(name),
            ResourceId::Object { bucket, .. } => Some(bucket),
        }
    }

    pub fn object_name(&self) -> Option<&str> {
        match self {
            ResourceId::Object { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Whether this id denotes a directory: root, a bucket, or an object
    /// whose name ends with the path delimiter.
    pub fn is_directory(&self) -> bool {
        match self {
            ResourceId::Root | ResourceId::Bucket(_) => true,
            ResourceId::Object { name, .. } => name.ends_with(PATH_DELIMITER),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Root => write!(f, "{SCHEME}:/"),
            ResourceId::Bucket(name) => write!(f, "{SCHEME}://{name}/"),
            ResourceId::Object { bucket, name } => write!(f, "{SCHEME}://{bucket}/{name}"),
        }
    }
}

fn validate_bucket(bucket: &str) -> Result<(), FsError> {
    if bucket.is_empty() {
        return Err(FsError::InvalidArgument("bucket name must be non-empty".to_string()));
    }
    if bucket.contains(PATH_DELIMITER) {
        return Err(FsError::InvalidArgument(format!(
            "bucket name must not contain '{PATH_DELIMITER}': '{bucket}'"
        )));
    }
    Ok(())
}

fn validate_object_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("object name must be non-empty".to_string()));
    }
    // A leading '/' here means the original name had two: only one is
    // stripped during construction.
    if name.starts_with(PATH_DELIMITER) || name.contains("//") {
        return Err(FsError::InvalidArgument(format!(
            "object name must not contain consecutive '/': '{name}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_object() {
        let id = ResourceId::parse("gs://bucket/a/b/c", false).unwrap();
        assert_eq!(
            id,
            ResourceId::Object { bucket: "bucket".to_string(), name: "a/b/c".to_string() }
        );
    }

    #[test]
    fn parse_root_and_bucket() {
        assert_eq!(ResourceId::parse("gs:/", true).unwrap(), ResourceId::Root);
        assert_eq!(
            ResourceId::parse("gs://b", true).unwrap(),
            ResourceId::Bucket("b".to_string())
        );
        assert_eq!(
            ResourceId::parse("gs://b/", true).unwrap(),
            ResourceId::Bucket("b".to_string())
        );
        assert!(ResourceId::parse("gs://b", false).is_err());
    }

    #[test]
    fn parse_rejects_bad_uris() {
        assert!(ResourceId::parse("s3://b/x", false).is_err());
        assert!(ResourceId::parse("gs:///x", false).is_err());
        assert!(ResourceId::parse("gs://b/a//c", false).is_err());
        assert!(ResourceId::parse("gs:/foo", false).is_err());
    }

    #[test]
    fn leading_slash_stripped() {
        let id = ResourceId::object("b", "/x").unwrap();
        assert_eq!(id.object_name(), Some("x"));
    }

    #[test]
    fn escapes_preserved_verbatim() {
        let id = ResourceId::parse("gs://b/a%3Ab/c+d", false).unwrap();
        assert_eq!(id.object_name(), Some("a%3Ab/c+d"));
    }

    // parse(render(parse(p))) == parse(p)
    #[test]
    fn render_round_trip() {
        for uri in ["gs:/", "gs://b", "gs://b/", "gs://b/x", "gs://b/a/b/", "gs://b/a%3Ab"] {
            let parsed = ResourceId::parse(uri, true).unwrap();
            let reparsed = ResourceId::parse(&parsed.to_string(), true).unwrap();
            assert_eq!(parsed, reparsed, "round trip failed for {uri}");
        }
    }

    #[test]
    fn directory_predicate() {
        assert!(ResourceId::Root.is_directory());
        assert!(ResourceId::parse("gs://b", true).unwrap().is_directory());
        assert!(ResourceId::parse("gs://b/d/", false).unwrap().is_directory());
        assert!(!ResourceId::parse("gs://b/d", false).unwrap().is_directory());
    }
}
