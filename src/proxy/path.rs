use std::path::{Path, PathBuf};

use http::Uri;
use thiserror::Error;

/// Names starting with this prefix belong to the gateway (temporary files,
/// directory index entries) and can never be addressed by a request.
pub const RESERVED_PREFIX: &str = ".gw-";

/// Filename used for request paths ending in `/`.
pub const INDEX_FILENAME: &str = ".gw-index";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("request path is empty")]
    Empty,
    #[error("request path must start with '/'")]
    NotAbsolute,
    #[error("request path is missing an origin host")]
    MissingHost,
    #[error("request path contains an empty segment")]
    EmptySegment,
    #[error("request path segment '{0}' is not allowed")]
    Traversal(String),
    #[error("request path segment '{0}' uses a reserved name")]
    Reserved(String),
    #[error("request path contains a forbidden character")]
    ForbiddenCharacter,
    #[error("request path does not form a valid origin URL '{0}'")]
    InvalidOrigin(String),
}

/// Result of mapping a request path onto the origin and the cache tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPath {
    /// Request path without its leading slash: `host[:port]/path...`.
    pub key: String,
    pub origin: Uri,
    /// Cache root joined with every key segment except the last.
    pub directory: PathBuf,
    pub filename: String,
}

impl MappedPath {
    pub fn file_path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }
}

#[derive(Debug, Clone)]
pub struct PathMapper {
    root: PathBuf,
}

impl PathMapper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map `/host[:port]/path...[?query]` to its origin URL and cache location.
    ///
    /// The origin URL is `http://` followed by the path verbatim. The query, if
    /// any, is kept on the final filename through [`escape_query`], so it can
    /// never add a directory level and distinct queries keep distinct names.
    pub fn map(&self, request_path: &str) -> Result<MappedPath, PathError> {
        if request_path.is_empty() {
            return Err(PathError::Empty);
        }
        let rest = request_path
            .strip_prefix('/')
            .ok_or(PathError::NotAbsolute)?;
        if rest.is_empty() {
            return Err(PathError::Empty);
        }
        if rest.contains(['\0', '\\', '#']) {
            return Err(PathError::ForbiddenCharacter);
        }

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let segments: Vec<&str> = path.split('/').collect();
        let last = segments.len() - 1;
        if segments[0].is_empty() {
            return Err(PathError::MissingHost);
        }
        if segments[0].contains('@') {
            return Err(PathError::ForbiddenCharacter);
        }
        for (idx, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                if idx == last {
                    continue;
                }
                return Err(PathError::EmptySegment);
            }
            if *segment == "." || *segment == ".." {
                return Err(PathError::Traversal((*segment).to_string()));
            }
            if segment.starts_with(RESERVED_PREFIX) {
                return Err(PathError::Reserved((*segment).to_string()));
            }
        }

        let origin_url = format!("http://{rest}");
        let origin: Uri = origin_url
            .parse()
            .map_err(|_| PathError::InvalidOrigin(origin_url.clone()))?;
        if origin.host().is_none_or(str::is_empty) {
            return Err(PathError::InvalidOrigin(origin_url));
        }

        let mut filename = match segments[last] {
            "" => INDEX_FILENAME.to_string(),
            name => name.to_string(),
        };
        if let Some(query) = query {
            filename.push('?');
            filename.push_str(&escape_query(query));
        }

        let mut directory = self.root.clone();
        for segment in &segments[..last] {
            directory.push(segment);
        }

        Ok(MappedPath {
            key: rest.to_string(),
            origin,
            directory,
            filename,
        })
    }
}

/// Escape `%` first, then `/`, so the mapping stays injective: a query that
/// already spells `%2F` lands on `%252F`, never on the name of a literal `/`.
fn escape_query(query: &str) -> String {
    query.replace('%', "%25").replace('/', "%2F")
}

#[cfg(feature = "fuzzing")]
pub mod fuzzing {
    use super::PathMapper;

    /// Map `input` under a fixed root and check the result never leaves it.
    pub fn map_and_check(input: &str) {
        let mapper = PathMapper::new("/cache-root");
        if let Ok(mapped) = mapper.map(input) {
            let path = mapped.file_path();
            assert!(path.starts_with(mapper.root()));
            assert!(
                path.components()
                    .all(|c| !matches!(c, std::path::Component::ParentDir))
            );
        }
    }
}
