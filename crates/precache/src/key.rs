//! # Key Normalization
//!
//! Every partition lookup and every manifest lookup goes through the same
//! canonical key space. A canonical key is the request path with scheme,
//! host, query and fragment removed, one leading and one trailing slash
//! stripped, and the empty path mapped to [`ROOT_KEY`].

use url::Url;

/// Key used for the site root
pub const ROOT_KEY: &str = "/";

/// Derive the canonical key from a raw URL or path.
///
/// Accepts absolute URLs (`https://host/a/b?x#y`), absolute paths
/// (`/a/b`) and relative paths (`a/b`).
pub fn canonical_path(raw: &str) -> String {
    let path = strip_origin(raw);

    // Query and fragment, whichever comes first
    let end = path.find(['?', '#']).unwrap_or(path.len());
    let mut key = &path[..end];

    key = key.strip_prefix('/').unwrap_or(key);
    if let Some(stripped) = key.strip_suffix('/') {
        if !stripped.is_empty() {
            key = stripped;
        }
    }

    if key.is_empty() {
        ROOT_KEY.to_string()
    } else {
        key.to_string()
    }
}

/// Canonical key with index aliases folded onto [`ROOT_KEY`].
pub fn canonical_key(raw: &str, index_aliases: &[String]) -> String {
    let key = canonical_path(raw);
    if index_aliases.iter().any(|alias| alias == &key) {
        ROOT_KEY.to_string()
    } else {
        key
    }
}

/// Canonical key of a parsed URL.
pub fn url_key(url: &Url, index_aliases: &[String]) -> String {
    canonical_key(url.path(), index_aliases)
}

/// Storage key for partitions that keep query variants apart.
///
/// This is the canonical key followed by the original query string, if any.
pub fn storage_key(url: &Url, index_aliases: &[String]) -> String {
    let key = url_key(url, index_aliases);
    match url.query() {
        Some(query) if !query.is_empty() => format!("{key}?{query}"),
        _ => key,
    }
}

/// Drop the query part of a storage key.
pub fn strip_search(key: &str) -> &str {
    key.split_once('?').map_or(key, |(path, _)| path)
}

/// Resolve a canonical key against the origin it was derived from.
pub fn resolve(origin: &Url, key: &str) -> Result<Url, url::ParseError> {
    if key == ROOT_KEY {
        origin.join("./")
    } else {
        origin.join(key)
    }
}

fn strip_origin(raw: &str) -> &str {
    match raw.find("://") {
        Some(scheme_end) => {
            let rest = &raw[scheme_end + 3..];
            // Host ends at the first path, query or fragment delimiter
            match rest.find(['/', '?', '#']) {
                Some(idx) => &rest[idx..],
                None => "",
            }
        }
        None => raw,
    }
}
