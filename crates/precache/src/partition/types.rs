//! # Partition Types
//!
//! Types shared by every partition provider.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::http::{Response, ResponseKind};

/// Result of a partition operation
pub type PartitionResult<T> = std::result::Result<T, std::io::Error>;

/// Role a partition plays in the cache layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionRole {
    /// Resources of the live version
    Content,
    /// Resources fetched during install, waiting for promotion
    Staging,
    /// Version-independent home of the previous manifest
    ManifestStore,
    /// Dynamically cached media, bounded by TTL and entry count
    Runtime,
}

/// Concrete partition names for one cache prefix and version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
    pub content: String,
    pub staging: String,
    pub manifest: String,
    pub runtime: String,
}

impl PartitionNames {
    pub fn new(prefix: &str, version: &str) -> Self {
        Self {
            content: format!("{prefix}-content"),
            staging: format!("{prefix}-staging-{version}"),
            manifest: format!("{prefix}-manifest"),
            runtime: format!("{prefix}-runtime"),
        }
    }

    pub fn name(&self, role: PartitionRole) -> &str {
        match role {
            PartitionRole::Content => &self.content,
            PartitionRole::Staging => &self.staging,
            PartitionRole::ManifestStore => &self.manifest,
            PartitionRole::Runtime => &self.runtime,
        }
    }

    /// Partitions allowed to survive activation of this version
    pub fn allow_list(&self) -> [&str; 4] {
        [&self.content, &self.staging, &self.manifest, &self.runtime]
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allow_list().contains(&name)
    }
}

/// Lookup options for [`Partition::get`](super::Partition::get)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
    /// Compare keys without their query part
    pub ignore_search: bool,
}

impl MatchOptions {
    pub fn ignoring_search() -> Self {
        Self {
            ignore_search: true,
        }
    }
}

/// Status line and headers of a stored response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub kind: ResponseKind,
}

impl ResponseHead {
    pub fn from_response(response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            status: response.status.as_u16(),
            headers,
            kind: response.kind,
        }
    }

    pub fn ok() -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            headers: Vec::new(),
            kind: ResponseKind::Basic,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `Date` header, used as age fallback when no fetch time was recorded
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.header(header::DATE.as_str())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }
}

/// A cached response with the time it was fetched
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub head: ResponseHead,
    pub body: Bytes,
    /// Recorded at write time; server cache headers are not trusted for TTL
    pub fetched_at: Option<DateTime<Utc>>,
}

impl StoredResponse {
    pub fn new(head: ResponseHead, body: impl Into<Bytes>) -> Self {
        Self {
            head,
            body: body.into(),
            fetched_at: None,
        }
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = Some(fetched_at);
        self
    }

    pub fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.head.status).unwrap_or(StatusCode::OK);
        Response {
            status,
            headers: self.head.header_map(),
            kind: self.head.kind,
            body: self.body.into(),
        }
    }
}

/// Description of one stored entry, without its body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    pub head: ResponseHead,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Insertion order within the partition
    pub sequence: u64,
    pub size: u64,
}

impl EntryMeta {
    /// Time the entry was fetched, else the `Date` header of the response
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.fetched_at.or_else(|| self.head.date())
    }
}
