//! Cache generations and their entries.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use mission_net::{Request, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::storage::StorageError;

/// Identity of a request inside a cache: method plus URL without fragment.
///
/// Headers named by the stored response's `Vary` header are compared
/// separately, see [`CacheEntry::matches`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub url: String,
    pub method: String,
}

impl RequestKey {
    pub fn from_request(request: &Request) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);
        Self {
            method: request.method.as_str().to_ascii_uppercase(),
            url: url.into(),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Header value bytes as received, base64 text on disk.
///
/// Values are kept verbatim so non-UTF-8 headers replay unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawValue(#[serde(with = "bytes_base64")] pub Vec<u8>);

impl RawValue {
    fn from_header(value: &HeaderValue) -> Self {
        Self(value.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request identity.
    pub key: RequestKey,

    /// Request header values for every header the response varies on.
    pub vary: Vec<(String, Option<RawValue>)>,

    /// Response carried `Vary: *` (or an unparseable `Vary`) and can never be matched.
    #[serde(default)]
    pub vary_all: bool,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, repeated names allowed.
    pub headers: Vec<(String, RawValue)>,

    /// Response body.
    #[serde(with = "bytes_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture `response` as the answer to `request`.
    pub fn new(request: &Request, response: &Response) -> Self {
        let mut vary = Vec::new();
        let mut vary_all = false;

        for value in response.headers.get_all(http::header::VARY) {
            // A Vary that cannot be read names nothing a request could satisfy
            let Ok(value) = value.to_str() else {
                vary_all = true;
                continue;
            };
            for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if name == "*" {
                    vary_all = true;
                    continue;
                }
                let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                    vary_all = true;
                    continue;
                };
                let request_value = request.headers.get(&name).map(RawValue::from_header);
                vary.push((name.as_str().to_string(), request_value));
            }
        }

        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), RawValue::from_header(value)))
            .collect();

        Self {
            key: RequestKey::from_request(request),
            vary,
            vary_all,
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Whether this entry answers `request`.
    pub fn matches(&self, request: &Request) -> bool {
        if self.vary_all || self.key != RequestKey::from_request(request) {
            return false;
        }
        self.vary.iter().all(|(name, value)| {
            request.headers.get(name.as_str()).map(HeaderValue::as_bytes)
                == value.as_ref().map(RawValue::as_bytes)
        })
    }

    /// Entries that could never be matched are not worth storing.
    pub fn is_storable(&self) -> bool {
        !self.vary_all
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Result<Response, StorageError> {
        let url = Url::parse(&self.key.url)
            .map_err(|e| StorageError::Corrupt(format!("{}: {e}", self.key)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| StorageError::Corrupt(format!("{}: {e}", self.key)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| StorageError::Corrupt(format!("{}: {e}", self.key)))?;
            let value = HeaderValue::from_bytes(value.as_bytes())
                .map_err(|e| StorageError::Corrupt(format!("{}: {e}", self.key)))?;
            headers.append(name, value);
        }

        Ok(Response::new(
            url,
            status,
            headers,
            Bytes::from(self.body.clone()),
        ))
    }

    pub(crate) fn same_variant(&self, other: &CacheEntry) -> bool {
        self.key == other.key && self.vary == other.vary
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Raw bytes as base64 text on disk.
mod bytes_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// One named cache generation.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Entries by request identity; several when the response varies on headers.
    entries: HashMap<String, Vec<CacheEntry>>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        let key = RequestKey::from_request(request).to_string();
        self.entries
            .get(&key)
            .and_then(|variants| variants.iter().find(|e| e.matches(request)))
    }

    /// Add entry, replacing a stored variant for the same request headers.
    pub fn put(&mut self, entry: CacheEntry) {
        let variants = self.entries.entry(entry.key.to_string()).or_default();
        variants.retain(|existing| !existing.same_variant(&entry));
        variants.push(entry);
    }

    /// All stored request identities, sorted.
    pub fn keys(&self) -> Vec<RequestKey> {
        let mut keys: Vec<RequestKey> = self
            .entries
            .values()
            .filter_map(|variants| variants.first().map(|e| e.key.clone()))
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
