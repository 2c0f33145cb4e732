use serde::{Deserialize, Serialize};

/// Browser tab identifier. Negative values mark traffic that is not tab-scoped.
pub type TabId = i64;

/// Ordered `(name, value)` header pairs, serialized as `[name, value]` arrays.
pub type Headers = Vec<(String, String)>;

pub const DEFAULT_MIME_TYPE: &str = "application/json";

/// A finalized transaction record. Immutable once it reaches the history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedEntry {
    pub started_at: String,
    pub elapsed_ms: f64,
    pub request: EntryRequest,
    pub response: EntryResponse,
    pub network: EntryNetwork,
    pub initiator_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub content_size: u64,
    #[serde(default)]
    pub content_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryNetwork {
    #[serde(default)]
    pub server_ip: String,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Case-insensitive lookup of the first header named `name`.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Media type of a `content-type` value with parameters stripped.
pub fn essence_mime_type(content_type: &str) -> Option<&str> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    if essence.is_empty() {
        None
    } else {
        Some(essence)
    }
}
