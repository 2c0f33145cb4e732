use serde_json::Value;

use crate::{
    entry::{
        DEFAULT_MIME_TYPE, EntryNetwork, EntryRequest, EntryResponse, FinalizedEntry, Headers,
        essence_mime_type, header_value,
    },
    synthesis::format_started_at,
};

const UNKNOWN_URL: &str = "(unknown)";
const UNKNOWN_INITIATOR: &str = "other";

#[derive(Debug)]
pub enum HarImportError {
    InvalidJson(serde_json::Error),
    MissingEntries,
}

impl std::fmt::Display for HarImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(_) => write!(f, "parse HAR document as JSON"),
            Self::MissingEntries => {
                write!(f, "HAR document has no `log.entries` or `entries` array")
            }
        }
    }
}

impl std::error::Error for HarImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidJson(source) => Some(source),
            Self::MissingEntries => None,
        }
    }
}

pub fn parse_har_str(text: &str, now_ms: f64) -> Result<Vec<FinalizedEntry>, HarImportError> {
    let document: Value = serde_json::from_str(text).map_err(HarImportError::InvalidJson)?;
    entries_from_document(&document, now_ms)
}

/// Accepts a full HAR document (`{"log": {"entries": [...]}}`), a bare log
/// object (`{"entries": [...]}`) or a plain array of entries.
pub fn entries_from_document(
    document: &Value,
    now_ms: f64,
) -> Result<Vec<FinalizedEntry>, HarImportError> {
    let raw_entries = document
        .pointer("/log/entries")
        .or_else(|| document.get("entries"))
        .or(Some(document))
        .and_then(Value::as_array)
        .ok_or(HarImportError::MissingEntries)?;

    let mut entries = Vec::with_capacity(raw_entries.len());
    for (index, raw) in raw_entries.iter().enumerate() {
        match normalize_raw_entry(raw, now_ms) {
            Some(entry) => entries.push(entry),
            None => tracing::warn!(index, "skipping HAR entry that is not an object"),
        }
    }
    Ok(entries)
}

/// Maps one raw HAR entry onto the finalized entry shape, filling gaps with
/// the same defaults live capture uses. `now_ms` stands in for a missing
/// `startedDateTime`.
pub fn normalize_raw_entry(raw: &Value, now_ms: f64) -> Option<FinalizedEntry> {
    if !raw.is_object() {
        return None;
    }

    let request = raw
        .get("request")
        .or_else(|| raw.get("_request"))
        .unwrap_or(raw);
    let empty = Value::Null;
    let response = raw
        .get("response")
        .or_else(|| raw.get("_response"))
        .unwrap_or(&empty);

    let request_headers = headers(request.get("headers"));
    let response_headers = headers(response.get("headers"));

    let url = str_field(request, "url").unwrap_or(UNKNOWN_URL).to_owned();
    let method = str_field(request, "method").unwrap_or("GET").to_owned();

    let post_data = request.get("postData");
    let body_text = post_data
        .and_then(|post_data| str_field(post_data, "text"))
        .map(str::to_owned);
    let body_size = non_negative(request.get("bodySize"))
        .or_else(|| body_text.as_ref().map(|text| text.len() as u64))
        .unwrap_or(0);
    let mime_type = post_data
        .and_then(|post_data| str_field(post_data, "mimeType"))
        .and_then(essence_mime_type)
        .or_else(|| header_value(&request_headers, "content-type").and_then(essence_mime_type))
        .unwrap_or(DEFAULT_MIME_TYPE)
        .to_owned();

    let status = response
        .get("status")
        .or_else(|| response.get("statusCode"))
        .and_then(Value::as_u64)
        .and_then(|status| u16::try_from(status).ok())
        .unwrap_or(0);
    let content = response.get("content");
    let content_size = content
        .and_then(|content| non_negative(content.get("size")))
        .or_else(|| non_negative(response.get("bodySize")))
        .or_else(|| non_negative(response.get("_transferSize")))
        .unwrap_or(0);
    let content_text = content
        .and_then(|content| str_field(content, "text"))
        .unwrap_or_default()
        .to_owned();

    let elapsed_ms = raw
        .get("time")
        .and_then(Value::as_f64)
        .or_else(|| raw.pointer("/_timings/time").and_then(Value::as_f64))
        .filter(|elapsed| elapsed.is_finite())
        .unwrap_or(0.0)
        .max(0.0);
    let started_at = str_field(raw, "startedDateTime")
        .map(str::to_owned)
        .unwrap_or_else(|| format_started_at(now_ms));

    let error = str_field(raw, "_error")
        .or_else(|| str_field(response, "_error"))
        .filter(|error| !error.is_empty())
        .map(str::to_owned);
    let from_cache = raw
        .get("_fromCache")
        .is_some_and(|value| !value.is_null() && value != &Value::Bool(false));

    Some(FinalizedEntry {
        started_at,
        elapsed_ms,
        request: EntryRequest {
            method,
            url,
            headers: request_headers,
            body_size,
            body_text,
            mime_type,
        },
        response: EntryResponse {
            status,
            status_text: str_field(response, "statusText")
                .unwrap_or_default()
                .to_owned(),
            headers: response_headers,
            content_size,
            content_text,
        },
        network: EntryNetwork {
            server_ip: str_field(raw, "serverIPAddress")
                .unwrap_or_default()
                .to_owned(),
            from_cache,
            error,
        },
        initiator_type: initiator_type(raw).to_owned(),
    })
}

fn initiator_type(raw: &Value) -> &str {
    ["/cause/type", "/initiator/type", "/_initiator/type", "/_resourceType"]
        .iter()
        .find_map(|pointer| raw.pointer(pointer).and_then(Value::as_str))
        .filter(|value| !value.is_empty())
        .unwrap_or(UNKNOWN_INITIATOR)
}

fn headers(value: Option<&Value>) -> Headers {
    let Some(items) = value.and_then(Value::as_array) else {
        return Headers::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = str_field(item, "name")?;
            let value = str_field(item, "value").unwrap_or_default();
            Some((name.to_owned(), value.to_owned()))
        })
        .collect()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn non_negative(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|number| number.is_finite() && *number >= 0.0)
                .map(|number| number as u64)
        })
}
