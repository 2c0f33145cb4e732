use chrono::{DateTime, SecondsFormat, Utc};

use crate::{
    accumulator::{PendingRequest, RequestBody},
    entry::{
        DEFAULT_MIME_TYPE, EntryNetwork, EntryRequest, EntryResponse, FinalizedEntry,
        essence_mime_type, header_value,
    },
};

pub const BODY_NOT_CAPTURED_PLACEHOLDER: &str =
    "<body not captured by the capture layer; see the reconciled log>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisOptions {
    /// The capture platform drops POST bodies without reporting an error.
    pub platform_omits_post_bodies: bool,
}

/// Builds the finalized entry for a request that reached a terminal event.
///
/// Total over every record the accumulator can hold: missing lifecycle data
/// falls back to empty headers, zero sizes and a zero status.
pub fn synthesize(pending: &PendingRequest, options: &SynthesisOptions) -> FinalizedEntry {
    let request_headers = pending.request_headers.clone().unwrap_or_default();
    let response_headers = pending.response_headers.clone().unwrap_or_default();

    let content_size = header_value(&response_headers, "content-length")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let (body_text, body_size) = match pending.request_body.as_ref() {
        Some(body) => decode_request_body(body),
        None if options.platform_omits_post_bodies
            && pending.method.eq_ignore_ascii_case("POST") =>
        {
            (Some(BODY_NOT_CAPTURED_PLACEHOLDER.to_owned()), 0)
        }
        None => (None, 0),
    };

    let mime_type = header_value(&request_headers, "content-type")
        .and_then(essence_mime_type)
        .unwrap_or(DEFAULT_MIME_TYPE)
        .to_owned();

    FinalizedEntry {
        started_at: format_started_at(pending.start_ms),
        elapsed_ms: elapsed_ms(pending.start_ms, pending.end_ms),
        request: EntryRequest {
            method: pending.method.clone(),
            url: pending.url.clone(),
            headers: request_headers,
            body_size,
            body_text,
            mime_type,
        },
        response: EntryResponse {
            status: pending.status_code.unwrap_or(0),
            status_text: pending.status_line.clone().unwrap_or_default(),
            headers: response_headers,
            content_size,
            content_text: String::new(),
        },
        network: EntryNetwork {
            server_ip: pending.server_ip.clone().unwrap_or_default(),
            from_cache: pending.from_cache,
            error: pending.transport_error.clone(),
        },
        initiator_type: pending.resource_type.clone(),
    }
}

/// ISO-8601 UTC with millisecond precision; out-of-range inputs clamp to the epoch.
pub fn format_started_at(start_ms: f64) -> String {
    let millis = if start_ms.is_finite() {
        start_ms.round() as i64
    } else {
        0
    };
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn elapsed_ms(start_ms: f64, end_ms: Option<f64>) -> f64 {
    match end_ms {
        Some(end_ms) if (end_ms - start_ms).is_finite() => (end_ms - start_ms).max(0.0),
        _ => 0.0,
    }
}

fn decode_request_body(body: &RequestBody) -> (Option<String>, u64) {
    if let Some(segments) = body.raw.as_ref() {
        let bytes: Vec<u8> = segments
            .iter()
            .filter_map(|segment| segment.bytes.as_deref())
            .flatten()
            .copied()
            .collect();
        let size = bytes.len() as u64;
        return (Some(String::from_utf8_lossy(&bytes).into_owned()), size);
    }

    if let Some(form_data) = body.form_data.as_ref() {
        return match serde_json::to_string(form_data) {
            Ok(text) => {
                let size = text.len() as u64;
                (Some(text), size)
            }
            Err(err) => {
                tracing::warn!("serialize form data for request body: {err}");
                (None, 0)
            }
        };
    }

    (None, 0)
}
