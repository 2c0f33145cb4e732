use serde::Serialize;

use crate::entry::FinalizedEntry;

pub const HAR_VERSION: &str = "1.2";
const HTTP_VERSION: &str = "HTTP/1.1";

#[derive(Debug, Serialize)]
pub struct HarDocument {
    pub log: HarLog,
}

#[derive(Debug, Serialize)]
pub struct HarLog {
    pub version: &'static str,
    pub creator: HarCreator,
    pub entries: Vec<HarEntry>,
}

#[derive(Debug, Serialize)]
pub struct HarCreator {
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    started_date_time: String,
    time: f64,
    request: HarRequest,
    response: HarResponse,
    cache: serde_json::Map<String, serde_json::Value>,
    timings: HarTimings,
    #[serde(rename = "serverIPAddress")]
    server_ip_address: String,
    connection: String,
    #[serde(rename = "_initiator")]
    initiator: HarInitiator,
    #[serde(rename = "_fromCache", skip_serializing_if = "Option::is_none")]
    from_cache: Option<&'static str>,
    #[serde(rename = "_error", skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HarRequest {
    method: String,
    url: String,
    http_version: &'static str,
    headers: Vec<HarNameValue>,
    query_string: Vec<HarNameValue>,
    cookies: Vec<HarNameValue>,
    headers_size: i64,
    body_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    post_data: Option<HarPostData>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HarPostData {
    mime_type: String,
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HarResponse {
    status: u16,
    status_text: String,
    http_version: &'static str,
    headers: Vec<HarNameValue>,
    cookies: Vec<HarNameValue>,
    content: HarContent,
    #[serde(rename = "redirectURL")]
    redirect_url: String,
    headers_size: i64,
    body_size: u64,
    #[serde(rename = "_transferSize")]
    transfer_size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HarContent {
    size: u64,
    mime_type: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct HarTimings {
    blocked: f64,
    dns: f64,
    connect: f64,
    send: f64,
    wait: f64,
    receive: f64,
    ssl: f64,
}

#[derive(Debug, Serialize)]
struct HarNameValue {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct HarInitiator {
    #[serde(rename = "type")]
    kind: String,
}

/// Renders a tab's history as a HAR document, oldest entry first.
pub fn to_har_document(entries: &[FinalizedEntry]) -> HarDocument {
    HarDocument {
        log: HarLog {
            version: HAR_VERSION,
            creator: HarCreator {
                name: env!("CARGO_PKG_NAME"),
                version: env!("CARGO_PKG_VERSION"),
            },
            entries: entries.iter().map(har_entry).collect(),
        },
    }
}

pub fn to_har_json(entries: &[FinalizedEntry]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&to_har_document(entries))
}

fn har_entry(entry: &FinalizedEntry) -> HarEntry {
    let request = &entry.request;
    let response = &entry.response;

    HarEntry {
        started_date_time: entry.started_at.clone(),
        time: entry.elapsed_ms,
        request: HarRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            http_version: HTTP_VERSION,
            headers: name_values(&request.headers),
            query_string: query_string(&request.url),
            cookies: Vec::new(),
            headers_size: -1,
            body_size: request.body_size,
            post_data: request.body_text.as_ref().map(|text| HarPostData {
                mime_type: request.mime_type.clone(),
                text: text.clone(),
            }),
        },
        response: HarResponse {
            status: response.status,
            status_text: response.status_text.clone(),
            http_version: HTTP_VERSION,
            headers: name_values(&response.headers),
            cookies: Vec::new(),
            content: HarContent {
                size: response.content_size,
                mime_type: String::new(),
                text: response.content_text.clone(),
            },
            redirect_url: String::new(),
            headers_size: -1,
            body_size: response.content_size,
            transfer_size: response.content_size,
        },
        cache: serde_json::Map::new(),
        timings: HarTimings {
            blocked: -1.0,
            dns: -1.0,
            connect: -1.0,
            send: 0.0,
            wait: entry.elapsed_ms,
            receive: 0.0,
            ssl: -1.0,
        },
        server_ip_address: entry.network.server_ip.clone(),
        connection: String::new(),
        initiator: HarInitiator {
            kind: entry.initiator_type.clone(),
        },
        from_cache: entry.network.from_cache.then_some("memory"),
        error: entry.network.error.clone(),
    }
}

fn name_values(headers: &[(String, String)]) -> Vec<HarNameValue> {
    headers
        .iter()
        .map(|(name, value)| HarNameValue {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn query_string(url: &str) -> Vec<HarNameValue> {
    let Some((_, query)) = url.split('#').next().unwrap_or_default().split_once('?') else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let (name, value) = segment.split_once('=').unwrap_or((segment, ""));
            HarNameValue {
                name: name.to_owned(),
                value: value.to_owned(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{HAR_VERSION, to_har_json};
    use crate::{har_import::entries_from_document, history::tests::entry};

    #[test]
    fn export_emits_har_log_with_fixed_capture_fields() {
        let mut first = entry("https://a.test/search?q=rust&page=2#top", 50.0);
        first.request.method = "POST".to_owned();
        first.request.body_text = Some("a=1".to_owned());
        first.request.mime_type = "application/x-www-form-urlencoded".to_owned();
        first.response.content_size = 5;
        first.network.server_ip = "1.2.3.4".to_owned();
        let mut second = entry("https://a.test/fail", 3.0);
        second.network.error = Some("net::ERR_ABORTED".to_owned());

        let json = to_har_json(&[first, second]).unwrap();
        let document: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(document["log"]["version"], HAR_VERSION);
        assert_eq!(document["log"]["creator"]["name"], "tabcapture");
        let entries = document["log"]["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(first["time"], 50.0);
        assert_eq!(first["timings"]["wait"], 50.0);
        assert_eq!(first["request"]["httpVersion"], "HTTP/1.1");
        assert_eq!(first["request"]["headersSize"], -1);
        assert_eq!(first["request"]["postData"]["text"], "a=1");
        assert_eq!(
            first["request"]["queryString"],
            serde_json::json!([{"name": "q", "value": "rust"}, {"name": "page", "value": "2"}])
        );
        assert_eq!(first["response"]["content"]["size"], 5);
        assert_eq!(first["response"]["_transferSize"], 5);
        assert_eq!(first["serverIPAddress"], "1.2.3.4");
        assert_eq!(first["_initiator"]["type"], "xmlhttprequest");
        assert!(first.get("_error").is_none());

        assert_eq!(entries[1]["_error"], "net::ERR_ABORTED");
        assert!(entries[1]["request"].get("postData").is_none());
    }

    #[test]
    fn exported_documents_import_back_into_the_same_entries() {
        let mut captured = entry("https://a.test/x", 12.0);
        captured.network.from_cache = true;
        captured.network.error = Some("net::ERR_FAILED".to_owned());
        let json = to_har_json(std::slice::from_ref(&captured)).unwrap();

        let document: Value = serde_json::from_str(&json).unwrap();
        let imported = entries_from_document(&document, 0.0).unwrap();
        assert_eq!(imported, vec![captured]);
    }
}
