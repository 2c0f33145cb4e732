use serde::{Deserialize, Serialize};

use crate::{
    accumulator::{Clock as _, RequestBody, RequestStart, SystemClock},
    correlator::CaptureEvent,
    entry::{FinalizedEntry, Headers, TabId},
    har_import::{self, HarImportError},
    service::CorrelatorHandle,
};

/// One JSON line read from the capture layer.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundMessage {
    RequestStart {
        request_id: WireRequestId,
        tab_id: TabId,
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(alias = "timeStamp")]
        timestamp: f64,
        #[serde(default)]
        resource_type: String,
        #[serde(default)]
        frame_id: i64,
        #[serde(default)]
        request_body: Option<RequestBody>,
    },
    RequestHeaders {
        request_id: WireRequestId,
        #[serde(default)]
        headers: Vec<WireHeader>,
    },
    ResponseHeaders {
        request_id: WireRequestId,
        status_code: u16,
        #[serde(default)]
        status_line: String,
        #[serde(default)]
        headers: Vec<WireHeader>,
    },
    RequestSucceeded {
        request_id: WireRequestId,
        #[serde(alias = "timeStamp")]
        timestamp: f64,
        #[serde(default)]
        from_cache: bool,
        #[serde(default, alias = "ip")]
        server_ip: Option<String>,
    },
    RequestFailed {
        request_id: WireRequestId,
        #[serde(alias = "timeStamp")]
        timestamp: f64,
        #[serde(alias = "error")]
        error_code: String,
    },
    TabClosed {
        tab_id: TabId,
    },
    Navigated {
        tab_id: TabId,
    },
    ReconcileLog {
        tab_id: TabId,
        entries: Vec<FinalizedEntry>,
    },
    ReconcileHar {
        tab_id: TabId,
        entries: serde_json::Value,
    },
    GetEntries {
        tab_id: TabId,
    },
    ClearEntries {
        tab_id: TabId,
    },
}

/// Request ids arrive as strings from some platforms and integers from others.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WireRequestId {
    Text(String),
    Number(i64),
}

impl WireRequestId {
    pub fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(number) => number.to_string(),
        }
    }
}

/// Platform header shape; `binaryValue` is used when the value is not valid text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireHeader {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub binary_value: Option<Vec<u8>>,
}

impl WireHeader {
    fn into_pair(self) -> (String, String) {
        let value = match (self.value, self.binary_value) {
            (Some(value), _) => value,
            (None, Some(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            (None, None) => String::new(),
        };
        (self.name, value)
    }
}

fn default_method() -> String {
    "GET".to_owned()
}

fn headers(wire: Vec<WireHeader>) -> Headers {
    wire.into_iter().map(WireHeader::into_pair).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    Entries {
        tab_id: TabId,
        entries: Vec<FinalizedEntry>,
    },
    Cleared {
        tab_id: TabId,
        removed: bool,
    },
    Error {
        message: String,
    },
}

impl OutboundMessage {
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A decoded line: either an event for the correlator or a query that expects a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(CaptureEvent),
    GetEntries { tab_id: TabId },
    ClearEntries { tab_id: TabId },
}

#[derive(Debug)]
pub enum TransportError {
    Malformed(serde_json::Error),
    InvalidHar(HarImportError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(err) => write!(f, "malformed message: {err}"),
            Self::InvalidHar(err) => write!(f, "invalid reconcile_har entries: {err}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(err) => Some(err),
            Self::InvalidHar(err) => Some(err),
        }
    }
}

impl InboundMessage {
    /// `now_ms` stands in for missing start times in `reconcile_har` entries.
    pub fn into_inbound(self, now_ms: f64) -> Result<Inbound, TransportError> {
        let inbound = match self {
            Self::RequestStart {
                request_id,
                tab_id,
                url,
                method,
                timestamp,
                resource_type,
                frame_id,
                request_body,
            } => Inbound::Event(CaptureEvent::RequestStart(RequestStart {
                request_id: request_id.into_string(),
                tab_id,
                url,
                method,
                timestamp_ms: timestamp,
                resource_type,
                frame_id,
                request_body,
            })),
            Self::RequestHeaders {
                request_id,
                headers: wire,
            } => Inbound::Event(CaptureEvent::RequestHeaders {
                request_id: request_id.into_string(),
                headers: headers(wire),
            }),
            Self::ResponseHeaders {
                request_id,
                status_code,
                status_line,
                headers: wire,
            } => Inbound::Event(CaptureEvent::ResponseHeaders {
                request_id: request_id.into_string(),
                status_code,
                status_line,
                headers: headers(wire),
            }),
            Self::RequestSucceeded {
                request_id,
                timestamp,
                from_cache,
                server_ip,
            } => Inbound::Event(CaptureEvent::RequestSucceeded {
                request_id: request_id.into_string(),
                timestamp_ms: timestamp,
                from_cache,
                server_ip,
            }),
            Self::RequestFailed {
                request_id,
                timestamp,
                error_code,
            } => Inbound::Event(CaptureEvent::RequestFailed {
                request_id: request_id.into_string(),
                timestamp_ms: timestamp,
                error_code,
            }),
            Self::TabClosed { tab_id } => Inbound::Event(CaptureEvent::TabClosed { tab_id }),
            Self::Navigated { tab_id } => Inbound::Event(CaptureEvent::Navigated { tab_id }),
            Self::ReconcileLog { tab_id, entries } => {
                Inbound::Event(CaptureEvent::ReconcileLog { tab_id, entries })
            }
            Self::ReconcileHar { tab_id, entries } => {
                let entries = har_import::entries_from_document(&entries, now_ms)
                    .map_err(TransportError::InvalidHar)?;
                Inbound::Event(CaptureEvent::ReconcileLog { tab_id, entries })
            }
            Self::GetEntries { tab_id } => Inbound::GetEntries { tab_id },
            Self::ClearEntries { tab_id } => Inbound::ClearEntries { tab_id },
        };
        Ok(inbound)
    }
}

/// Decodes one line. Blank lines decode to `None`.
pub fn decode_line(line: &str, now_ms: f64) -> Result<Option<Inbound>, TransportError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let message: InboundMessage = serde_json::from_str(line).map_err(TransportError::Malformed)?;
    message.into_inbound(now_ms).map(Some)
}

/// Decodes `line` and forwards it to the service. Queries produce a reply;
/// malformed lines produce an error reply and are otherwise skipped.
pub async fn dispatch_line(
    handle: &CorrelatorHandle,
    line: &str,
) -> anyhow::Result<Option<OutboundMessage>> {
    let inbound = match decode_line(line, SystemClock.now_ms()) {
        Ok(Some(inbound)) => inbound,
        Ok(None) => return Ok(None),
        Err(err) => {
            tracing::warn!("skipping inbound line: {err}");
            return Ok(Some(OutboundMessage::Error {
                message: err.to_string(),
            }));
        }
    };

    match inbound {
        Inbound::Event(event) => {
            handle.send(event).await?;
            Ok(None)
        }
        Inbound::GetEntries { tab_id } => Ok(Some(OutboundMessage::Entries {
            tab_id,
            entries: handle.entries(tab_id).await?,
        })),
        Inbound::ClearEntries { tab_id } => Ok(Some(OutboundMessage::Cleared {
            tab_id,
            removed: handle.clear_entries(tab_id).await?,
        })),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::{Inbound, OutboundMessage, TransportError, decode_line, dispatch_line};
    use crate::{
        accumulator::{ManualClock, RequestStart},
        correlator::{CaptureEvent, Correlator, CorrelatorSettings},
        history::HistoryStore,
        service,
    };

    fn decode(value: Value) -> Inbound {
        decode_line(&value.to_string(), 0.0).unwrap().unwrap()
    }

    #[test]
    fn request_start_accepts_numeric_ids_and_fills_defaults() {
        let inbound = decode(json!({
            "type": "request_start",
            "requestId": 42,
            "tabId": 7,
            "url": "https://a.test/",
            "timestamp": 1000.5
        }));

        assert_eq!(
            inbound,
            Inbound::Event(CaptureEvent::RequestStart(RequestStart {
                request_id: "42".to_owned(),
                tab_id: 7,
                url: "https://a.test/".to_owned(),
                method: "GET".to_owned(),
                timestamp_ms: 1000.5,
                resource_type: String::new(),
                frame_id: 0,
                request_body: None,
            }))
        );
    }

    #[test]
    fn request_body_and_platform_headers_are_decoded() {
        let inbound = decode(json!({
            "type": "request_start",
            "requestId": "r1",
            "tabId": 1,
            "url": "https://a.test/",
            "method": "POST",
            "timestamp": 0,
            "requestBody": {"raw": [{"bytes": [97, 61, 49]}], "formData": null}
        }));
        let Inbound::Event(CaptureEvent::RequestStart(start)) = inbound else {
            panic!("expected request start, got {inbound:?}");
        };
        let raw = start.request_body.unwrap().raw.unwrap();
        assert_eq!(raw[0].bytes.as_deref(), Some(&b"a=1"[..]));

        let inbound = decode(json!({
            "type": "response_headers",
            "requestId": "r1",
            "statusCode": 200,
            "statusLine": "HTTP/1.1 200 OK",
            "headers": [
                {"name": "Content-Length", "value": "5"},
                {"name": "X-Bin", "binaryValue": [104, 105]},
                {"name": "X-Empty"}
            ]
        }));
        assert_eq!(
            inbound,
            Inbound::Event(CaptureEvent::ResponseHeaders {
                request_id: "r1".to_owned(),
                status_code: 200,
                status_line: "HTTP/1.1 200 OK".to_owned(),
                headers: vec![
                    ("Content-Length".to_owned(), "5".to_owned()),
                    ("X-Bin".to_owned(), "hi".to_owned()),
                    ("X-Empty".to_owned(), String::new()),
                ],
            })
        );
    }

    #[test]
    fn failure_accepts_platform_error_field() {
        let inbound = decode(json!({
            "type": "request_failed",
            "requestId": "r2",
            "timeStamp": 10,
            "error": "net::ERR_ABORTED"
        }));
        assert_eq!(
            inbound,
            Inbound::Event(CaptureEvent::RequestFailed {
                request_id: "r2".to_owned(),
                timestamp_ms: 10.0,
                error_code: "net::ERR_ABORTED".to_owned(),
            })
        );
    }

    #[test]
    fn reconcile_har_is_normalized_into_entries() {
        let inbound = decode(json!({
            "type": "reconcile_har",
            "tabId": 3,
            "entries": {"log": {"entries": [{"request": {"url": "https://a.test/"}, "time": 4}]}}
        }));
        let Inbound::Event(CaptureEvent::ReconcileLog { tab_id, entries }) = inbound else {
            panic!("expected reconcile log, got {inbound:?}");
        };
        assert_eq!(tab_id, 3);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].elapsed_ms, 4.0);
    }

    #[test]
    fn malformed_lines_are_reported() {
        assert!(decode_line("   ", 0.0).unwrap().is_none());
        assert!(matches!(
            decode_line("{not json", 0.0),
            Err(TransportError::Malformed(_))
        ));
        assert!(matches!(
            decode_line(r#"{"type":"teleport","tabId":1}"#, 0.0),
            Err(TransportError::Malformed(_))
        ));
        assert!(matches!(
            decode_line(r#"{"type":"reconcile_har","tabId":1,"entries":{"log":{}}}"#, 0.0),
            Err(TransportError::InvalidHar(_))
        ));
    }

    #[test]
    fn outbound_messages_use_camel_case_fields() {
        let line = OutboundMessage::Cleared {
            tab_id: 4,
            removed: true,
        }
        .to_line()
        .unwrap();
        assert_eq!(line, r#"{"type":"cleared","tabId":4,"removed":true}"#);

        let line = OutboundMessage::Entries {
            tab_id: 1,
            entries: Vec::new(),
        }
        .to_line()
        .unwrap();
        assert_eq!(line, r#"{"type":"entries","tabId":1,"entries":[]}"#);
    }

    #[tokio::test]
    async fn dispatch_feeds_events_and_answers_queries() {
        let correlator = Correlator::new(
            Box::new(ManualClock::at(0.0)),
            CorrelatorSettings::default(),
            HistoryStore::default(),
        );
        let (handle, join) = service::spawn(correlator, Duration::from_secs(60));

        let lines = [
            r#"{"type":"request_start","requestId":"r1","tabId":5,"url":"https://a.test/","timestamp":100}"#,
            r#"{"type":"request_succeeded","requestId":"r1","timestamp":130,"fromCache":false,"serverIp":"1.2.3.4"}"#,
        ];
        for line in lines {
            assert!(dispatch_line(&handle, line).await.unwrap().is_none());
        }

        let reply = dispatch_line(&handle, r#"{"type":"get_entries","tabId":5}"#)
            .await
            .unwrap()
            .unwrap();
        let OutboundMessage::Entries { tab_id, entries } = reply else {
            panic!("expected entries reply, got {reply:?}");
        };
        assert_eq!(tab_id, 5);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].network.server_ip, "1.2.3.4");

        let reply = dispatch_line(&handle, "garbage").await.unwrap().unwrap();
        assert!(matches!(reply, OutboundMessage::Error { .. }));

        let reply = dispatch_line(&handle, r#"{"type":"clear_entries","tabId":5}"#)
            .await
            .unwrap();
        assert_eq!(
            reply,
            Some(OutboundMessage::Cleared {
                tab_id: 5,
                removed: true
            })
        );

        drop(handle);
        join.await.unwrap();
    }
}
