use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{
    entry::{FinalizedEntry, Headers, TabId},
    synthesis::{self, SynthesisOptions},
};

pub const DEFAULT_PENDING_IDLE_MS: u64 = 5 * 60 * 1000;

/// Source of "now" in milliseconds since the Unix epoch.
pub trait Clock: Send {
    fn now_ms(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_secs_f64() * 1000.0,
            Err(_) => 0.0,
        }
    }
}

/// Clock that only moves when told to. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn at(now_ms: f64) -> Self {
        let clock = Self::default();
        clock.set(now_ms);
        clock
    }

    pub fn set(&self, now_ms: f64) {
        self.bits.store(now_ms.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: f64) {
        self.set(self.now_ms() + delta_ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Body description as delivered by the capture platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<UploadSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_data: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSegment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl UploadSegment {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Some(bytes.into()),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestStart {
    pub request_id: String,
    pub tab_id: TabId,
    pub url: String,
    pub method: String,
    pub timestamp_ms: f64,
    pub resource_type: String,
    pub frame_id: i64,
    pub request_body: Option<RequestBody>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub request_id: String,
    pub tab_id: TabId,
    pub url: String,
    pub method: String,
    pub start_ms: f64,
    pub resource_type: String,
    pub frame_id: i64,
    pub request_body: Option<RequestBody>,
    pub request_headers: Option<Headers>,
    pub status_code: Option<u16>,
    pub status_line: Option<String>,
    pub response_headers: Option<Headers>,
    pub end_ms: Option<f64>,
    pub from_cache: bool,
    pub server_ip: Option<String>,
    pub transport_error: Option<String>,
    pub last_touched_ms: f64,
}

impl PendingRequest {
    pub fn from_start(start: RequestStart, now_ms: f64) -> Self {
        Self {
            request_id: start.request_id,
            tab_id: start.tab_id,
            url: start.url,
            method: start.method,
            start_ms: start.timestamp_ms,
            resource_type: start.resource_type,
            frame_id: start.frame_id,
            request_body: start.request_body,
            request_headers: None,
            status_code: None,
            status_line: None,
            response_headers: None,
            end_ms: None,
            from_cache: false,
            server_ip: None,
            transport_error: None,
            last_touched_ms: now_ms,
        }
    }
}

/// A request that reached a terminal lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub request_id: String,
    pub tab_id: TabId,
    pub entry: FinalizedEntry,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumulatorSettings {
    pub pending_idle_ms: u64,
    pub synthesis: SynthesisOptions,
}

impl Default for AccumulatorSettings {
    fn default() -> Self {
        Self {
            pending_idle_ms: DEFAULT_PENDING_IDLE_MS,
            synthesis: SynthesisOptions::default(),
        }
    }
}

/// In-flight requests keyed by request id.
pub struct Accumulator {
    pending: HashMap<String, PendingRequest>,
    clock: Box<dyn Clock>,
    settings: AccumulatorSettings,
}

impl std::fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accumulator")
            .field("pending", &self.pending.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Accumulator {
    pub fn new(clock: Box<dyn Clock>, settings: AccumulatorSettings) -> Self {
        Self {
            pending: HashMap::new(),
            clock,
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, request_id: &str) -> Option<&PendingRequest> {
        self.pending.get(request_id)
    }

    /// Returns `false` when the request is not tab-scoped and was ignored.
    pub fn begin_request(&mut self, start: RequestStart) -> bool {
        if start.tab_id < 0 {
            tracing::trace!(request_id = %start.request_id, "ignoring request outside any tab");
            return false;
        }

        let now_ms = self.clock.now_ms();
        let request_id = start.request_id.clone();
        if self
            .pending
            .insert(request_id.clone(), PendingRequest::from_start(start, now_ms))
            .is_some()
        {
            tracing::debug!(%request_id, "request restarted; previous pending record replaced");
        }
        true
    }

    pub fn attach_request_headers(&mut self, request_id: &str, headers: Headers) {
        let now_ms = self.clock.now_ms();
        let Some(pending) = self.pending.get_mut(request_id) else {
            tracing::trace!(%request_id, "request headers for untracked request");
            return;
        };
        pending.request_headers = Some(headers);
        pending.last_touched_ms = now_ms;
    }

    pub fn attach_response_headers(
        &mut self,
        request_id: &str,
        status_code: u16,
        status_line: String,
        headers: Headers,
    ) {
        let now_ms = self.clock.now_ms();
        let Some(pending) = self.pending.get_mut(request_id) else {
            tracing::trace!(%request_id, "response headers for untracked request");
            return;
        };
        pending.status_code = Some(status_code);
        pending.status_line = Some(status_line);
        pending.response_headers = Some(headers);
        pending.last_touched_ms = now_ms;
    }

    pub fn complete_success(
        &mut self,
        request_id: &str,
        end_ms: f64,
        from_cache: bool,
        server_ip: Option<String>,
    ) -> Option<Completed> {
        let mut pending = self.pending.remove(request_id)?;
        pending.end_ms = Some(end_ms);
        pending.from_cache = from_cache;
        pending.server_ip = server_ip;
        Some(self.finish(pending))
    }

    pub fn complete_error(
        &mut self,
        request_id: &str,
        end_ms: f64,
        error_code: String,
    ) -> Option<Completed> {
        let mut pending = self.pending.remove(request_id)?;
        pending.end_ms = Some(end_ms);
        pending.transport_error = Some(error_code);
        Some(self.finish(pending))
    }

    /// Drops pending requests that have not been touched within the idle window.
    pub fn evict_idle(&mut self) -> usize {
        let cutoff_ms = self.clock.now_ms() - self.settings.pending_idle_ms as f64;
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| pending.last_touched_ms >= cutoff_ms);
        before - self.pending.len()
    }

    fn finish(&self, pending: PendingRequest) -> Completed {
        let entry = synthesis::synthesize(&pending, &self.settings.synthesis);
        Completed {
            request_id: pending.request_id,
            tab_id: pending.tab_id,
            entry,
        }
    }
}
