use crate::{
    accumulator::{Accumulator, AccumulatorSettings, Clock, Completed, RequestStart},
    config::Config,
    entry::{FinalizedEntry, Headers, TabId},
    history::HistoryStore,
    persistence::PersistenceHandle,
    reconcile::{self, EqualityPredicate, ReconcileReport, ToleranceMatcher},
    synthesis::SynthesisOptions,
};

/// One inbound lifecycle or tab signal, in the order the capture layer delivered it.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    RequestStart(RequestStart),
    RequestHeaders {
        request_id: String,
        headers: Headers,
    },
    ResponseHeaders {
        request_id: String,
        status_code: u16,
        status_line: String,
        headers: Headers,
    },
    RequestSucceeded {
        request_id: String,
        timestamp_ms: f64,
        from_cache: bool,
        server_ip: Option<String>,
    },
    RequestFailed {
        request_id: String,
        timestamp_ms: f64,
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
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelatorSettings {
    pub accumulator: AccumulatorSettings,
    pub max_entries_per_tab: usize,
    pub tolerance_ms: f64,
    pub clear_on_navigate: bool,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CorrelatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            accumulator: AccumulatorSettings {
                pending_idle_ms: config.capture.pending_idle_ms,
                synthesis: SynthesisOptions {
                    platform_omits_post_bodies: config.capture.platform_omits_post_bodies,
                },
            },
            max_entries_per_tab: config.capture.max_entries_per_tab,
            tolerance_ms: config.reconcile.tolerance_ms,
            clear_on_navigate: config.capture.clear_on_navigate,
        }
    }
}

/// Sole owner of in-flight requests and per-tab history.
#[derive(Debug)]
pub struct Correlator {
    accumulator: Accumulator,
    history: HistoryStore,
    matcher: Box<dyn EqualityPredicate>,
    clear_on_navigate: bool,
    persistence: Option<PersistenceHandle>,
}

impl Correlator {
    pub fn new(clock: Box<dyn Clock>, settings: CorrelatorSettings, history: HistoryStore) -> Self {
        let history = if history.max_per_tab() == settings.max_entries_per_tab {
            history
        } else {
            HistoryStore::from_persisted(history.to_persisted(), settings.max_entries_per_tab)
        };
        Self {
            accumulator: Accumulator::new(clock, settings.accumulator),
            history,
            matcher: Box::new(ToleranceMatcher {
                tolerance_ms: settings.tolerance_ms,
            }),
            clear_on_navigate: settings.clear_on_navigate,
            persistence: None,
        }
    }

    pub fn with_matcher(mut self, matcher: Box<dyn EqualityPredicate>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Every state-changing mutation sends a whole-store snapshot to `handle`.
    pub fn with_persistence(mut self, handle: PersistenceHandle) -> Self {
        self.persistence = Some(handle);
        self
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn pending_len(&self) -> usize {
        self.accumulator.len()
    }

    pub fn apply(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::RequestStart(start) => {
                self.on_request_start(start);
            }
            CaptureEvent::RequestHeaders {
                request_id,
                headers,
            } => self.on_request_headers(&request_id, headers),
            CaptureEvent::ResponseHeaders {
                request_id,
                status_code,
                status_line,
                headers,
            } => self.on_response_headers(&request_id, status_code, status_line, headers),
            CaptureEvent::RequestSucceeded {
                request_id,
                timestamp_ms,
                from_cache,
                server_ip,
            } => {
                self.on_request_succeeded(&request_id, timestamp_ms, from_cache, server_ip);
            }
            CaptureEvent::RequestFailed {
                request_id,
                timestamp_ms,
                error_code,
            } => {
                self.on_request_failed(&request_id, timestamp_ms, error_code);
            }
            CaptureEvent::TabClosed { tab_id } => {
                self.on_tab_closed(tab_id);
            }
            CaptureEvent::Navigated { tab_id } => {
                self.on_navigated(tab_id);
            }
            CaptureEvent::ReconcileLog { tab_id, entries } => {
                self.on_reconcile_log(tab_id, entries);
            }
        }
    }

    pub fn on_request_start(&mut self, start: RequestStart) -> bool {
        self.accumulator.begin_request(start)
    }

    pub fn on_request_headers(&mut self, request_id: &str, headers: Headers) {
        self.accumulator.attach_request_headers(request_id, headers);
    }

    pub fn on_response_headers(
        &mut self,
        request_id: &str,
        status_code: u16,
        status_line: String,
        headers: Headers,
    ) {
        self.accumulator
            .attach_response_headers(request_id, status_code, status_line, headers);
    }

    /// Returns the entry appended to history, if the request was being tracked.
    pub fn on_request_succeeded(
        &mut self,
        request_id: &str,
        timestamp_ms: f64,
        from_cache: bool,
        server_ip: Option<String>,
    ) -> Option<FinalizedEntry> {
        let completed =
            self.accumulator
                .complete_success(request_id, timestamp_ms, from_cache, server_ip)?;
        Some(self.record(completed))
    }

    pub fn on_request_failed(
        &mut self,
        request_id: &str,
        timestamp_ms: f64,
        error_code: String,
    ) -> Option<FinalizedEntry> {
        let completed = self
            .accumulator
            .complete_error(request_id, timestamp_ms, error_code)?;
        Some(self.record(completed))
    }

    /// Clears the tab's history. Closing an unknown or already-closed tab is a no-op.
    pub fn on_tab_closed(&mut self, tab_id: TabId) -> bool {
        let removed = self.history.clear(tab_id);
        if removed {
            tracing::debug!(tab_id, "tab closed; history cleared");
            self.persist();
        }
        removed
    }

    pub fn on_navigated(&mut self, tab_id: TabId) -> bool {
        if !self.clear_on_navigate {
            tracing::trace!(tab_id, "navigation ignored");
            return false;
        }
        let removed = self.history.clear(tab_id);
        if removed {
            tracing::debug!(tab_id, "tab navigated; history cleared");
            self.persist();
        }
        removed
    }

    pub fn on_reconcile_log(
        &mut self,
        tab_id: TabId,
        entries: Vec<FinalizedEntry>,
    ) -> ReconcileReport {
        let report = reconcile::reconcile(&mut self.history, tab_id, entries, &*self.matcher);
        if report.changed() {
            self.persist();
        }
        report
    }

    pub fn entries(&self, tab_id: TabId) -> Vec<FinalizedEntry> {
        self.history.snapshot(tab_id)
    }

    pub fn clear_entries(&mut self, tab_id: TabId) -> bool {
        let removed = self.history.clear(tab_id);
        if removed {
            self.persist();
        }
        removed
    }

    pub fn sweep_idle(&mut self) -> usize {
        let evicted = self.accumulator.evict_idle();
        if evicted > 0 {
            tracing::debug!(
                evicted,
                pending = self.accumulator.len(),
                "evicted idle pending requests"
            );
        }
        evicted
    }

    fn record(&mut self, completed: Completed) -> FinalizedEntry {
        let Completed {
            request_id,
            tab_id,
            entry,
        } = completed;
        let evicted = self.history.append(tab_id, entry.clone());
        tracing::debug!(
            %request_id,
            tab_id,
            status = entry.response.status,
            evicted,
            "request finalized"
        );
        self.persist();
        entry
    }

    fn persist(&self) {
        if let Some(persistence) = self.persistence.as_ref() {
            persistence.save(self.history.to_persisted());
        }
    }
}
