use std::borrow::Cow;

use crate::{
    entry::{FinalizedEntry, TabId},
    history::HistoryStore,
};

pub const DEFAULT_TOLERANCE_MS: f64 = 10.0;

/// Decides whether an incoming entry describes the same physical request as
/// one already captured.
pub trait EqualityPredicate: Send + std::fmt::Debug {
    fn is_duplicate(&self, existing: &FinalizedEntry, incoming: &FinalizedEntry) -> bool;
}

/// Same normalized URL and elapsed times within `tolerance_ms` of each other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToleranceMatcher {
    pub tolerance_ms: f64,
}

impl Default for ToleranceMatcher {
    fn default() -> Self {
        Self {
            tolerance_ms: DEFAULT_TOLERANCE_MS,
        }
    }
}

impl EqualityPredicate for ToleranceMatcher {
    fn is_duplicate(&self, existing: &FinalizedEntry, incoming: &FinalizedEntry) -> bool {
        (existing.elapsed_ms - incoming.elapsed_ms).abs() <= self.tolerance_ms
            && normalize_url(&existing.request.url) == normalize_url(&incoming.request.url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Novel,
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub decisions: Vec<Decision>,
    pub novel: usize,
    pub duplicates: usize,
    pub evicted: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.novel > 0
    }
}

/// Merges an independently captured log into `tab_id`'s history.
///
/// Incoming entries are compared against the entries present before the
/// batch; each existing entry absorbs at most one incoming duplicate. Novel
/// entries are appended in incoming order.
pub fn reconcile(
    store: &mut HistoryStore,
    tab_id: TabId,
    incoming: Vec<FinalizedEntry>,
    predicate: &dyn EqualityPredicate,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    if tab_id < 0 {
        return report;
    }

    let existing = store.snapshot(tab_id);
    let mut consumed = vec![false; existing.len()];
    let mut novel = Vec::new();

    for entry in incoming {
        let matched = (0..existing.len())
            .find(|&index| !consumed[index] && predicate.is_duplicate(&existing[index], &entry));

        match matched {
            Some(index) => {
                consumed[index] = true;
                report.decisions.push(Decision::Duplicate);
                report.duplicates += 1;
            }
            None => {
                report.decisions.push(Decision::Novel);
                report.novel += 1;
                novel.push(entry);
            }
        }
    }

    for entry in novel {
        report.evicted += store.append(tab_id, entry);
    }

    tracing::debug!(
        tab_id,
        novel = report.novel,
        duplicates = report.duplicates,
        evicted = report.evicted,
        "reconciled external transaction log"
    );
    report
}

/// Canonical form of a URL for duplicate detection: fragment dropped, scheme
/// and host lowercased, default port removed, empty path replaced by `/`.
pub fn normalize_url(url: &str) -> Cow<'_, str> {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or_default();

    let Some((scheme, rest)) = without_fragment.split_once("://") else {
        return Cow::Borrowed(without_fragment);
    };
    let scheme = scheme.to_ascii_lowercase();

    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, path_and_query) = rest.split_at(authority_end);
    let (userinfo, host_port) = match authority.rsplit_once('@') {
        Some((userinfo, host_port)) => (Some(userinfo), host_port),
        None => (None, authority),
    };

    let mut host_port = host_port.to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "http" | "ws" => Some(":80"),
        "https" | "wss" => Some(":443"),
        _ => None,
    };
    if let Some(default_port) = default_port {
        if host_port.ends_with(default_port) {
            host_port.truncate(host_port.len() - default_port.len());
        }
    }

    let mut normalized = String::with_capacity(without_fragment.len());
    normalized.push_str(&scheme);
    normalized.push_str("://");
    if let Some(userinfo) = userinfo {
        normalized.push_str(userinfo);
        normalized.push('@');
    }
    normalized.push_str(&host_port);
    if !path_and_query.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(path_and_query);
    Cow::Owned(normalized)
}

#[cfg(test)]
mod tests {
    use super::{Decision, EqualityPredicate, ToleranceMatcher, normalize_url, reconcile};
    use crate::{
        entry::FinalizedEntry,
        history::{HistoryStore, tests::entry},
    };

    #[test]
    fn normalize_url_canonicalizes_scheme_host_port_and_fragment() {
        assert_eq!(
            normalize_url("HTTPS://Example.TEST:443/Path?Q=1#frag"),
            "https://example.test/Path?Q=1"
        );
        assert_eq!(normalize_url("http://a.test:80"), "http://a.test/");
        assert_eq!(normalize_url("http://a.test?x=1"), "http://a.test/?x=1");
        assert_eq!(normalize_url("http://a.test:8080/"), "http://a.test:8080/");
        assert_eq!(normalize_url("data:text/plain,hi"), "data:text/plain,hi");
        assert_eq!(normalize_url(" https://u@A.test/x "), "https://u@a.test/x");
    }

    #[test]
    fn tolerance_matcher_requires_url_and_elapsed_time_match() {
        let matcher = ToleranceMatcher::default();
        let existing = entry("https://a.test/x", 50.0);

        assert!(matcher.is_duplicate(&existing, &entry("https://A.test:443/x#top", 58.0)));
        assert!(matcher.is_duplicate(&existing, &entry("https://a.test/x", 40.0)));
        assert!(!matcher.is_duplicate(&existing, &entry("https://a.test/x", 61.0)));
        assert!(!matcher.is_duplicate(&existing, &entry("https://a.test/y", 50.0)));

        let wide = ToleranceMatcher {
            tolerance_ms: 100.0,
        };
        assert!(wide.is_duplicate(&existing, &entry("https://a.test/x", 140.0)));
    }

    #[test]
    fn duplicate_entries_do_not_grow_the_tab() {
        let mut store = HistoryStore::new(200);
        store.append(7, entry("https://a.test/x", 50.0));

        let report = reconcile(
            &mut store,
            7,
            vec![entry("https://a.test/x", 55.0)],
            &ToleranceMatcher::default(),
        );
        assert_eq!(report.decisions, vec![Decision::Duplicate]);
        assert!(!report.changed());
        assert_eq!(store.len(7), 1);

        let report = reconcile(
            &mut store,
            7,
            vec![entry("https://a.test/other", 55.0)],
            &ToleranceMatcher::default(),
        );
        assert_eq!(report.decisions, vec![Decision::Novel]);
        assert_eq!(store.len(7), 2);
    }

    #[test]
    fn each_existing_entry_absorbs_at_most_one_duplicate() {
        let mut store = HistoryStore::new(200);
        store.append(7, entry("https://a.test/poll", 20.0));

        let report = reconcile(
            &mut store,
            7,
            vec![
                entry("https://a.test/poll", 21.0),
                entry("https://a.test/poll", 22.0),
            ],
            &ToleranceMatcher::default(),
        );

        assert_eq!(report.decisions, vec![Decision::Duplicate, Decision::Novel]);
        assert_eq!(report.novel, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(store.len(7), 2);
    }

    #[test]
    fn novel_entries_follow_the_history_bound() {
        let mut store = HistoryStore::new(2);
        store.append(1, entry("https://a.test/0", 0.0));

        let report = reconcile(
            &mut store,
            1,
            vec![entry("https://a.test/1", 0.0), entry("https://a.test/2", 0.0)],
            &ToleranceMatcher::default(),
        );

        assert_eq!(report.evicted, 1);
        let urls: Vec<String> = store
            .snapshot(1)
            .into_iter()
            .map(|entry| entry.request.url)
            .collect();
        assert_eq!(urls, vec!["https://a.test/1", "https://a.test/2"]);
    }

    #[test]
    fn custom_predicates_drive_the_decision() {
        #[derive(Debug)]
        struct SameMethod;

        impl EqualityPredicate for SameMethod {
            fn is_duplicate(&self, existing: &FinalizedEntry, incoming: &FinalizedEntry) -> bool {
                existing.request.method == incoming.request.method
            }
        }

        let mut store = HistoryStore::new(10);
        store.append(3, entry("https://a.test/x", 0.0));
        let report = reconcile(
            &mut store,
            3,
            vec![entry("https://b.test/unrelated", 900.0)],
            &SameMethod,
        );
        assert_eq!(report.decisions, vec![Decision::Duplicate]);
    }

    #[test]
    fn negative_tab_ids_are_ignored() {
        let mut store = HistoryStore::new(10);
        let report = reconcile(
            &mut store,
            -1,
            vec![entry("https://a.test/x", 0.0)],
            &ToleranceMatcher::default(),
        );
        assert!(report.decisions.is_empty());
        assert!(store.is_empty());
    }
}
