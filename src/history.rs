use std::collections::{BTreeMap, VecDeque};

use crate::entry::{FinalizedEntry, TabId};

pub const DEFAULT_MAX_ENTRIES_PER_TAB: usize = 200;

/// Serialized form of the whole store: tab id (as a string) to entries, oldest first.
pub type PersistedHistory = BTreeMap<String, Vec<FinalizedEntry>>;

/// Bounded per-tab history of finalized entries, oldest evicted first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryStore {
    tabs: BTreeMap<TabId, VecDeque<FinalizedEntry>>,
    max_per_tab: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES_PER_TAB)
    }
}

impl HistoryStore {
    pub fn new(max_per_tab: usize) -> Self {
        Self {
            tabs: BTreeMap::new(),
            max_per_tab: max_per_tab.max(1),
        }
    }

    pub fn max_per_tab(&self) -> usize {
        self.max_per_tab
    }

    /// Appends to the tail of the tab's sequence and returns how many entries
    /// were dropped from the head to stay within the bound.
    pub fn append(&mut self, tab_id: TabId, entry: FinalizedEntry) -> usize {
        let entries = self.tabs.entry(tab_id).or_default();
        entries.push_back(entry);

        let mut evicted = 0;
        while entries.len() > self.max_per_tab {
            entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Returns `true` when the tab had history to remove.
    pub fn clear(&mut self, tab_id: TabId) -> bool {
        self.tabs.remove(&tab_id).is_some()
    }

    pub fn snapshot(&self, tab_id: TabId) -> Vec<FinalizedEntry> {
        self.tabs
            .get(&tab_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entries(&self, tab_id: TabId) -> impl Iterator<Item = &FinalizedEntry> {
        self.tabs.get(&tab_id).into_iter().flatten()
    }

    pub fn len(&self, tab_id: TabId) -> usize {
        self.tabs.get(&tab_id).map_or(0, VecDeque::len)
    }

    pub fn tab_ids(&self) -> impl Iterator<Item = TabId> + '_ {
        self.tabs.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    pub fn to_persisted(&self) -> PersistedHistory {
        self.tabs
            .iter()
            .map(|(tab_id, entries)| (tab_id.to_string(), entries.iter().cloned().collect()))
            .collect()
    }

    /// Rebuilds a store from its serialized form. Keys that are not tab ids are
    /// skipped, and tabs over the bound keep only their newest entries.
    pub fn from_persisted(persisted: PersistedHistory, max_per_tab: usize) -> Self {
        let mut store = Self::new(max_per_tab);
        for (key, entries) in persisted {
            let Ok(tab_id) = key.trim().parse::<TabId>() else {
                tracing::warn!(key = %key, "skipping persisted history with non-numeric tab id");
                continue;
            };
            if entries.is_empty() {
                continue;
            }
            let skip = entries.len().saturating_sub(store.max_per_tab);
            store
                .tabs
                .insert(tab_id, entries.into_iter().skip(skip).collect());
        }
        store
    }
}
