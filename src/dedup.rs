//! Report-on-change cache.
//!
//! Remembers the last payload reported per query so periodic exchanges
//! returning the same data are not sent upstream again. Purely a
//! transmission filter; losing it only costs one redundant report.
use crate::protocol::QueryId;
use crate::report::MAX_REPORT_PAYLOAD;

pub const CACHE_ENTRIES: usize = 60;

#[derive(Debug, Clone, Copy)]
struct Entry {
    query: QueryId,
    len: usize,
    data: [u8; MAX_REPORT_PAYLOAD],
}

impl Entry {
    fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    fn store(&mut self, payload: &[u8]) {
        self.len = payload.len().min(MAX_REPORT_PAYLOAD);
        self.data[..self.len].copy_from_slice(&payload[..self.len]);
    }
}

#[derive(Debug, Clone)]
pub struct DedupCache {
    entries: [Option<Entry>; CACHE_ENTRIES],
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupCache {
    pub const fn new() -> Self {
        Self {
            entries: [None; CACHE_ENTRIES],
        }
    }

    pub fn clear(&mut self) {
        self.entries = [None; CACHE_ENTRIES];
    }

    /// Records `payload` for `query` and tells whether it must be reported.
    ///
    /// Unchanged payloads are suppressed. A full cache without an entry for
    /// `query` always reports.
    pub fn should_report(&mut self, query: QueryId, payload: &[u8]) -> bool {
        if let Some(entry) = self.entries.iter_mut().flatten().find(|e| e.query == query) {
            if entry.payload() == payload {
                return false;
            }
            entry.store(payload);
            return true;
        }
        if let Some(slot) = self.entries.iter_mut().find(|e| e.is_none()) {
            let mut entry = Entry {
                query,
                len: 0,
                data: [0; MAX_REPORT_PAYLOAD],
            };
            entry.store(payload);
            *slot = Some(entry);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
