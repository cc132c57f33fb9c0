use std::collections::{BTreeMap, HashSet};

use hsync_core::HackathonRecord;
use serde::Serialize;

/// Records with at most one entry per identity, plus how many were dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeduplicatedSet {
    pub records: Vec<HackathonRecord>,
    pub removed: usize,
}

impl DeduplicatedSet {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record count per status value; records without a status count under `""`.
    pub fn status_distribution(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.status_str().to_string()).or_default() += 1;
        }
        counts
    }
}

/// Keep the highest-priority record for each identity.
///
/// Records are stably sorted by status priority, so among equal priorities the
/// one appearing first in the input wins. Output is in that sorted order.
pub fn dedup(records: Vec<HackathonRecord>) -> DeduplicatedSet {
    let input_len = records.len();
    let mut tagged = records
        .into_iter()
        .map(|record| (record.status_priority(), record.identity(), record))
        .collect::<Vec<_>>();
    tagged.sort_by_key(|(priority, _, _)| *priority);

    let mut seen = HashSet::with_capacity(tagged.len());
    let records = tagged
        .into_iter()
        .filter_map(|(_, identity, record)| seen.insert(identity).then_some(record))
        .collect::<Vec<_>>();

    DeduplicatedSet {
        removed: input_len - records.len(),
        records,
    }
}
