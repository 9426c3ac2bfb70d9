//! Pure decision logic for synchronizing parsed feed items against stored
//! entries. No I/O here; the puller applies the result inside its
//! transaction.

use std::collections::{BTreeMap, HashMap};

use super::ParsedItem;

/// Outcome of diffing parsed items against a feed's stored entries.
///
/// Items whose resolved update time matches the stored one are dropped;
/// they appear in neither set and the pull result never mentions them.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EntryDiff {
    /// Items with no stored ExtID match.
    pub inserts: Vec<ParsedItem>,
    /// Items whose stored counterpart has a different resolved update time.
    pub updates: Vec<ParsedItem>,
}

impl EntryDiff {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }

    /// ExtIDs of every insert and update, in a stable order.
    pub fn changed_ext_ids(&self) -> Vec<&str> {
        self.inserts
            .iter()
            .chain(self.updates.iter())
            .map(|item| item.ext_id.as_str())
            .collect()
    }
}

/// Compare freshly parsed items against the stored `(ext_id, update_time)`
/// pairs of one feed.
///
/// Matching key is the ExtID. A match is an update only when the item's
/// resolved update time differs from the stored value; equal timestamps
/// (including both absent) leave the entry untouched. The result depends
/// only on ExtIDs and timestamps, never on item order: duplicate ExtIDs
/// within one batch collapse to the occurrence with the greatest resolved
/// time, `None` ranking lowest.
pub fn diff_entries(existing: &[(String, Option<i64>)], items: &[ParsedItem]) -> EntryDiff {
    let stored: HashMap<&str, Option<i64>> = existing
        .iter()
        .map(|(ext_id, updated)| (ext_id.as_str(), *updated))
        .collect();

    // BTreeMap keeps the output ordering independent of input order.
    let mut collapsed: BTreeMap<&str, &ParsedItem> = BTreeMap::new();
    for item in items {
        collapsed
            .entry(item.ext_id.as_str())
            .and_modify(|kept| {
                if item.resolved_updated() > kept.resolved_updated() {
                    *kept = item;
                }
            })
            .or_insert(item);
    }

    let mut diff = EntryDiff::default();
    for (ext_id, item) in collapsed {
        match stored.get(ext_id) {
            None => diff.inserts.push(item.clone()),
            Some(stored_updated) if item.resolved_updated() != *stored_updated => {
                diff.updates.push(item.clone());
            }
            Some(_) => {}
        }
    }
    diff
}
