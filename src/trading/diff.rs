//! Snapshot diffing.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::models::{Change, PositionRecord, Snapshot};

/// Compare a stored snapshot against a freshly fetched one.
///
/// With no stored snapshot (cold start) nothing is emitted; the caller keeps
/// `new` as the baseline. Ratio moves of at most `noise_threshold` points are
/// dropped. Output order is unspecified.
pub fn diff(old: Option<&Snapshot>, new: &Snapshot, noise_threshold: Decimal) -> Vec<Change> {
    let Some(old) = old else {
        return Vec::new();
    };

    let before: HashMap<&str, &PositionRecord> = old
        .record_items
        .iter()
        .map(|r| (r.instrument_code.as_str(), r))
        .collect();
    let after: HashMap<&str, &PositionRecord> = new
        .record_items
        .iter()
        .map(|r| (r.instrument_code.as_str(), r))
        .collect();

    let mut changes = Vec::new();

    for record in &new.record_items {
        match before.get(record.instrument_code.as_str()) {
            Some(prev) => {
                let delta = (record.total_ratio - prev.total_ratio).abs();
                if delta > noise_threshold {
                    changes.extend(Change::between(Some((*prev).clone()), Some(record.clone())));
                }
            }
            None => changes.extend(Change::between(None, Some(record.clone()))),
        }
    }

    for record in &old.record_items {
        if !after.contains_key(record.instrument_code.as_str()) {
            changes.extend(Change::between(Some(record.clone()), None));
        }
    }

    changes
}
