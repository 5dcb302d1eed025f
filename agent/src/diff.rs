//! Drift classification between two snapshots.
//!
//! Records are matched by `resource_id` within each service. A record that
//! is present on both sides is reported as changed when any part of it
//! differs, including the order of its findings.

use std::collections::{BTreeSet, HashMap};

use common::{ChangeSet, ChangedRecord, ResourceRecord, ServiceChanges, Snapshot};

pub fn diff(previous: &Snapshot, current: &Snapshot) -> ChangeSet {
    let services: BTreeSet<&str> = previous.services().chain(current.services()).collect();

    let mut changes = ChangeSet::default();
    for service in services {
        changes.insert(service, diff_service(previous.records(service), current.records(service)));
    }
    changes
}

fn diff_service(previous: &[ResourceRecord], current: &[ResourceRecord]) -> ServiceChanges {
    let prev_index = index_by_id(previous);
    let curr_index = index_by_id(current);

    let mut changes = ServiceChanges::default();

    for (pos, record) in current.iter().enumerate() {
        // Duplicate ids: only the last occurrence counts.
        if curr_index[record.resource_id.as_str()] != pos {
            continue;
        }
        match prev_index.get(record.resource_id.as_str()) {
            None => changes.new.push(record.clone()),
            Some(&prev_pos) => {
                let before = &previous[prev_pos];
                if before != record {
                    changes.changed.push(ChangedRecord {
                        resource_id: record.resource_id.clone(),
                        previous: before.clone(),
                        current: record.clone(),
                    });
                }
            }
        }
    }

    for (pos, record) in previous.iter().enumerate() {
        if prev_index[record.resource_id.as_str()] != pos {
            continue;
        }
        if !curr_index.contains_key(record.resource_id.as_str()) {
            changes.resolved.push(record.clone());
        }
    }

    changes
}

fn index_by_id(records: &[ResourceRecord]) -> HashMap<&str, usize> {
    records
        .iter()
        .enumerate()
        .map(|(pos, r)| (r.resource_id.as_str(), pos))
        .collect()
}
