//! Replica slot indexing
//!
//! Groups a job's observed pods or services by their `replica-index` label
//! into a slot array the reconciler diffs against the declared count.

use kube::ResourceExt;
use tracing::warn;

use trainops_common::LABEL_REPLICA_INDEX;

/// Group objects by their slot index.
///
/// The returned array has length `max(replicas, maxObservedIndex + 1)` so
/// that slots beyond the declared count (scale-down leftovers) remain
/// visible to the caller. Position `i` holds every object claiming index
/// `i` — more than one occupant means a duplicate, none means a gap.
///
/// Objects without a parseable integer index label are logged and skipped;
/// they were not created by this controller and have no slot.
pub fn group_by_slot<K>(items: Vec<K>, replicas: i32) -> Vec<Vec<K>>
where
    K: ResourceExt,
{
    let mut indexed = Vec::with_capacity(items.len());
    let mut max_index = 0usize;
    for item in items {
        let label = item.labels().get(LABEL_REPLICA_INDEX).cloned();
        match label.as_deref().map(str::parse::<usize>) {
            Some(Ok(index)) => {
                max_index = max_index.max(index);
                indexed.push((index, item));
            }
            _ => {
                warn!(
                    name = %item.name_any(),
                    index_label = ?label,
                    "object has no valid replica index label, skipping"
                );
            }
        }
    }

    let len = (replicas.max(0) as usize).max(if indexed.is_empty() { 0 } else { max_index + 1 });
    let mut slots: Vec<Vec<K>> = std::iter::repeat_with(Vec::new).take(len).collect();
    for (index, item) in indexed {
        slots[index].push(item);
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(name: &str, index: Option<&str>) -> Pod {
        let mut labels = BTreeMap::new();
        if let Some(index) = index {
            labels.insert(LABEL_REPLICA_INDEX.to_string(), index.to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn groups_pods_into_declared_slots() {
        let pods = vec![pod("w-0", Some("0")), pod("w-1", Some("1"))];
        let slots = group_by_slot(pods, 2);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].len(), 1);
        assert_eq!(slots[1].len(), 1);
    }

    #[test]
    fn gaps_produce_empty_slots() {
        let pods = vec![pod("w-1", Some("1"))];
        let slots = group_by_slot(pods, 3);
        assert_eq!(slots.len(), 3);
        assert!(slots[0].is_empty());
        assert_eq!(slots[1].len(), 1);
        assert!(slots[2].is_empty());
    }

    #[test]
    fn duplicates_share_a_slot() {
        let pods = vec![pod("w-0a", Some("0")), pod("w-0b", Some("0"))];
        let slots = group_by_slot(pods, 1);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].len(), 2);
    }

    #[test]
    fn out_of_range_indices_extend_the_array() {
        let pods = vec![pod("w-4", Some("4"))];
        let slots = group_by_slot(pods, 2);
        assert_eq!(slots.len(), 5);
        assert_eq!(slots[4].len(), 1);
    }

    #[test]
    fn invalid_index_labels_are_skipped() {
        let pods = vec![
            pod("no-label", None),
            pod("bad-label", Some("not-a-number")),
            pod("w-0", Some("0")),
        ];
        let slots = group_by_slot(pods, 1);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].len(), 1);
        assert_eq!(slots[0][0].metadata.name.as_deref(), Some("w-0"));
    }

    #[test]
    fn no_items_yields_declared_length() {
        let slots = group_by_slot(Vec::<Pod>::new(), 3);
        assert_eq!(slots.len(), 3);
        assert!(slots.iter().all(Vec::is_empty));
    }
}
