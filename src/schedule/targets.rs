//! Recorder target notation.
//!
//! Recorders are addressed as `node.instance` (for example `seti-node3.1`).
//! Grouping by node is what recorder tooling expects, so targets are checked
//! and grouped here before they reach a publisher.

use std::collections::BTreeMap;

use crate::error::{SchedError, SchedResult};
use crate::schedule::fields;

/// Groups `node.instance` targets into `node -> [instances]`.
///
/// The split happens at the last `.` so node names may themselves contain dots.
pub fn recorder_targets_to_map(targets: &[String]) -> SchedResult<BTreeMap<String, Vec<u32>>> {
    let mut map: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for target in targets {
        let (node, instance) = target.rsplit_once('.').ok_or_else(|| {
            SchedError::invalid(
                fields::RECORDER_TARGETS,
                format!("'{target}' is not in node.instance form"),
            )
        })?;
        if node.is_empty() {
            return Err(SchedError::invalid(
                fields::RECORDER_TARGETS,
                format!("'{target}' has an empty node name"),
            ));
        }
        let instance: u32 = instance.parse().map_err(|_| {
            SchedError::invalid(
                fields::RECORDER_TARGETS,
                format!("'{target}' has a non-numeric instance"),
            )
        })?;
        let instances = map.entry(node.to_string()).or_default();
        if !instances.contains(&instance) {
            instances.push(instance);
        }
    }
    Ok(map)
}

/// Flattens a `node -> [instances]` map back into `node.instance` targets.
pub fn map_to_recorder_targets(map: &BTreeMap<String, Vec<u32>>) -> Vec<String> {
    map.iter()
        .flat_map(|(node, instances)| instances.iter().map(move |i| format!("{node}.{i}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_groups_by_node() {
        let map = recorder_targets_to_map(&targets(&[
            "seti-node3.0",
            "seti-node3.1",
            "seti-node4.0",
            "seti-node3.1",
        ]))
        .unwrap();
        assert_eq!(map["seti-node3"], vec![0, 1]);
        assert_eq!(map["seti-node4"], vec![0]);
        assert_eq!(
            map_to_recorder_targets(&map),
            vec!["seti-node3.0", "seti-node3.1", "seti-node4.0"]
        );
    }

    #[test]
    fn test_rejects_malformed_targets() {
        assert!(recorder_targets_to_map(&targets(&["seti-node3"])).is_err());
        assert!(recorder_targets_to_map(&targets(&["seti-node3.x"])).is_err());
        assert!(recorder_targets_to_map(&targets(&[".0"])).is_err());
    }
}
