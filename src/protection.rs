use anyhow::Result;

use crate::{error::KairosError, topology::Topology};

/// Volumes snapshotted together in one consistency-group call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionSet {
    pub svm_name: String,
    pub volumes: Vec<String>,
    pub snapshot_name: String,
    /// Member the set was derived from, for logs.
    pub group_label: String,
}

/// One set per data-bearing member, even when members share an SVM.
/// Arbiters never contribute storage.
pub fn build(topology: &Topology, snapshot: &str) -> Result<Vec<ProtectionSet>> {
    let mut out = Vec::new();
    for m in topology.data_bearing() {
        let Some(map) = &m.storage else {
            return Err(KairosError::Validation(format!(
                "member {} has no storage mapping",
                m.network_name
            ))
            .into());
        };
        let Some(first) = map.luns.first() else {
            return Err(KairosError::Validation(format!(
                "member {} is not backed by any LUN",
                m.network_name
            ))
            .into());
        };
        if let Some(other) = map.luns.iter().find(|l| l.svm_name != first.svm_name) {
            return Err(KairosError::Validation(format!(
                "member {} spans SVMs {} and {}",
                m.network_name, first.svm_name, other.svm_name
            ))
            .into());
        }
        out.push(ProtectionSet {
            svm_name: first.svm_name.clone(),
            volumes: map.volumes(),
            snapshot_name: snapshot.to_string(),
            group_label: m.network_name.clone(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{
        LunRef,
        fixtures::{mapped_replica_set, mapped_sharded, replica_set},
    };

    #[test]
    fn one_set_per_data_bearing_member() {
        let sets = build(&mapped_replica_set(), "bkp1").unwrap();
        assert_eq!(sets.len(), 3);
        let groups: Vec<(&str, Vec<String>)> = sets
            .iter()
            .map(|s| (s.svm_name.as_str(), s.volumes.clone()))
            .collect();
        assert_eq!(
            groups,
            vec![
                ("svm1", vec!["volA".to_string()]),
                ("svm1", vec!["volB".to_string()]),
                ("svm2", vec!["volC".to_string()]),
            ]
        );
        assert!(sets.iter().all(|s| s.snapshot_name == "bkp1"));
    }

    #[test]
    fn sharded_includes_config_servers() {
        let sets = build(&mapped_sharded(), "s").unwrap();
        let vols: Vec<String> = sets.iter().flat_map(|s| s.volumes.clone()).collect();
        assert_eq!(vols, vec!["cfgvol", "sh1vol", "sh2vol"]);
    }

    #[test]
    fn unmapped_member_rejected() {
        let err = build(&replica_set(), "s").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KairosError>(),
            Some(KairosError::Validation(_))
        ));
    }

    #[test]
    fn member_on_two_svms_rejected() {
        let mut topo = mapped_replica_set();
        let m = topo.members_mut().into_iter().next().unwrap();
        m.storage.as_mut().unwrap().luns.push(LunRef {
            svm_name: "svm9".into(),
            volume: "volZ".into(),
            lun_name: "lun0".into(),
            lun_id: "0".into(),
        });
        let err = build(&topo, "s").unwrap_err();
        assert!(err.to_string().contains("spans SVMs"));
    }
}
