use anyhow::{Context, Result};
use tracing as log;

use crate::{
    error::KairosError,
    tooling::{HostPort, Tooling, host::parse_db_path},
    topology::{LunRef, Topology, VolumeMapping},
};

/// Resolves which array LUNs hold each data-bearing member's data directory.
pub struct StorageMapper<'a> {
    tools: &'a dyn Tooling,
    ssh_user: &'a str,
    conf_path: &'a str,
}

impl<'a> StorageMapper<'a> {
    pub fn new(tools: &'a dyn Tooling, ssh_user: &'a str, conf_path: &'a str) -> Self {
        Self {
            tools,
            ssh_user,
            conf_path,
        }
    }

    /// Attaches a `VolumeMapping` to every PRIMARY/SECONDARY member, shards included.
    pub fn annotate(&self, topology: &mut Topology) -> Result<()> {
        for m in topology.members_mut() {
            if !m.role.is_data_bearing() {
                log::debug!("[map] skipping {} ({})", m.network_name, m.role);
                continue;
            }
            let host = self.tools.host(m.host(), self.ssh_user);
            let mapping = self
                .map_member(host.as_ref())
                .with_context(|| format!("map storage of {}", m.network_name))?;
            log::info!(
                "[map] {} -> {} on {:?}",
                m.network_name,
                mapping.mountpoint,
                mapping.volumes()
            );
            m.storage = Some(mapping);
        }
        Ok(())
    }

    pub fn map_member(&self, host: &dyn HostPort) -> Result<VolumeMapping> {
        let conf = host.read_file(self.conf_path)?;
        let db_path = parse_db_path(&conf)
            .with_context(|| format!("{}: {}", host.address(), self.conf_path))?
            .ok_or_else(|| {
                KairosError::Validation(format!(
                    "{}: no storage.dbPath in {}",
                    host.address(),
                    self.conf_path
                ))
            })?;
        let mount = host.find_mount(&db_path)?;

        let vg = host.logical_volume_group(&mount.source)?;
        let devices = match &vg {
            Some(vg) => {
                let devs = host.volume_group_devices(vg)?;
                if devs.is_empty() {
                    return Err(KairosError::Validation(format!(
                        "{}: volume group {vg} has no physical volumes",
                        host.address()
                    ))
                    .into());
                }
                devs
            }
            None => {
                log::debug!(
                    "[map] {}: {} is not a logical volume, mapping it directly",
                    host.address(),
                    mount.source
                );
                vec![mount.source.clone()]
            }
        };

        let san = host.san_luns()?;
        let mut luns: Vec<LunRef> = Vec::with_capacity(devices.len());
        for dev in &devices {
            let lun = san.iter().find(|l| l.backs(dev)).ok_or_else(|| {
                KairosError::Validation(format!(
                    "{}: device {dev} is not backed by an array LUN",
                    host.address()
                ))
            })?;
            luns.push(LunRef {
                svm_name: lun.svm_name.clone(),
                volume: lun.volume.clone(),
                lun_name: lun.lun_name.clone(),
                lun_id: lun.lun_id.clone(),
            });
        }

        Ok(VolumeMapping {
            mountpoint: mount.target,
            fs_type: mount.fstype,
            block_device: mount.source,
            volume_group_name: vg,
            luns,
        })
    }
}
