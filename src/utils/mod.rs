pub mod bins;
pub mod lock;
pub mod process;

pub mod time {
    use anyhow::Result;
    use time::{OffsetDateTime, format_description::well_known::Rfc3339};

    #[inline]
    pub fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[inline]
    pub fn current_epoch() -> u64 {
        u64::try_from(now().unix_timestamp()).unwrap_or(0)
    }

    pub fn fmt_utc(ts: OffsetDateTime) -> Result<String> {
        Ok(ts.to_offset(time::UtcOffset::UTC).format(&Rfc3339)?) // "YYYY-MM-DDTHH:MM:SSZ"
    }

}

pub mod naming {
    use anyhow::{Result, bail};

    /// Cloned volume: unique per clone uid so repeated clones of one backup never collide.
    pub fn clone_volume_name(clone: &str, parent_volume: &str, uid: u64) -> String {
        format!("{clone}_{parent_volume}_{uid}")
    }

    pub fn igroup_name(hostname: &str, clone: &str) -> String {
        format!("ig_{hostname}_{clone}")
    }

    pub fn lun_path(volume: &str, lun: &str) -> String {
        format!("/vol/{volume}/{lun}")
    }

    /// `"rs1/h1:27017,h2:27017"` -> `("rs1", ["h1:27017", "h2:27017"])`.
    pub fn parse_seed_list(s: &str) -> Result<(String, Vec<String>)> {
        let Some((set, hosts)) = s.split_once('/') else {
            bail!("invalid replica set seed list: {s}");
        };
        let hosts: Vec<String> = hosts
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if set.trim().is_empty() || hosts.is_empty() {
            bail!("invalid replica set seed list: {s}");
        }
        Ok((set.trim().to_string(), hosts))
    }

    pub fn seed_list<S: AsRef<str>>(set: &str, hosts: &[S]) -> String {
        let joined = hosts
            .iter()
            .map(|h| h.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        format!("{set}/{joined}")
    }

    /// `host:port` -> `host`
    #[inline]
    pub fn host_of(network_name: &str) -> &str {
        network_name
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(network_name)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn clone_names_are_namespaced_by_uid() {
            assert_eq!(clone_volume_name("c1", "mdb_data", 7), "c1_mdb_data_7");
            assert_ne!(
                clone_volume_name("c1", "v", 1),
                clone_volume_name("c1", "v", 2)
            );
        }

        #[test]
        fn seed_list_roundtrip() {
            let (set, hosts) = parse_seed_list("rs1/h1:27017, h2:27017").unwrap();
            assert_eq!(set, "rs1");
            assert_eq!(hosts, vec!["h1:27017", "h2:27017"]);
            assert_eq!(seed_list(&set, &hosts), "rs1/h1:27017,h2:27017");
        }

        #[test]
        fn seed_list_rejects_missing_set() {
            assert!(parse_seed_list("h1:27017").is_err());
            assert!(parse_seed_list("rs1/").is_err());
        }

        #[test]
        fn host_of_strips_port() {
            assert_eq!(host_of("db1.example:27018"), "db1.example");
            assert_eq!(host_of("db1"), "db1");
        }

        #[test]
        fn igroup_and_lun_paths() {
            assert_eq!(igroup_name("db1", "c1"), "ig_db1_c1");
            assert_eq!(lun_path("c1_v_3", "lun0"), "/vol/c1_v_3/lun0");
        }
    }
}
