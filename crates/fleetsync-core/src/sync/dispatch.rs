//! Host to shard partitioning

use std::collections::{HashMap, HashSet};

use fleetsync_api::requests::HostEntry;

use crate::error::CoreError;
use crate::inventory::shard_of;

/// Hosts of one shard, at most the bucket capacity
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub shard: u8,
    pub hosts: Vec<HostEntry>,
}

/// Partition `hosts` by shard into batches of at most `capacity` hosts
///
/// A full batch is sealed and the next host of that shard opens a new one.
/// Batches come out in the order they were opened; repeated host ids are
/// kept once.
///
/// # Errors
/// Returns `CoreError::Validation` if a host id has no shard digit.
pub fn dispatch(
    hosts: Vec<HostEntry>,
    offset: usize,
    shard_count: u8,
    capacity: usize,
) -> Result<Vec<Batch>, CoreError> {
    let capacity = capacity.max(1);
    let mut batches: Vec<Batch> = Vec::new();
    let mut open: HashMap<u8, usize> = HashMap::new();
    let mut seen = HashSet::new();

    for host in hosts {
        if !seen.insert(host.host.clone()) {
            continue;
        }
        let shard = shard_of(&host.host, offset, shard_count)?;

        match open.get(&shard) {
            Some(&index) if batches[index].hosts.len() < capacity => {
                batches[index].hosts.push(host);
            }
            _ => {
                open.insert(shard, batches.len());
                batches.push(Batch {
                    shard,
                    hosts: vec![host],
                });
            }
        }
    }

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: String) -> HostEntry {
        HostEntry {
            hostname: format!("host-{id}"),
            host: id,
            context: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_overflow_opens_new_batch() {
        let hosts = (0..300)
            .map(|i| host(format!("0000000a-{i:04}")))
            .collect();
        let batches = dispatch(hosts, 7, 16, 128).unwrap();

        let sizes: Vec<usize> = batches.iter().map(|b| b.hosts.len()).collect();
        assert_eq!(sizes, vec![128, 128, 44]);
        assert!(batches.iter().all(|b| b.shard == 10));
    }

    #[test]
    fn test_shards_never_share_a_batch() {
        let hosts = (0..40)
            .map(|i| host(format!("0000000{:x}-{i:04}", i % 4)))
            .collect();
        let batches = dispatch(hosts, 7, 16, 8).unwrap();

        assert_eq!(batches.len(), 8);
        for batch in &batches {
            assert!(batch.hosts.len() <= 8);
            assert!(
                batch
                    .hosts
                    .iter()
                    .all(|h| shard_of(&h.host, 7, 16).unwrap() == batch.shard)
            );
        }
    }

    #[test]
    fn test_repeated_hosts_and_bad_ids() {
        let hosts = vec![host("0000000a-1".into()), host("0000000a-1".into())];
        let batches = dispatch(hosts, 7, 16, 128).unwrap();
        assert_eq!(batches[0].hosts.len(), 1);

        assert!(dispatch(vec![host("zz".into())], 7, 16, 128).is_err());
    }
}
