//! Per-session inventory of client and server network interfaces.
//!
//! The table is replaced wholesale on (re)negotiation and merged incrementally
//! from notifier snapshots. Callers hold the owning session's interface-table
//! lock around every method here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use crate::error::{NetsmbError, Result};

/// Index bit marking an RSS sub-channel entry (a queue of a primary interface).
pub const NIC_INDEX_RSS_MARKER: u64 = 1 << 63;
/// Interface supports receive-side scaling.
pub const NIC_CAP_RSS: u32 = 0x1;
/// Interface supports RDMA.
pub const NIC_CAP_RDMA: u32 = 0x2;
/// NIC entries reported by one query.
pub const MAX_NIC_ENTRIES: usize = 32;
/// Addresses reported per NIC entry.
pub const MAX_NIC_ADDRS: usize = 4;
/// Largest snapshot accepted from a caller.
pub const MAX_SNAPSHOT_ENTRIES: usize = 256;

pub fn is_rss_subchannel(index: u64) -> bool {
    index & NIC_INDEX_RSS_MARKER != 0
}

/// Index of the primary interface an entry belongs to.
pub fn primary_index(index: u64) -> u64 {
    index & !NIC_INDEX_RSS_MARKER
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NicType {
    #[default]
    Unknown,
    Wired,
    Wireless,
    Cellular,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NicState {
    #[default]
    Unknown,
    Up,
    Down,
}

/// One interface as known to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicEntry {
    pub index: u64,
    pub capabilities: u32,
    /// Link speed in bits per second.
    pub link_speed: u64,
    pub nic_type: NicType,
    pub state: NicState,
    pub addrs: Vec<SocketAddr>,
}

impl NicEntry {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            capabilities: 0,
            link_speed: 0,
            nic_type: NicType::Unknown,
            state: NicState::Up,
            addrs: Vec::new(),
        }
    }

    pub fn with_speed(mut self, link_speed: u64) -> Self {
        self.link_speed = link_speed;
        self
    }

    pub fn with_rss(mut self) -> Self {
        self.capabilities |= NIC_CAP_RSS;
        self
    }

    pub fn with_rdma(mut self) -> Self {
        self.capabilities |= NIC_CAP_RDMA;
        self
    }

    pub fn with_type(mut self, nic_type: NicType) -> Self {
        self.nic_type = nic_type;
        self
    }

    pub fn with_state(mut self, state: NicState) -> Self {
        self.state = state;
        self
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addrs.push(addr);
        self
    }

    pub fn is_rss_subchannel(&self) -> bool {
        is_rss_subchannel(self.index)
    }

    pub fn has_capability(&self, cap: u32) -> bool {
        self.capabilities & cap != 0
    }

    /// First address of the same family as `ip`.
    pub fn addr_matching(&self, ip: &IpAddr) -> Option<SocketAddr> {
        self.addrs
            .iter()
            .find(|a| a.is_ipv4() == ip.is_ipv4())
            .copied()
    }
}

/// Address family tag used in query replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    #[default]
    Unspecified,
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicAddress {
    pub family: AddressFamily,
    pub addr: IpAddr,
    pub port: u16,
}

/// NIC entry as emitted by [`InterfaceTable::query_nic_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicInfo {
    pub index: u64,
    pub capabilities: u32,
    pub link_speed: u64,
    pub nic_type: NicType,
    pub state: NicState,
    pub addrs: Vec<NicAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NicSelector {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub updated: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceTable {
    client: BTreeMap<u64, NicEntry>,
    server: BTreeMap<u64, NicEntry>,
}

fn check_snapshot(snapshot: &[NicEntry]) -> Result<()> {
    if snapshot.len() > MAX_SNAPSHOT_ENTRIES {
        return Err(NetsmbError::InvalidArgument {
            msg: format!(
                "interface snapshot has {} entries, limit {}",
                snapshot.len(),
                MAX_SNAPSHOT_ENTRIES
            ),
        });
    }
    Ok(())
}

fn to_map(snapshot: Vec<NicEntry>) -> BTreeMap<u64, NicEntry> {
    snapshot.into_iter().map(|nic| (nic.index, nic)).collect()
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces both sets, as done on (re)negotiation.
    pub fn replace(&mut self, client: Vec<NicEntry>, server: Vec<NicEntry>) -> Result<()> {
        check_snapshot(&client)?;
        check_snapshot(&server)?;
        self.client = to_map(client);
        self.server = to_map(server);
        debug!(
            "interface table replaced: {} client, {} server",
            self.client.len(),
            self.server.len()
        );
        Ok(())
    }

    /// Merges a client snapshot by index. Entries the snapshot does not
    /// mention are kept; mentioned entries are replaced, addresses included.
    pub fn merge_client(&mut self, snapshot: Vec<NicEntry>) -> Result<MergeStats> {
        check_snapshot(&snapshot)?;
        let mut stats = MergeStats::default();
        for nic in snapshot {
            match self.client.insert(nic.index, nic) {
                Some(_) => stats.updated += 1,
                None => stats.inserted += 1,
            }
        }
        debug!(
            "client interfaces merged: {} updated, {} inserted, {} total",
            stats.updated,
            stats.inserted,
            self.client.len()
        );
        Ok(stats)
    }

    /// Explicit removal of client interfaces. Returns how many were present.
    pub fn remove_client_nics(&mut self, indices: &[u64]) -> usize {
        let removed = indices
            .iter()
            .filter(|idx| self.client.remove(idx).is_some())
            .count();
        if removed > 0 {
            debug!("removed {} client interfaces", removed);
        }
        removed
    }

    pub fn client_nic(&self, index: u64) -> Option<&NicEntry> {
        self.client.get(&index)
    }

    pub fn server_nic(&self, index: u64) -> Option<&NicEntry> {
        self.server.get(&index)
    }

    pub fn client_nics(&self) -> impl Iterator<Item = &NicEntry> {
        self.client.values()
    }

    pub fn server_nics(&self) -> impl Iterator<Item = &NicEntry> {
        self.server.values()
    }

    pub fn client_count(&self) -> usize {
        self.client.len()
    }

    pub fn server_count(&self) -> usize {
        self.server.len()
    }

    /// Up to [`MAX_NIC_ENTRIES`] entries of the selected set, RSS sub-channel
    /// entries left out. The reply length is the number actually emitted.
    pub fn query_nic_info(&self, selector: NicSelector) -> Vec<NicInfo> {
        let set = match selector {
            NicSelector::Client => &self.client,
            NicSelector::Server => &self.server,
        };
        set.values()
            .filter(|nic| !nic.is_rss_subchannel())
            .take(MAX_NIC_ENTRIES)
            .map(|nic| NicInfo {
                index: nic.index,
                capabilities: nic.capabilities,
                link_speed: nic.link_speed,
                nic_type: nic.nic_type,
                state: nic.state,
                addrs: nic
                    .addrs
                    .iter()
                    .take(MAX_NIC_ADDRS)
                    .map(|a| NicAddress {
                        family: AddressFamily::of(&a.ip()),
                        addr: a.ip(),
                        port: a.port(),
                    })
                    .collect(),
            })
            .collect()
    }
}
