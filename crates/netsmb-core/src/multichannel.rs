//! Alternate channel establishment and the notifier-driven session walk.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelFlags};
use crate::config::MultichannelConfig;
use crate::error::{NetsmbError, Result};
use crate::interface::{primary_index, InterfaceTable, NicEntry, NicState, NIC_CAP_RDMA};
use crate::session::{Session, SessionInner, SessionManager};
use crate::transport::{ChannelTarget, SmbTransport};

/// Interface change event delivered by the notifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceUpdate {
    pub client_nics: Vec<NicEntry>,
    /// Client interface indices that went away; applied after the merge.
    pub removed: Vec<u64>,
}

/// What the existing channels already cover.
#[derive(Debug, Clone, Default)]
pub struct ChannelUsage {
    pub usable: usize,
    pub pairs: HashSet<(u64, u64)>,
    pub main_peer: Option<SocketAddr>,
}

impl ChannelUsage {
    /// Reads channel flags; call before taking the interface table lock.
    pub fn of(channels: &[Arc<Channel>]) -> Self {
        let mut usage = ChannelUsage::default();
        for channel in channels {
            if channel.is_usable() {
                usage.usable += 1;
            }
            if channel.is_main() {
                usage.main_peer = Some(channel.peer());
            }
            if channel.is_shutting_down() {
                continue;
            }
            if let (Some(local), Some(remote)) = (channel.local_nic(), channel.remote_nic()) {
                usage.pairs.insert((local, remote));
            }
        }
        usage
    }
}

/// A client/server interface pair worth a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCandidate {
    pub target: ChannelTarget,
    pub speed: u64,
    pub rss: bool,
}

fn client_eligible(nic: &NicEntry, config: &MultichannelConfig) -> bool {
    !nic.is_rss_subchannel()
        && !config.is_client_ignored(nic.index)
        && nic.state == NicState::Up
        && !nic.addrs.is_empty()
}

/// Server primaries whose RSS sub-channel entries may be paired.
fn rss_allowed(table: &InterfaceTable, config: &MultichannelConfig) -> BTreeSet<u64> {
    table
        .server_nics()
        .filter(|nic| nic.is_rss_subchannel())
        .map(|nic| primary_index(nic.index))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(config.max_rss_interfaces as usize)
        .collect()
}

fn server_eligible(nic: &NicEntry, rss_ok: &BTreeSet<u64>, config: &MultichannelConfig) -> bool {
    let primary = primary_index(nic.index);
    if config.is_server_ignored(primary) || nic.state == NicState::Down || nic.addrs.is_empty() {
        return false;
    }
    !nic.is_rss_subchannel() || rss_ok.contains(&primary)
}

/// Pairs eligible interfaces, fastest first, up to the channel budget.
///
/// A pair needs a common address family, must not already carry a channel,
/// and must not point at the main channel's peer address.
pub fn select_channel_pairs(
    table: &InterfaceTable,
    usage: &ChannelUsage,
    config: &MultichannelConfig,
) -> Vec<ChannelCandidate> {
    let budget = (config.max_channels as usize).saturating_sub(usage.usable);
    if budget == 0 {
        return Vec::new();
    }
    let rss_ok = rss_allowed(table, config);

    let mut candidates = Vec::new();
    for client in table.client_nics().filter(|n| client_eligible(n, config)) {
        for server in table
            .server_nics()
            .filter(|n| server_eligible(n, &rss_ok, config))
        {
            if usage.pairs.contains(&(client.index, server.index)) {
                continue;
            }
            let matched = client.addrs.iter().find_map(|local| {
                server
                    .addr_matching(&local.ip())
                    .map(|remote| (local.ip(), remote))
            });
            let Some((local_addr, remote_addr)) = matched else {
                continue;
            };
            if Some(remote_addr) == usage.main_peer {
                continue;
            }
            candidates.push(ChannelCandidate {
                target: ChannelTarget {
                    local_index: client.index,
                    remote_index: server.index,
                    local_addr,
                    remote_addr,
                    rdma: client.has_capability(NIC_CAP_RDMA)
                        && server.has_capability(NIC_CAP_RDMA),
                },
                speed: client.link_speed.min(server.link_speed),
                rss: server.is_rss_subchannel(),
            });
        }
    }

    candidates.sort_by(|a, b| {
        b.speed
            .cmp(&a.speed)
            .then(a.target.local_index.cmp(&b.target.local_index))
            .then(a.target.remote_index.cmp(&b.target.remote_index))
    });
    candidates.truncate(budget);
    candidates
}

/// Outcome of the single-channel liveness echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    NoCandidate,
    Alive(u32),
    Retired(u32),
}

/// Picks the alternate to echo: one flagged inactive if any, otherwise the
/// next alternate after the last one echoed, wrapping to the lowest id.
fn next_echo_target(alternates: &[&Arc<Channel>], last_echoed: Option<u32>) -> Option<u32> {
    if let Some(flagged) = alternates
        .iter()
        .find(|c| c.flags().contains(ChannelFlags::INACTIVE))
    {
        return Some(flagged.id());
    }
    let ids = alternates.iter().map(|c| c.id());
    let after = last_echoed.and_then(|last| ids.clone().filter(|id| *id > last).min());
    after.or_else(|| ids.min())
}

/// Echoes one non-main channel that is not shutting down. Successive calls
/// rotate through the alternates. A failed echo retires the channel.
pub(crate) fn echo_idle_channel(
    session: &Session,
    inner: &mut SessionInner,
    transport: &dyn SmbTransport,
) -> Result<EchoOutcome> {
    let alternates: Vec<&Arc<Channel>> = inner
        .channels
        .iter()
        .filter(|c| !c.is_main() && !c.is_shutting_down())
        .collect();
    let Some(channel_id) = next_echo_target(&alternates, inner.last_echoed) else {
        return Ok(EchoOutcome::NoCandidate);
    };
    inner.last_echoed = Some(channel_id);

    match transport.echo(session.id(), channel_id) {
        Ok(()) => {
            debug!("session {}: channel {} answered echo", session.id(), channel_id);
            if let Some(channel) = inner.channels.iter().find(|c| c.id() == channel_id) {
                channel.clear_flag(ChannelFlags::INACTIVE);
            }
            Ok(EchoOutcome::Alive(channel_id))
        }
        Err(e) => {
            warn!(
                "session {}: channel {} failed echo ({}), retiring",
                session.id(),
                channel_id,
                e.reason
            );
            session.retire_channel(inner, channel_id, transport)?;
            Ok(EchoOutcome::Retired(channel_id))
        }
    }
}

/// Brings up channels for new interface pairs. Failed pairs are skipped;
/// the last failure is returned after all pairs were tried.
pub(crate) fn establish_alternate_channels(
    session: &Session,
    inner: &mut SessionInner,
    transport: &dyn SmbTransport,
    config: &MultichannelConfig,
) -> Result<usize> {
    if !config.enabled || !session.is_multichannel() {
        return Ok(0);
    }
    let main_usable = inner
        .channels
        .iter()
        .find(|c| c.is_main())
        .map(|c| c.is_usable())
        .ok_or(NetsmbError::NotConnected)?;
    if !main_usable {
        debug!("session {}: main channel not running, skipping", session.id());
        return Ok(0);
    }

    let usage = ChannelUsage::of(&inner.channels);
    let candidates = select_channel_pairs(&session.interfaces.lock(), &usage, config);

    let mut established = 0;
    let mut last_err = None;
    for candidate in candidates {
        match connect_candidate(session, &candidate, transport) {
            Ok(channel) => {
                inner.channels.push(channel);
                established += 1;
            }
            Err(e) => {
                warn!(
                    "session {}: channel {} -> {} failed: {}",
                    session.id(),
                    candidate.target.local_index,
                    candidate.target.remote_index,
                    e
                );
                last_err = Some(e);
            }
        }
    }
    if established > 0 {
        info!(
            "session {}: {} alternate channels established",
            session.id(),
            established
        );
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(established),
    }
}

fn connect_candidate(
    session: &Session,
    candidate: &ChannelCandidate,
    transport: &dyn SmbTransport,
) -> Result<Arc<Channel>> {
    let id = session.next_channel_id();
    let established = transport.connect_channel(session.id(), &candidate.target)?;
    let mut flags = ChannelFlags::default();
    if candidate.rss {
        flags.insert(ChannelFlags::RSS);
    }
    if candidate.target.rdma && established.rdma {
        flags.insert(ChannelFlags::RDMA);
    }
    let channel = Arc::new(Channel::new_alternate(
        id,
        established.peer,
        candidate.target.local_index,
        candidate.target.remote_index,
        flags,
    ));
    channel.mark_connected()?;
    Ok(channel)
}

fn update_session(
    session: &Session,
    update: &InterfaceUpdate,
    transport: &dyn SmbTransport,
    config: &MultichannelConfig,
) -> Result<()> {
    let mut inner = session.inner.write();
    {
        let mut table = session.interfaces.lock();
        table.merge_client(update.client_nics.clone())?;
        table.remove_client_nics(&update.removed);
    }
    if config.echo_idle_channels {
        echo_idle_channel(session, &mut inner, transport)?;
    }
    establish_alternate_channels(session, &mut inner, transport, config)?;
    Ok(())
}

impl SessionManager {
    /// Applies an interface change to every live session, one session lock
    /// at a time under the session-list lock. Per-session failures do not
    /// stop the walk; the last one is returned.
    pub fn notify_interfaces_changed(&self, update: &InterfaceUpdate) -> Result<()> {
        let sessions = self.sessions.read();
        let mut last_err = None;
        for session in sessions.iter() {
            if let Err(e) = update_session(session, update, self.transport.as_ref(), &self.config)
            {
                warn!("session {}: interface update failed: {}", session.id(), e);
                last_err = Some(e);
            }
        }
        debug!(
            "interface update applied to {} sessions ({} nics, {} removed)",
            sessions.len(),
            update.client_nics.len(),
            update.removed.len()
        );
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
