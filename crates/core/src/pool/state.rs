use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use stepwise_actor::{Actor, Message};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::Instrument;

use super::{Connection, Fingerprint, Lease, PoolStats, ReleaseHandle};
use crate::error::ConnectError;
use crate::provider::{ProviderTransport, ToolProviderConfig};

type LeaseReply = oneshot::Sender<Result<Lease, ConnectError>>;

struct Waiter {
    order: Vec<String>,
    reply: LeaseReply,
}

struct LiveEntry {
    id: u64,
    connection: Arc<Connection>,
    last_used: Instant,
    in_use: usize,
}

enum Entry {
    Connecting { id: u64, waiters: Vec<Waiter> },
    Live(LiveEntry),
}

/// A connection that left the table while still leased.
struct Retired {
    connection: Arc<Connection>,
    in_use: usize,
}

pub(super) struct PoolState {
    transport: Arc<dyn ProviderTransport>,
    max_idle: Duration,
    entries: HashMap<Fingerprint, Entry>,
    retired: HashMap<u64, Retired>,
    next_entry_id: u64,
    closed: bool,
}

impl PoolState {
    pub fn new(transport: Arc<dyn ProviderTransport>, max_idle: Duration) -> Self {
        Self {
            transport,
            max_idle,
            entries: HashMap::new(),
            retired: HashMap::new(),
            next_entry_id: 1,
            closed: false,
        }
    }

    fn lease(
        entry: &mut LiveEntry,
        order: Vec<String>,
        handle: &Actor<PoolState>,
    ) -> Lease {
        entry.in_use += 1;
        entry.last_used = Instant::now();
        Lease {
            connection: Arc::clone(&entry.connection),
            order,
            release: Some(ReleaseHandle {
                pool: handle.downgrade(),
                entry_id: entry.id,
            }),
        }
    }

    fn retire(&mut self, entry: LiveEntry) -> Option<Arc<Connection>> {
        if entry.in_use == 0 {
            return Some(entry.connection);
        }
        debug!(
            "retiring {} with {} leases",
            entry.connection.fingerprint, entry.in_use
        );
        self.retired.insert(
            entry.id,
            Retired {
                connection: entry.connection,
                in_use: entry.in_use,
            },
        );
        None
    }
}

fn close_later(connection: Arc<Connection>) {
    tokio::spawn(
        async move { connection.close().await }
            .instrument(debug_span!("pool close")),
    );
}

pub(super) struct Acquire {
    pub fingerprint: Fingerprint,
    pub configs: Vec<ToolProviderConfig>,
    pub reply: LeaseReply,
}

impl Message<PoolState> for Acquire {
    fn handle(self, state: &mut PoolState, handle: &Actor<PoolState>) {
        let Acquire {
            fingerprint,
            configs,
            reply,
        } = self;
        if state.closed {
            reply.send(Err(ConnectError::PoolClosed)).ok();
            return;
        }

        let dead = match state.entries.get(&fingerprint) {
            Some(Entry::Live(entry)) => entry.connection.is_dead(),
            _ => false,
        };
        if dead {
            warn!("connection {fingerprint} lost a provider, reconnecting");
            if let Some(Entry::Live(entry)) = state.entries.remove(&fingerprint) {
                if let Some(connection) = state.retire(entry) {
                    close_later(connection);
                }
            }
        }

        let order = configs.iter().map(|c| c.id.clone()).collect();
        match state.entries.get_mut(&fingerprint) {
            Some(Entry::Live(entry)) => {
                trace!("hit {fingerprint}");
                // A lease that cannot be delivered releases itself on drop.
                reply.send(Ok(PoolState::lease(entry, order, handle))).ok();
            }
            Some(Entry::Connecting { waiters, .. }) => {
                trace!("joining pending connect of {fingerprint}");
                waiters.push(Waiter { order, reply });
            }
            None => {
                let id = state.next_entry_id;
                state.next_entry_id += 1;
                debug!("connecting {} providers for {fingerprint}", configs.len());
                state.entries.insert(
                    fingerprint.clone(),
                    Entry::Connecting {
                        id,
                        waiters: vec![Waiter { order, reply }],
                    },
                );

                let transport = Arc::clone(&state.transport);
                let pool = handle.clone();
                tokio::spawn(
                    async move {
                        let result = Connection::establish(
                            &*transport,
                            fingerprint.clone(),
                            &configs,
                        )
                        .await;
                        pool.send(Established {
                            fingerprint,
                            id,
                            result,
                        })
                        .ok();
                    }
                    .instrument(debug_span!("pool connect")),
                );
            }
        }
    }
}

struct Established {
    fingerprint: Fingerprint,
    id: u64,
    result: Result<Connection, ConnectError>,
}

impl Message<PoolState> for Established {
    fn handle(self, state: &mut PoolState, handle: &Actor<PoolState>) {
        let Established {
            fingerprint,
            id,
            result,
        } = self;
        let waiters = match state.entries.remove(&fingerprint) {
            Some(Entry::Connecting { id: pending, waiters }) if pending == id => {
                waiters
            }
            other => {
                // The entry was dropped by a shutdown while connecting.
                if let Some(other) = other {
                    state.entries.insert(fingerprint, other);
                }
                if let Ok(connection) = result {
                    close_later(Arc::new(connection));
                }
                return;
            }
        };

        match result {
            Ok(connection) => {
                let mut entry = LiveEntry {
                    id,
                    connection: Arc::new(connection),
                    last_used: Instant::now(),
                    in_use: 0,
                };
                for Waiter { order, reply } in waiters {
                    reply.send(Ok(PoolState::lease(&mut entry, order, handle))).ok();
                }
                state.entries.insert(fingerprint, Entry::Live(entry));
            }
            Err(err) => {
                for Waiter { reply, .. } in waiters {
                    reply.send(Err(err.clone())).ok();
                }
            }
        }
    }
}

pub(super) struct Release {
    pub fingerprint: Fingerprint,
    pub entry_id: u64,
}

impl Message<PoolState> for Release {
    fn handle(self, state: &mut PoolState, _handle: &Actor<PoolState>) {
        if let Some(Entry::Live(entry)) = state.entries.get_mut(&self.fingerprint) {
            if entry.id == self.entry_id {
                entry.in_use = entry.in_use.saturating_sub(1);
                entry.last_used = Instant::now();
                return;
            }
        }

        let Some(retired) = state.retired.get_mut(&self.entry_id) else {
            warn!("release of unknown entry {}", self.entry_id);
            return;
        };
        retired.in_use = retired.in_use.saturating_sub(1);
        if retired.in_use == 0 {
            if let Some(retired) = state.retired.remove(&self.entry_id) {
                close_later(retired.connection);
            }
        }
    }
}

pub(super) struct EvictIdle {
    pub now: Instant,
    pub reply: oneshot::Sender<Vec<Arc<Connection>>>,
}

impl Message<PoolState> for EvictIdle {
    fn handle(self, state: &mut PoolState, _handle: &Actor<PoolState>) {
        let max_idle = state.max_idle;
        let expired: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, entry)| match entry {
                Entry::Live(entry) => {
                    entry.in_use == 0
                        && (entry.connection.is_dead()
                            || self.now.saturating_duration_since(entry.last_used)
                                > max_idle)
                }
                Entry::Connecting { .. } => false,
            })
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();

        let evicted = expired
            .into_iter()
            .filter_map(|fingerprint| match state.entries.remove(&fingerprint) {
                Some(Entry::Live(entry)) => Some(entry.connection),
                _ => None,
            })
            .collect();
        self.reply.send(evicted).ok();
    }
}

#[derive(Debug)]
pub(super) enum CloseOutcome {
    Closed(Arc<Connection>),
    Retired,
    Missing,
}

pub(super) struct Close {
    pub fingerprint: Fingerprint,
    pub reply: oneshot::Sender<CloseOutcome>,
}

impl Message<PoolState> for Close {
    fn handle(self, state: &mut PoolState, _handle: &Actor<PoolState>) {
        let outcome = match state.entries.remove(&self.fingerprint) {
            Some(Entry::Live(entry)) => match state.retire(entry) {
                Some(connection) => CloseOutcome::Closed(connection),
                None => CloseOutcome::Retired,
            },
            Some(pending @ Entry::Connecting { .. }) => {
                state.entries.insert(self.fingerprint, pending);
                CloseOutcome::Missing
            }
            None => CloseOutcome::Missing,
        };
        self.reply.send(outcome).ok();
    }
}

pub(super) struct CloseAll {
    pub reply: oneshot::Sender<Vec<Arc<Connection>>>,
}

impl Message<PoolState> for CloseAll {
    fn handle(self, state: &mut PoolState, _handle: &Actor<PoolState>) {
        state.closed = true;
        let mut idle = vec![];
        for (_, entry) in mem::take(&mut state.entries) {
            match entry {
                Entry::Live(entry) => idle.extend(state.retire(entry)),
                Entry::Connecting { waiters, .. } => {
                    for Waiter { reply, .. } in waiters {
                        reply.send(Err(ConnectError::PoolClosed)).ok();
                    }
                }
            }
        }
        self.reply.send(idle).ok();
    }
}

pub(super) struct Stats {
    pub reply: oneshot::Sender<PoolStats>,
}

impl Message<PoolState> for Stats {
    fn handle(self, state: &mut PoolState, _handle: &Actor<PoolState>) {
        let mut stats = PoolStats {
            retired: state.retired.len(),
            ..Default::default()
        };
        for entry in state.entries.values() {
            match entry {
                Entry::Live(entry) => {
                    stats.live += 1;
                    stats.in_use += entry.in_use;
                }
                Entry::Connecting { .. } => stats.connecting += 1,
            }
        }
        stats.in_use += state.retired.values().map(|r| r.in_use).sum::<usize>();
        self.reply.send(stats).ok();
    }
}

impl Debug for Acquire {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquire")
            .field("fingerprint", &self.fingerprint)
            .field("providers", &self.configs.len())
            .finish()
    }
}

impl Debug for Established {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("fingerprint", &self.fingerprint)
            .field("id", &self.id)
            .field("ok", &self.result.is_ok())
            .finish()
    }
}

impl Debug for Release {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Release")
            .field("fingerprint", &self.fingerprint)
            .field("entry_id", &self.entry_id)
            .finish()
    }
}

impl Debug for EvictIdle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictIdle").field("now", &self.now).finish()
    }
}

impl Debug for Close {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Close")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Debug for CloseAll {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("CloseAll")
    }
}

impl Debug for Stats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("Stats")
    }
}
