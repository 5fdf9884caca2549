//! Reusable provider connections keyed by the fingerprint of the provider
//! set.
//!
//! The fingerprint table lives inside a single actor, so inserting on a
//! miss is serialized and two calls asking for the same fresh set share one
//! establishment. Callers hold a [`Lease`] while they use a connection; the
//! idle sweep never touches an entry with outstanding leases.

mod fingerprint;
mod state;

use std::collections::HashSet;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use stepwise_actor::{Actor, WeakActor};
use tokio::time::{Instant, interval};
use tracing::Instrument;

use crate::error::ConnectError;
use crate::provider::{
    ProviderSession, ProviderTransport, ToolDescriptor, ToolProviderConfig,
    TransportError,
};
pub use fingerprint::Fingerprint;
use state::{
    Acquire, Close, CloseAll, CloseOutcome, EvictIdle, PoolState, Release,
    Stats,
};

/// Tuning of a [`ConnectionPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// How long an unused entry is kept alive.
    pub max_idle: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Sets the idle time after which entries are evicted.
    #[inline]
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Sets the period of the background sweep.
    #[inline]
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

/// A snapshot of the pool table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live entries.
    pub live: usize,
    /// Entries still being established.
    pub connecting: usize,
    /// Outstanding leases over all live and retired entries.
    pub in_use: usize,
    /// Connections removed from the table that still have leases.
    pub retired: usize,
}

/// One connected provider inside a [`Connection`].
pub struct LiveProvider {
    config: ToolProviderConfig,
    session: Box<dyn ProviderSession>,
    tools: Vec<ToolDescriptor>,
}

impl LiveProvider {
    /// The configuration the provider was launched with.
    #[inline]
    pub fn config(&self) -> &ToolProviderConfig {
        &self.config
    }

    /// The tools the provider listed at connect time.
    #[inline]
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Whether the provider listed a tool with this name.
    #[inline]
    pub fn serves(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t.name == tool)
    }

    /// The live session.
    #[inline]
    pub fn session(&self) -> &dyn ProviderSession {
        &*self.session
    }
}

async fn connect_one(
    transport: &dyn ProviderTransport,
    config: &ToolProviderConfig,
) -> Result<LiveProvider, TransportError> {
    let session = transport.connect(config).await?;
    let tools = match session.list_tools().await {
        Ok(tools) => tools,
        Err(err) => {
            session.close().await;
            return Err(err);
        }
    };
    debug!("provider {} serves {} tools", config.id, tools.len());
    Ok(LiveProvider {
        config: config.clone(),
        session,
        tools,
    })
}

/// Live sessions to every provider of one set.
pub struct Connection {
    fingerprint: Fingerprint,
    providers: Vec<LiveProvider>,
}

impl Connection {
    fn empty() -> Self {
        Self {
            fingerprint: Fingerprint::of(&[]),
            providers: vec![],
        }
    }

    /// Connects every provider in order. Any failure closes the sessions
    /// opened so far and fails the whole set.
    async fn establish(
        transport: &dyn ProviderTransport,
        fingerprint: Fingerprint,
        configs: &[ToolProviderConfig],
    ) -> Result<Self, ConnectError> {
        let mut providers = Vec::with_capacity(configs.len());
        for config in configs {
            match connect_one(transport, config).await {
                Ok(provider) => providers.push(provider),
                Err(err) => {
                    warn!("failed to connect provider {}: {err}", config.id);
                    for provider in &providers {
                        provider.session.close().await;
                    }
                    return Err(ConnectError::Provider {
                        provider: config.name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(Self {
            fingerprint,
            providers,
        })
    }

    /// The key of this connection in the pool.
    #[inline]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn provider(&self, id: &str) -> Option<&LiveProvider> {
        self.providers.iter().find(|p| p.config.id == id)
    }

    /// Whether any provider session went away.
    fn is_dead(&self) -> bool {
        self.providers.iter().any(|p| p.session.is_closed())
    }

    async fn close(&self) {
        for provider in &self.providers {
            provider.session.close().await;
        }
        debug!("closed connection {}", self.fingerprint);
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let ids: Vec<_> =
            self.providers.iter().map(|p| p.config.id.as_str()).collect();
        f.debug_struct("Connection")
            .field("fingerprint", &self.fingerprint)
            .field("providers", &ids)
            .finish()
    }
}

struct ReleaseHandle {
    pool: WeakActor<PoolState>,
    entry_id: u64,
}

/// A claim on a pooled connection.
///
/// While a lease exists its connection is never evicted. Dropping the lease
/// releases it.
pub struct Lease {
    connection: Arc<Connection>,
    order: Vec<String>,
    release: Option<ReleaseHandle>,
}

impl Lease {
    fn empty() -> Self {
        Self {
            connection: Arc::new(Connection::empty()),
            order: vec![],
            release: None,
        }
    }

    /// The fingerprint of the leased connection.
    #[inline]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.connection.fingerprint
    }

    /// Providers in the order the caller listed them.
    pub fn providers(&self) -> impl Iterator<Item = &LiveProvider> {
        self.order
            .iter()
            .filter_map(|id| self.connection.provider(id))
    }

    /// Finds a provider by id or display name.
    pub fn provider(&self, key: &str) -> Option<&LiveProvider> {
        self.providers().find(|p| p.config.matches(key))
    }

    /// The merged catalog: tools of every provider in caller order, the
    /// first provider listing a name wins.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        merge_catalog(self.providers())
    }

    /// Whether both leases hold the very same connection.
    #[inline]
    pub fn same_connection(&self, other: &Lease) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection)
    }

    /// Releases the lease now.
    #[inline]
    pub fn release(self) {}
}

pub(crate) fn merge_catalog<'a>(
    providers: impl IntoIterator<Item = &'a LiveProvider>,
) -> Vec<ToolDescriptor> {
    let mut seen = HashSet::new();
    let mut catalog = vec![];
    for provider in providers {
        for tool in &provider.tools {
            if seen.insert(tool.name.as_str()) {
                catalog.push(tool.clone());
            } else {
                trace!(
                    "tool {} of {} shadowed by an earlier provider",
                    tool.name, provider.config.id
                );
            }
        }
    }
    catalog
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(handle) = self.release.take() else {
            return;
        };
        if let Some(pool) = handle.pool.upgrade() {
            pool.send(Release {
                fingerprint: self.connection.fingerprint.clone(),
                entry_id: handle.entry_id,
            })
            .ok();
        }
    }
}

impl Debug for Lease {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("fingerprint", &self.connection.fingerprint)
            .field("order", &self.order)
            .field("pooled", &self.release.is_some())
            .finish()
    }
}

/// A pool of provider connections.
///
/// Cloning the pool is cheap, clones share the same table.
#[derive(Clone)]
pub struct ConnectionPool {
    actor: Actor<PoolState>,
}

impl ConnectionPool {
    /// Creates a pool and starts its idle sweep.
    ///
    /// Must be called within a tokio runtime.
    pub fn new<T: ProviderTransport>(transport: T, config: PoolConfig) -> Self {
        Self::with_shared_transport(Arc::new(transport), config)
    }

    /// Same as [`ConnectionPool::new`] for an already shared transport.
    pub fn with_shared_transport(
        transport: Arc<dyn ProviderTransport>,
        config: PoolConfig,
    ) -> Self {
        let actor = Actor::spawn(
            PoolState::new(transport, config.max_idle),
            Some("connection pool"),
        );
        tokio::spawn(
            sweep(actor.downgrade(), config.sweep_interval)
                .instrument(debug_span!("pool sweep")),
        );
        Self { actor }
    }

    /// Leases the connection of a provider set, establishing it on a miss.
    ///
    /// Duplicate ids keep their first occurrence. If any provider fails to
    /// connect the whole acquire fails and nothing is cached.
    pub async fn acquire(
        &self,
        configs: &[ToolProviderConfig],
    ) -> Result<Lease, ConnectError> {
        let mut seen = HashSet::new();
        let configs: Vec<_> = configs
            .iter()
            .filter(|config| seen.insert(config.id.as_str()))
            .cloned()
            .collect();
        if configs.is_empty() {
            return Ok(Lease::empty());
        }

        let fingerprint = Fingerprint::of(&configs);
        trace!("acquiring {fingerprint}");
        self.actor
            .ask(|reply| Acquire {
                fingerprint,
                configs,
                reply,
            })
            .await
            .map_err(|_| ConnectError::PoolClosed)?
    }

    /// Closes and removes every unleased entry whose last use is older than
    /// the configured idle time at `now`, as well as unleased entries whose
    /// provider sessions died. Returns how many were evicted.
    pub async fn evict_idle(&self, now: Instant) -> usize {
        evict_idle(&self.actor, now).await
    }

    /// Tears down the connection of one fingerprint.
    ///
    /// If leases are outstanding the entry leaves the table at once and is
    /// closed when the last lease is released. Returns `false` when there
    /// was no live entry, so closing twice is harmless.
    pub async fn close(&self, fingerprint: &Fingerprint) -> bool {
        let outcome = self
            .actor
            .ask(|reply| Close {
                fingerprint: fingerprint.clone(),
                reply,
            })
            .await
            .unwrap_or(CloseOutcome::Missing);
        match outcome {
            CloseOutcome::Closed(connection) => {
                connection.close().await;
                true
            }
            CloseOutcome::Retired => true,
            CloseOutcome::Missing => false,
        }
    }

    /// Closes every idle connection and refuses further acquires.
    /// Leased connections close when released.
    pub async fn shutdown(&self) {
        let connections =
            self.actor.ask(|reply| CloseAll { reply }).await.unwrap_or_default();
        info!("pool shutting down, closing {} connections", connections.len());
        for connection in connections {
            connection.close().await;
        }
    }

    /// Returns a snapshot of the table.
    pub async fn stats(&self) -> PoolStats {
        self.actor.ask(|reply| Stats { reply }).await.unwrap_or_default()
    }
}

impl Debug for ConnectionPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}

async fn evict_idle(actor: &Actor<PoolState>, now: Instant) -> usize {
    let evicted = actor
        .ask(|reply| EvictIdle { now, reply })
        .await
        .unwrap_or_default();
    for connection in &evicted {
        connection.close().await;
    }
    evicted.len()
}

async fn sweep(pool: WeakActor<PoolState>, period: Duration) {
    let mut ticker = interval(period);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(actor) = pool.upgrade() else {
            break;
        };
        let evicted = evict_idle(&actor, Instant::now()).await;
        if evicted > 0 {
            debug!("evicted {evicted} idle connections");
        }
    }
    trace!("pool dropped, sweep stopped");
}
