//! Multi-server job pool.
//!
//! A [`Pool`] owns one [`Client`] per job server and spreads submissions
//! across them with a pluggable [`SelectionStrategy`]. Failures stay
//! per-server: a broken connection surfaces only on calls routed to it, and
//! [`Pool::close`] reports every server's outcome separately.

pub mod select;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::client::{Client, ErrorHandler, JobHandle, ResponseHandler, Status};
use crate::config::{ClientConfig, PoolConfig};
use crate::error::{GearError, Result};
use crate::protocol::JobPriority;

pub use select::{strategy_for, Candidate, SelectionStrategy, UniformSelect, WeightedSelect};

/// One server in the pool.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub addr: String,
    pub weight: u32,
    pub client: Arc<Client>,
}

pub struct Pool {
    entries: RwLock<HashMap<String, PoolEntry>>,
    /// Address chosen by the previous selection
    last: Mutex<Option<String>>,
    strategy: Box<dyn SelectionStrategy>,
    config: ClientConfig,
    error_handler: RwLock<Option<ErrorHandler>>,
}

impl Pool {
    /// Empty pool with weighted selection and default client settings.
    pub fn new() -> Self {
        Self::with_strategy(ClientConfig::default(), Box::new(WeightedSelect))
    }

    pub fn with_strategy(config: ClientConfig, strategy: Box<dyn SelectionStrategy>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            last: Mutex::new(None),
            strategy,
            config,
            error_handler: RwLock::new(None),
        }
    }

    /// Build a pool and connect to every configured server.
    ///
    /// Servers that cannot be reached are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `EmptyPool` if no server could be connected.
    pub async fn connect(config: PoolConfig) -> Result<Self> {
        let pool = Self::with_strategy(config.client.clone(), strategy_for(config.selection));

        for server in &config.servers {
            if let Err(e) = pool.add(&server.addr, server.weight).await {
                tracing::warn!(addr = %server.addr, error = %e, "Failed to connect to job server");
            }
        }

        if pool.is_empty().await {
            return Err(GearError::EmptyPool);
        }
        Ok(pool)
    }

    /// Add a server, or update its weight if it is already present.
    pub async fn add(&self, addr: &str, weight: u32) -> Result<()> {
        if self.update_weight(addr, weight).await {
            return Ok(());
        }

        // Connect without holding the map lock
        let client = Client::connect(addr, self.config.clone()).await?;
        self.insert(client, weight).await;
        Ok(())
    }

    /// Add an already-connected client under its own address.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if the address is already in the pool.
    pub async fn add_client(&self, client: Client, weight: u32) -> Result<()> {
        if self.entries.read().await.contains_key(client.addr()) {
            return Err(GearError::DuplicateKey(client.addr().to_string()));
        }
        self.insert(client, weight).await;
        Ok(())
    }

    async fn update_weight(&self, addr: &str, weight: u32) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(addr) {
            Some(entry) => {
                if entry.weight != weight {
                    tracing::info!(addr, old = entry.weight, new = weight, "Updated server weight");
                }
                entry.weight = weight;
                true
            }
            None => false,
        }
    }

    async fn insert(&self, client: Client, weight: u32) {
        if let Some(handler) = self.error_handler.read().await.clone() {
            client.set_error_handler(handler).await;
        }

        let addr = client.addr().to_string();
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&addr) {
            // Lost a race with a concurrent add of the same address
            entry.weight = weight;
            drop(entries);
            if let Err(e) = client.close().await {
                tracing::warn!(addr = %addr, error = %e, "Failed to close duplicate job server connection");
            }
            return;
        }

        entries.insert(
            addr.clone(),
            PoolEntry {
                addr: addr.clone(),
                weight,
                client: Arc::new(client),
            },
        );
        tracing::info!(addr = %addr, weight, servers = entries.len(), "Added job server");
    }

    /// Remove a server and hand back its client.
    ///
    /// The client is not closed; jobs still running on it keep delivering
    /// events until the caller closes it.
    pub async fn remove(&self, addr: &str) -> Option<Arc<Client>> {
        let removed = self.entries.write().await.remove(addr)?;

        let mut last = self.last.lock().await;
        if last.as_deref() == Some(addr) {
            *last = None;
        }

        tracing::info!(addr, "Removed job server");
        Some(removed.client)
    }

    /// Choose the server for the next call.
    pub async fn select_server(&self) -> Result<String> {
        self.pick().await.map(|(addr, _)| addr)
    }

    async fn pick(&self) -> Result<(String, Arc<Client>)> {
        let entries = self.entries.read().await;
        if entries.is_empty() {
            return Err(GearError::EmptyPool);
        }

        let candidates: Vec<Candidate> = entries
            .values()
            .map(|entry| Candidate {
                addr: entry.addr.clone(),
                weight: entry.weight,
            })
            .collect();

        let mut last = self.last.lock().await;
        let addr = self
            .strategy
            .select(&candidates, last.as_deref())
            .ok_or(GearError::EmptyPool)?;
        let client = entries
            .get(&addr)
            .map(|entry| entry.client.clone())
            .ok_or_else(|| GearError::ServerNotFound(addr.clone()))?;

        *last = Some(addr.clone());
        tracing::trace!(addr = %addr, "Selected job server");
        Ok((addr, client))
    }

    async fn client(&self, addr: &str) -> Result<Arc<Client>> {
        self.entries
            .read()
            .await
            .get(addr)
            .map(|entry| entry.client.clone())
            .ok_or_else(|| GearError::ServerNotFound(addr.to_string()))
    }

    /// Submit a foreground job to a selected server.
    ///
    /// Returns the server address with the handle; handles are only unique
    /// per server.
    pub async fn submit(
        &self,
        deadline: Duration,
        function: &str,
        data: &[u8],
        priority: JobPriority,
        handler: Option<ResponseHandler>,
    ) -> Result<(String, JobHandle)> {
        let (addr, client) = self.pick().await?;
        let handle = client
            .submit(deadline, function, data, priority, handler)
            .await
            .inspect_err(|e| tracing::warn!(addr = %addr, function, error = %e, "Submit failed"))?;
        Ok((addr, handle))
    }

    pub async fn submit_background(
        &self,
        deadline: Duration,
        function: &str,
        data: &[u8],
        priority: JobPriority,
    ) -> Result<(String, JobHandle)> {
        let (addr, client) = self.pick().await?;
        let handle = client
            .submit_background(deadline, function, data, priority)
            .await
            .inspect_err(|e| tracing::warn!(addr = %addr, function, error = %e, "Submit failed"))?;
        Ok((addr, handle))
    }

    pub async fn submit_cron(
        &self,
        deadline: Duration,
        function: &str,
        cron_spec: &str,
        data: &[u8],
    ) -> Result<(String, JobHandle)> {
        let (addr, client) = self.pick().await?;
        let handle = client.submit_cron(deadline, function, cron_spec, data).await?;
        Ok((addr, handle))
    }

    pub async fn submit_at(
        &self,
        deadline: Duration,
        function: &str,
        unix_epoch: i64,
        data: &[u8],
    ) -> Result<(String, JobHandle)> {
        let (addr, client) = self.pick().await?;
        let handle = client.submit_at(deadline, function, unix_epoch, data).await?;
        Ok((addr, handle))
    }

    /// Echo through a selected server, returning which one answered.
    pub async fn echo(&self, data: &[u8]) -> Result<(String, Vec<u8>)> {
        let (addr, client) = self.pick().await?;
        let reply = client.echo(data).await?;
        Ok((addr, reply))
    }

    /// Echo through a named server. An empty address selects one.
    pub async fn echo_at(&self, addr: &str, data: &[u8]) -> Result<Vec<u8>> {
        if addr.is_empty() {
            return self.echo(data).await.map(|(_, reply)| reply);
        }
        self.client(addr).await?.echo(data).await
    }

    /// Query a job on the server that issued its handle.
    pub async fn status(&self, addr: &str, handle: &JobHandle) -> Result<Status> {
        self.client(addr).await?.status(handle).await
    }

    /// Close every client concurrently, collecting each outcome by address.
    ///
    /// Entries stay in the pool; calls routed to them fail with
    /// `ConnectionClosed`.
    pub async fn close(&self) -> HashMap<String, Result<()>> {
        let clients: Vec<(String, Arc<Client>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(addr, entry)| (addr.clone(), entry.client.clone()))
            .collect();

        // One stalled server must not hold up the others
        let tasks: Vec<_> = clients
            .into_iter()
            .map(|(addr, client)| (addr, tokio::spawn(async move { client.close().await })))
            .collect();

        let mut results = HashMap::with_capacity(tasks.len());
        for (addr, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(GearError::ConnectionLost(format!("close task failed: {}", e))),
            };
            if let Err(e) = &result {
                tracing::warn!(addr = %addr, error = %e, "Failed to close job server connection");
            }
            results.insert(addr, result);
        }
        results
    }

    /// Install an error observer on every current and future client.
    pub async fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.write().await = Some(handler.clone());

        let clients: Vec<Arc<Client>> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.client.clone())
            .collect();
        for client in clients {
            client.set_error_handler(handler.clone()).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Server addresses, sorted.
    pub async fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.entries.read().await.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub async fn weight(&self, addr: &str) -> Option<u32> {
        self.entries.read().await.get(addr).map(|entry| entry.weight)
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("config", &self.config).finish_non_exhaustive()
    }
}
