//! Named connections and exclusive leases on their handles.
//!
//! A connection id owns up to `pool_size` adapter handles, opened lazily.
//! [`ConnectionRegistry::lease`] hands out one handle at a time per caller:
//! the semaphore bounds how many leases exist, the per-handle mutex makes
//! each lease exclusive.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{DbType, Endpoint};
use crate::core::traits::DialectAdapter;
use crate::drivers::AdapterImpl;
use crate::error::{MigrateError, Result};

/// Request to open a named connection.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    /// Connection id. Generated when absent.
    pub id: Option<String>,
    pub endpoint: Endpoint,
    /// Maximum handles kept for this connection.
    pub pool_size: usize,
}

impl ConnectionRequest {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            id: None,
            endpoint,
            pool_size: 1,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }
}

/// Lifecycle state of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Open,
    Failed,
    Closed,
}

/// Public view of a registered connection. Never carries credentials.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub db_type: DbType,
    pub status: ConnectionStatus,
    pub description: String,
    /// Handles opened so far.
    pub handles: usize,
    pub pool_size: usize,
}

/// Where additional handles come from.
enum HandleSource {
    /// Connect again with the stored endpoint.
    Endpoint(Endpoint),
    /// Clone a handle onto the same in-process store.
    Template(AdapterImpl),
    /// Only the registered handle exists.
    Fixed,
}

struct Entry {
    db_type: DbType,
    description: String,
    status: ConnectionStatus,
    source: Arc<HandleSource>,
    handles: Vec<Arc<Mutex<AdapterImpl>>>,
    permits: Arc<Semaphore>,
    pool_size: usize,
}

impl Entry {
    fn info(&self, id: &str) -> ConnectionInfo {
        ConnectionInfo {
            id: id.to_string(),
            db_type: self.db_type,
            status: self.status,
            description: self.description.clone(),
            handles: self.handles.len(),
            pool_size: self.pool_size,
        }
    }
}

/// Exclusive use of one adapter handle.
///
/// Dropping the lease returns the handle to its connection.
pub struct Lease {
    connection_id: String,
    guard: OwnedMutexGuard<AdapterImpl>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl Deref for Lease {
    type Target = AdapterImpl;

    fn deref(&self) -> &AdapterImpl {
        &self.guard
    }
}

/// Owner of every open connection in the process.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the endpoint, open and ping the first handle, then register it.
    pub async fn open(&self, request: ConnectionRequest) -> Result<ConnectionInfo> {
        if request.pool_size == 0 {
            return Err(MigrateError::Config("pool_size must be at least 1".into()));
        }
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.entries.read().await.contains_key(&id) {
            return Err(MigrateError::Config(format!(
                "connection id '{}' is already registered",
                id
            )));
        }

        let adapter = AdapterImpl::connect(&request.endpoint).await?;
        let entry = Entry {
            db_type: request.endpoint.r#type,
            description: request.endpoint.describe(),
            status: ConnectionStatus::Open,
            source: Arc::new(HandleSource::Endpoint(request.endpoint)),
            handles: vec![Arc::new(Mutex::new(adapter))],
            permits: Arc::new(Semaphore::new(request.pool_size)),
            pool_size: request.pool_size,
        };
        self.insert(id, entry).await
    }

    /// Register an already-open adapter (in-process stores, tests).
    ///
    /// More than one handle is only possible when the adapter can clone
    /// itself without a new network connection.
    pub async fn register(
        &self,
        id: impl Into<String>,
        adapter: AdapterImpl,
        pool_size: usize,
    ) -> Result<ConnectionInfo> {
        let id = id.into();
        if self.entries.read().await.contains_key(&id) {
            return Err(MigrateError::Config(format!(
                "connection id '{}' is already registered",
                id
            )));
        }
        let (source, pool_size) = match adapter.try_clone_handle() {
            Some(template) => (HandleSource::Template(template), pool_size.max(1)),
            None => (HandleSource::Fixed, 1),
        };
        let entry = Entry {
            db_type: adapter.db_type(),
            description: format!("{} (registered)", adapter.db_type()),
            status: ConnectionStatus::Open,
            source: Arc::new(source),
            handles: vec![Arc::new(Mutex::new(adapter))],
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        };
        self.insert(id, entry).await
    }

    async fn insert(&self, id: String, entry: Entry) -> Result<ConnectionInfo> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(MigrateError::Config(format!(
                "connection id '{}' is already registered",
                id
            )));
        }
        let info = entry.info(&id);
        info!("Registered connection {} ({})", id, info.description);
        entries.insert(id, entry);
        Ok(info)
    }

    /// Take exclusive use of one handle of `id`, opening a new handle when
    /// all existing ones are busy and the pool has room.
    pub async fn lease(&self, id: &str) -> Result<Lease> {
        let (permits, source) = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| MigrateError::NotFound(format!("connection {}", id)))?;
            (Arc::clone(&entry.permits), Arc::clone(&entry.source))
        };

        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| MigrateError::NotFound(format!("connection {} was closed", id)))?;

        let handles = match self.entries.read().await.get(id) {
            Some(entry) => entry.handles.clone(),
            None => return Err(MigrateError::NotFound(format!("connection {} was closed", id))),
        };
        for handle in handles {
            if let Ok(guard) = handle.try_lock_owned() {
                return Ok(Lease {
                    connection_id: id.to_string(),
                    guard,
                    _permit: permit,
                });
            }
        }

        // every handle is leased and we hold a permit, so the pool has room
        let adapter = match source.as_ref() {
            HandleSource::Endpoint(endpoint) => AdapterImpl::connect(endpoint).await?,
            HandleSource::Template(template) => template
                .try_clone_handle()
                .ok_or_else(|| MigrateError::Internal("handle template cannot clone".into()))?,
            HandleSource::Fixed => {
                return Err(MigrateError::Internal(format!(
                    "connection {} has no free handle",
                    id
                )))
            }
        };
        let handle = Arc::new(Mutex::new(adapter));
        let guard = Arc::clone(&handle).lock_owned().await;

        let mut entries = self.entries.write().await;
        match entries.get_mut(id) {
            Some(entry) => {
                entry.handles.push(handle);
                debug!("{}: opened handle {}", id, entry.handles.len());
            }
            None => {
                drop(entries);
                guard.close().await;
                return Err(MigrateError::NotFound(format!("connection {} was closed", id)));
            }
        }

        Ok(Lease {
            connection_id: id.to_string(),
            guard,
            _permit: permit,
        })
    }

    /// Ping through a lease and record the outcome. Returns the round-trip time.
    pub async fn health_check(&self, id: &str) -> Result<Duration> {
        let lease = self.lease(id).await?;
        let started = Instant::now();
        let outcome = lease.ping().await;
        drop(lease);

        let status = if outcome.is_ok() {
            ConnectionStatus::Open
        } else {
            ConnectionStatus::Failed
        };
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.status = status;
        }
        outcome.map(|_| started.elapsed())
    }

    pub async fn info(&self, id: &str) -> Result<ConnectionInfo> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.info(id))
            .ok_or_else(|| MigrateError::NotFound(format!("connection {}", id)))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Every registered connection, ordered by id.
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, e)| e.info(id))
            .collect()
    }

    /// Remove `id` and close its handles once their leases end.
    pub async fn close(&self, id: &str) -> Result<()> {
        let entry = self
            .entries
            .write()
            .await
            .remove(id)
            .ok_or_else(|| MigrateError::NotFound(format!("connection {}", id)))?;
        entry.permits.close();
        for handle in entry.handles {
            handle.lock().await.close().await;
        }
        info!("Closed connection {}", id);
        Ok(())
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                warn!("Closing {}: {}", id, e);
            }
        }
    }
}
