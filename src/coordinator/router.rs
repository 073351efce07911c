use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::actor::{Coordinator, CoordinatorHandle};
use super::registry::ConnectionSender;
use super::{ConnectReport, CoordinatorError, CoordinatorSettings, CoordinatorStats};
use crate::models::{ConnectionId, Identity, WorkspaceId};
use crate::store::{Bookmark, StorageBackend, StoreError};

/// A connect that lost its coordinator to a concurrent eviction is retried
/// against a fresh one at most this many times.
const CONNECT_ATTEMPTS: usize = 3;

/// Resolves a workspace to its single live coordinator, spawning it on first
/// use. The map lock is only held for lookups and swaps, never while waiting
/// on a coordinator, so a slow workspace cannot hold up any other.
pub struct WorkspaceRouter {
    backend: Arc<dyn StorageBackend>,
    settings: CoordinatorSettings,
    coordinators: Mutex<HashMap<WorkspaceId, CoordinatorHandle>>,
    evictions: mpsc::UnboundedSender<(WorkspaceId, Uuid)>,
    next_connection: AtomicU64,
}

impl WorkspaceRouter {
    pub fn new(backend: Arc<dyn StorageBackend>, settings: CoordinatorSettings) -> Arc<Self> {
        let (evictions, evictions_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            backend,
            settings,
            coordinators: Mutex::new(HashMap::new()),
            evictions,
            next_connection: AtomicU64::new(1),
        });
        tokio::spawn(Self::run_evictions(Arc::downgrade(&router), evictions_rx));
        info!("Workspace router ready ({} storage)", router.backend.name());
        router
    }

    async fn run_evictions(router: Weak<Self>, mut rx: mpsc::UnboundedReceiver<(WorkspaceId, Uuid)>) {
        while let Some((workspace, incarnation)) = rx.recv().await {
            let Some(router) = router.upgrade() else { break };
            // each eviction waits on one coordinator only
            tokio::spawn(async move {
                router.evict(&workspace, Some(incarnation)).await;
            });
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    fn spawn_coordinator(&self, workspace: &WorkspaceId) -> CoordinatorHandle {
        debug!("Spawning coordinator for workspace {}", workspace);
        Coordinator::new(workspace.clone(), self.backend.open(workspace), self.settings.clone())
            .with_evictions(self.evictions.clone())
            .spawn()
    }

    /// The current coordinator of a workspace, replacing it when it has
    /// stopped or is the `stopped` incarnation a previous attempt ran into.
    async fn resolve(&self, workspace: &WorkspaceId, stopped: Option<Uuid>) -> CoordinatorHandle {
        let mut coordinators = self.coordinators.lock().await;
        match coordinators.get(workspace) {
            Some(handle) if !handle.is_closed() && Some(handle.incarnation()) != stopped => handle.clone(),
            _ => {
                let handle = self.spawn_coordinator(workspace);
                coordinators.insert(workspace.clone(), handle.clone());
                handle
            }
        }
    }

    /// Register a connection with the workspace's coordinator, creating the
    /// coordinator if needed. Returns the handle the connection must use for
    /// everything afterwards.
    ///
    /// A coordinator only stops after agreeing to hibernate with no live
    /// connection, and drops whatever is still queued. A connect that finds
    /// its coordinator gone was therefore never applied and is safe to retry.
    pub async fn connect(
        &self,
        workspace: &WorkspaceId,
        id: ConnectionId,
        identity: Identity,
        outbox: ConnectionSender,
        resume: Option<Bookmark>,
    ) -> Result<(CoordinatorHandle, ConnectReport), CoordinatorError> {
        let mut stopped = None;
        for _ in 0..CONNECT_ATTEMPTS {
            let handle = self.resolve(workspace, stopped).await;
            let pending = match handle
                .enqueue_connect(id, identity.clone(), outbox.clone(), resume)
                .await
            {
                Ok(pending) => pending,
                Err(CoordinatorError::Unavailable(_)) => {
                    stopped = Some(handle.incarnation());
                    continue;
                }
                Err(e) => return Err(e),
            };

            match pending.await {
                Ok(result) => return result.map(|report| (handle, report)),
                Err(_) => {
                    debug!("Coordinator of workspace {} stopped before connect {}", workspace, id);
                    stopped = Some(handle.incarnation());
                }
            }
        }
        warn!("Giving up connect {} to workspace {} after {} attempts", id, workspace, CONNECT_ATTEMPTS);
        Err(CoordinatorError::Unavailable(workspace.clone()))
    }

    /// The live coordinator of a workspace, without creating one.
    pub async fn get(&self, workspace: &WorkspaceId) -> Option<CoordinatorHandle> {
        let coordinators = self.coordinators.lock().await;
        coordinators.get(workspace).filter(|h| !h.is_closed()).cloned()
    }

    /// Stop and forget the workspace's coordinator if it has no connections.
    pub async fn evict_if_idle(&self, workspace: &WorkspaceId) -> bool {
        self.evict(workspace, None).await
    }

    /// Asks the coordinator to hibernate without holding the map lock, then
    /// forgets it only if the map still points at that same incarnation.
    async fn evict(&self, workspace: &WorkspaceId, only: Option<Uuid>) -> bool {
        let handle = {
            let coordinators = self.coordinators.lock().await;
            match coordinators.get(workspace) {
                Some(handle) if only.map_or(true, |inc| inc == handle.incarnation()) => handle.clone(),
                _ => return false,
            }
        };

        match handle.hibernate().await {
            Ok(true) | Err(CoordinatorError::Unavailable(_)) => {
                let mut coordinators = self.coordinators.lock().await;
                if coordinators.get(workspace).map(|h| h.incarnation()) == Some(handle.incarnation()) {
                    coordinators.remove(workspace);
                }
                info!("Evicted idle coordinator for workspace {}", workspace);
                true
            }
            Ok(false) => {
                debug!("Workspace {} is busy again, keeping its coordinator", workspace);
                false
            }
            Err(e) => {
                warn!("Failed to evict workspace {}: {}", workspace, e);
                false
            }
        }
    }

    /// Round-trip to the storage backend without touching any workspace.
    pub async fn check_storage(&self) -> Result<(), StoreError> {
        self.backend.open(&WorkspaceId::new("_readiness")).bookmark().await.map(|_| ())
    }

    pub async fn stats(&self) -> Vec<CoordinatorStats> {
        let handles: Vec<CoordinatorHandle> = {
            let coordinators = self.coordinators.lock().await;
            coordinators.values().cloned().collect()
        };

        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.stats().await {
                Ok(s) => stats.push(s),
                Err(e) => debug!("Skipping stats of {}: {}", handle.workspace(), e),
            }
        }
        stats
    }
}
