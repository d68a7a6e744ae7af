//! Shared scheduler state.
//!
//! One [`SchedulerContext`] is built at startup and handed to the
//! connection manager and the admin router. It owns the task store, the
//! framework identity, the scale target and the outbound call queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use halyard_proto::{FrameworkId, FrameworkInfo};
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::{ConnectionState, Outbox};
use crate::state::{KvStore, StoreError, TaskStore};
use crate::task::{ConfigSnapshot, FrameworkIdentity, ScaleTarget};

/// Proof that the caller holds the reconcile lock.
pub type ReconcileGuard<'a> = MutexGuard<'a, ()>;

/// Shared scheduler context.
#[derive(Clone)]
pub struct SchedulerContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: Config,
    store: TaskStore,
    identity: RwLock<FrameworkIdentity>,
    snapshot: RwLock<ConfigSnapshot>,
    outbox: Outbox,
    state: watch::Sender<ConnectionState>,
    /// Serializes read-modify-write sequences on the task store.
    reconcile: Mutex<()>,
    session_active: AtomicBool,
}

impl SchedulerContext {
    /// Load persisted identity and scale, falling back to `config`, and
    /// write both back so the store reflects what this process runs with.
    pub async fn restore(config: Config, kv: Arc<dyn KvStore>) -> Result<Self, StoreError> {
        let store = TaskStore::new(kv, config.framework_name.clone(), config.request_timeout);

        let mut identity = store.load_identity().await?.unwrap_or_default();
        identity.stream_id = None;

        let mut scale = config.initial_scale;
        let mut revision = 0;
        if let Some(previous) = store.load_snapshot().await? {
            revision = previous.revision;
            scale.servers = previous.scale.servers;
            scale.agents = previous.scale.agents;
            if scale.agents > scale.agent_max {
                warn!(
                    persisted = scale.agents,
                    max = scale.agent_max,
                    "Persisted agent count exceeds configured maximum; clamping"
                );
                scale.agents = scale.agent_max;
            }
        }

        let snapshot = ConfigSnapshot {
            revision,
            scale,
            framework_name: config.framework_name.clone(),
            port_from: config.port_range.from(),
            port_to: config.port_range.to(),
            updated_at: Utc::now(),
        };

        info!(
            framework_id = ?identity.framework_id,
            servers = scale.servers,
            agents = scale.agents,
            revision,
            "Restored scheduler state"
        );

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let ctx = Self {
            inner: Arc::new(ContextInner {
                config,
                store,
                identity: RwLock::new(identity),
                snapshot: RwLock::new(snapshot),
                outbox: Outbox::new(),
                state,
                reconcile: Mutex::new(()),
                session_active: AtomicBool::new(false),
            }),
        };

        ctx.persist_snapshot().await?;
        let identity = ctx.identity().await;
        if identity.framework_id.is_some() {
            ctx.store().save_identity(&identity).await?;
        }
        Ok(ctx)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    pub async fn identity(&self) -> FrameworkIdentity {
        self.inner.identity.read().await.clone()
    }

    pub async fn framework_id(&self) -> Option<FrameworkId> {
        self.inner.identity.read().await.framework_id.clone()
    }

    /// Record the identity granted by a SUBSCRIBED event and persist it.
    pub async fn adopt_identity(
        &self,
        framework_id: FrameworkId,
        stream_id: String,
    ) -> Result<(), StoreError> {
        let mut identity = self.inner.identity.write().await;
        if let Some(previous) = &identity.framework_id {
            if *previous != framework_id {
                warn!(
                    previous = %previous,
                    granted = %framework_id,
                    "Resource manager issued a different framework id"
                );
            }
        }
        identity.framework_id = Some(framework_id);
        identity.stream_id = Some(stream_id);
        self.inner.store.save_identity(&identity).await
    }

    /// Forget the stream token of an ended session. The framework id stays.
    pub async fn clear_stream(&self) {
        self.inner.identity.write().await.stream_id = None;
    }

    /// Registration metadata carrying the current framework id, if any.
    pub async fn framework_info(&self) -> FrameworkInfo {
        let mut info = self.inner.config.framework_info();
        info.id = self.framework_id().await;
        info
    }

    pub async fn scale(&self) -> ScaleTarget {
        self.inner.snapshot.read().await.scale
    }

    pub async fn snapshot(&self) -> ConfigSnapshot {
        self.inner.snapshot.read().await.clone()
    }

    /// Persist a new scale target. Memory changes only once the write
    /// succeeded.
    pub async fn update_scale(&self, scale: ScaleTarget) -> Result<ConfigSnapshot, StoreError> {
        let mut current = self.inner.snapshot.write().await;
        let next = ConfigSnapshot {
            revision: current.revision + 1,
            scale,
            updated_at: Utc::now(),
            ..current.clone()
        };
        self.inner.store.save_snapshot(&next).await?;
        *current = next.clone();
        Ok(next)
    }

    /// Write the configuration snapshot under a new revision.
    pub async fn persist_snapshot(&self) -> Result<u64, StoreError> {
        let mut current = self.inner.snapshot.write().await;
        let next = ConfigSnapshot {
            revision: current.revision + 1,
            updated_at: Utc::now(),
            ..current.clone()
        };
        self.inner.store.save_snapshot(&next).await?;
        *current = next;
        Ok(current.revision)
    }

    pub async fn lock_reconcile(&self) -> ReconcileGuard<'_> {
        self.inner.reconcile.lock().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Claim the single session slot. `None` if a session is already live.
    pub fn try_begin_session(&self) -> Option<SessionSlot> {
        self.inner
            .session_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionSlot { ctx: self.clone() })
    }
}

/// Held for the lifetime of a session; releases the slot on drop.
pub struct SessionSlot {
    ctx: SchedulerContext,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.ctx
            .inner
            .session_active
            .store(false, Ordering::Release);
    }
}
