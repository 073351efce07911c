use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broadcast::{self, FanoutReport};
use super::presence::{PresenceLedger, Transition};
use super::registry::{ConnectionRecord, ConnectionRegistry, ConnectionSender};
use super::{ConnectReport, CoordinatorError, CoordinatorSettings, CoordinatorStats, DisconnectReport};
use crate::models::{
    BroadcastMessage, ConnectionId, Identity, PresenceEntry, ReplayMessage, SendMessage, WelcomeMessage, WorkspaceId,
};
use crate::store::{keys, Bookmark, DurableStore, StoreError};

pub(crate) enum Command {
    Connect {
        id: ConnectionId,
        identity: Identity,
        outbox: ConnectionSender,
        resume: Option<Bookmark>,
        reply: oneshot::Sender<Result<ConnectReport, CoordinatorError>>,
    },
    Disconnect {
        id: ConnectionId,
        reply: Option<oneshot::Sender<DisconnectReport>>,
    },
    Relay {
        from: ConnectionId,
        payload: Value,
        reply: oneshot::Sender<Result<FanoutReport, CoordinatorError>>,
    },
    Broadcast {
        message: BroadcastMessage,
        exclude: Vec<ConnectionId>,
        reply: oneshot::Sender<FanoutReport>,
    },
    ListPresence {
        reply: oneshot::Sender<Vec<PresenceEntry>>,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
    SetAlarm {
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    /// Stop if no connection is live; replies whether it stopped.
    Hibernate {
        reply: oneshot::Sender<bool>,
    },
}

fn serialize_direct(message: &SendMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("Failed to serialize direct message: {}", e);
            None
        }
    }
}

fn deadline_for(at: DateTime<Utc>) -> Instant {
    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + wait
}

/// State of one workspace. All mutation goes through `&mut self`, and once
/// spawned the only `&mut` access is the command loop.
pub struct Coordinator {
    workspace: WorkspaceId,
    incarnation: Uuid,
    store: Arc<dyn DurableStore>,
    settings: CoordinatorSettings,
    registry: ConnectionRegistry,
    ledger: PresenceLedger,
    alarm: Option<DateTime<Utc>>,
    evictions: Option<mpsc::UnboundedSender<(WorkspaceId, Uuid)>>,
}

impl Coordinator {
    pub fn new(workspace: WorkspaceId, store: Arc<dyn DurableStore>, settings: CoordinatorSettings) -> Self {
        Self {
            workspace,
            incarnation: Uuid::new_v4(),
            store,
            settings,
            registry: ConnectionRegistry::new(),
            ledger: PresenceLedger::new(),
            alarm: None,
            evictions: None,
        }
    }

    /// Where to report that this coordinator went idle.
    pub fn with_evictions(mut self, evictions: mpsc::UnboundedSender<(WorkspaceId, Uuid)>) -> Self {
        self.evictions = Some(evictions);
        self
    }

    /// Cold start. Mirrored presence from a previous incarnation cannot be
    /// backed by live connections and is dropped; a pending alarm is re-armed.
    /// Returns the number of stale presence entries discarded.
    pub async fn start(&mut self) -> Result<usize, StoreError> {
        let stale = self.store.list(keys::PRESENCE_PREFIX).await?;
        if !stale.is_empty() {
            let mut txn = self.store.begin().await?;
            for (key, _) in &stale {
                txn.delete(key).await?;
            }
            txn.commit().await?;
            info!(
                "Discarded {} stale presence entries for workspace {}",
                stale.len(),
                self.workspace
            );
        }

        self.alarm = self.store.get_alarm().await?;
        if let Some(at) = self.alarm {
            debug!("Re-armed pending alarm for workspace {} at {}", self.workspace, at);
        }
        Ok(stale.len())
    }

    pub async fn on_connect(
        &mut self,
        id: ConnectionId,
        identity: Identity,
        outbox: ConnectionSender,
        resume: Option<Bookmark>,
    ) -> Result<ConnectReport, CoordinatorError> {
        if self.registry.contains(id) {
            warn!("Connection {} is already registered in workspace {}", id, self.workspace);
            return Err(CoordinatorError::AlreadyRegistered(id));
        }

        let now = Utc::now();
        let record = ConnectionRecord {
            id,
            identity: identity.clone(),
            outbox,
            connected_at: now,
        };
        if let Err(rejected) = self.registry.insert(record) {
            return Err(CoordinatorError::AlreadyRegistered(rejected.id));
        }

        let mut storage_error = None;
        let transition = self.ledger.acquire(&identity, now);
        if let Transition::Joined(entry) = &transition {
            if let Err(e) = self.mirror_presence(entry).await {
                warn!("Failed to mirror presence of {} in workspace {}: {}", entry.user_id, self.workspace, e);
                storage_error = Some(e);
            }
        }

        let bookmark = match self.store.bookmark().await {
            Ok(bookmark) => Some(bookmark),
            Err(e) => {
                warn!("Failed to read bookmark for workspace {}: {}", self.workspace, e);
                storage_error.get_or_insert(e);
                None
            }
        };
        self.send_welcome(id, bookmark);

        if let Some(since) = resume {
            if let Err(e) = self.replay(id, since, bookmark).await {
                warn!("Failed to replay log to {} in workspace {}: {}", id, self.workspace, e);
                storage_error.get_or_insert(e);
            }
        }

        let joined = matches!(transition, Transition::Joined(_));
        if joined {
            let report = self.broadcast(
                &BroadcastMessage::Join {
                    user_id: identity.user_id.clone(),
                    display_name: identity.display_name.clone(),
                },
                &[],
            );
            info!(
                "User {} joined workspace {} ({} delivered, {} failed)",
                identity.user_id,
                self.workspace,
                report.delivered,
                report.failed.len()
            );
        }

        Ok(ConnectReport {
            joined,
            user_connections: self.ledger.count(&identity.user_id),
            storage_error,
        })
    }

    pub async fn on_disconnect(&mut self, id: ConnectionId) -> DisconnectReport {
        let Some(record) = self.registry.remove(id) else {
            debug!("Ignoring disconnect of unknown connection {} in workspace {}", id, self.workspace);
            return DisconnectReport::unknown();
        };

        let user_id = record.identity.user_id;
        let mut storage_error = None;
        let left = match self.ledger.release(&user_id) {
            Transition::Left(entry) => {
                if self.settings.presence_mirror {
                    if let Err(e) = self.store.delete(&keys::presence(&entry.user_id)).await {
                        warn!("Failed to remove mirrored presence of {}: {}", entry.user_id, e);
                        storage_error = Some(e);
                    }
                }
                let report = self.broadcast(&BroadcastMessage::Leave { user_id: user_id.clone() }, &[]);
                info!(
                    "User {} left workspace {} ({} delivered, {} failed)",
                    user_id,
                    self.workspace,
                    report.delivered,
                    report.failed.len()
                );
                true
            }
            _ => false,
        };

        if self.registry.is_empty() {
            let at = Utc::now() + chrono::Duration::from_std(self.settings.idle_grace).unwrap_or_default();
            if let Err(e) = self.set_alarm(at).await {
                warn!("Failed to schedule idle alarm for workspace {}: {}", self.workspace, e);
                storage_error.get_or_insert(e);
            }
        }

        DisconnectReport {
            found: true,
            left,
            user_connections: self.ledger.count(&user_id),
            storage_error,
        }
    }

    pub fn list_presence(&self) -> Vec<PresenceEntry> {
        self.ledger.snapshot()
    }

    pub fn broadcast(&self, message: &BroadcastMessage, exclude: &[ConnectionId]) -> FanoutReport {
        broadcast::broadcast(&self.registry, message, exclude)
    }

    /// Forward application data from one connection to all the others, then
    /// append it to the replay log. Delivery has happened even when the log
    /// append fails.
    pub async fn relay(&mut self, from: ConnectionId, payload: Value) -> Result<FanoutReport, CoordinatorError> {
        if !self.registry.contains(from) {
            return Err(CoordinatorError::UnknownConnection(from));
        }

        let report = self.broadcast(&BroadcastMessage::Data { payload: payload.clone() }, &[from]);
        if self.settings.data_log_retention > 0 {
            self.append_log(payload).await?;
            if self.alarm.is_none() {
                let at = Utc::now() + chrono::Duration::from_std(self.settings.idle_grace).unwrap_or_default();
                self.set_alarm(at).await?;
            }
        }
        Ok(report)
    }

    /// Replaces any pending alarm.
    pub async fn set_alarm(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.store.set_alarm(at).await?;
        self.alarm = Some(at);
        Ok(())
    }

    pub async fn on_alarm(&mut self) {
        // the slot is cleared first so the alarm fires at most once
        self.alarm = None;
        if let Err(e) = self.store.delete_alarm().await {
            warn!("Failed to clear fired alarm for workspace {}: {}", self.workspace, e);
        }

        match self.compact_log().await {
            Ok(0) => {}
            Ok(removed) => debug!("Compacted {} log entries in workspace {}", removed, self.workspace),
            Err(e) => error!("Failed to compact log of workspace {}: {}", self.workspace, e),
        }

        if self.registry.is_empty() {
            if let Some(evictions) = &self.evictions {
                info!("Workspace {} is idle, requesting eviction", self.workspace);
                if evictions.send((self.workspace.clone(), self.incarnation)).is_err() {
                    debug!("Router is gone, nobody to evict workspace {}", self.workspace);
                }
            }
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            workspace: self.workspace.clone(),
            incarnation: self.incarnation,
            connections: self.registry.len(),
            present_users: self.ledger.len(),
            alarm: self.alarm,
        }
    }

    pub fn spawn(self) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(self.settings.command_queue_capacity);
        let handle = CoordinatorHandle {
            workspace: self.workspace.clone(),
            incarnation: self.incarnation,
            tx,
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        match self.start().await {
            Ok(_) => info!("Coordinator for workspace {} started ({})", self.workspace, self.incarnation),
            Err(e) => error!("Cold start of workspace {} hit a storage failure: {}", self.workspace, e),
        }

        loop {
            let deadline = self.alarm.map(deadline_for);
            let alarm = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if self.handle(command).await.is_break() {
                        break;
                    }
                }
                _ = alarm => self.on_alarm().await,
            }
        }

        info!("Coordinator for workspace {} stopped ({})", self.workspace, self.incarnation);
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect { id, identity, outbox, resume, reply } => {
                let _ = reply.send(self.on_connect(id, identity, outbox, resume).await);
            }
            Command::Disconnect { id, reply } => {
                let report = self.on_disconnect(id).await;
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            Command::Relay { from, payload, reply } => {
                let _ = reply.send(self.relay(from, payload).await);
            }
            Command::Broadcast { message, exclude, reply } => {
                let _ = reply.send(self.broadcast(&message, &exclude));
            }
            Command::ListPresence { reply } => {
                let _ = reply.send(self.list_presence());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::SetAlarm { at, reply } => {
                let _ = reply.send(self.set_alarm(at).await.map_err(CoordinatorError::from));
            }
            Command::Hibernate { reply } => {
                let idle = self.registry.is_empty();
                let _ = reply.send(idle);
                if idle {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    async fn mirror_presence(&self, entry: &PresenceEntry) -> Result<(), StoreError> {
        if !self.settings.presence_mirror {
            return Ok(());
        }
        let value = serde_json::to_value(entry)?;
        self.store.put(&keys::presence(&entry.user_id), value).await
    }

    fn send_welcome(&self, id: ConnectionId, bookmark: Option<Bookmark>) {
        let welcome = SendMessage::Welcome(WelcomeMessage {
            connection_id: id.value(),
            incarnation: self.incarnation,
            bookmark,
            presence: self.list_presence(),
        });
        if let Some(frame) = serialize_direct(&welcome) {
            broadcast::send_to(&self.registry, id, frame);
        }
    }

    async fn replay(&self, id: ConnectionId, since: Bookmark, bookmark: Option<Bookmark>) -> Result<(), StoreError> {
        let floor: Option<Bookmark> = match self.store.get(keys::LOG_FLOOR).await? {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };
        let truncated = floor.is_some_and(|floor| since < floor);
        if truncated {
            info!("Resume of {} in workspace {} predates the compacted log", id, self.workspace);
        }

        let entries: Vec<Value> = self
            .store
            .list_since(keys::LOG_PREFIX, since)
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect();
        debug!("Replaying {} log entries to {}", entries.len(), id);

        let replay = SendMessage::Replay(ReplayMessage { bookmark, truncated, entries });
        if let Some(frame) = serialize_direct(&replay) {
            broadcast::send_to(&self.registry, id, frame);
        }
        Ok(())
    }

    /// Each entry remembers the bookmark taken just before it was written; any
    /// reader holding an older bookmark has not seen the entry.
    async fn append_log(&self, payload: Value) -> Result<u64, StoreError> {
        let after = self.store.bookmark().await?;
        let mut txn = self.store.begin().await?;
        let seq = txn.get(keys::LOG_SEQ).await?.and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        txn.put(
            &keys::log_entry(seq),
            json!({ "seq": seq, "at": Utc::now(), "after": after, "payload": payload }),
        )
        .await?;
        txn.put(keys::LOG_SEQ, json!(seq)).await?;
        txn.commit().await?;
        Ok(seq)
    }

    /// Keeps the newest `data_log_retention` entries and raises the log floor
    /// in the same transaction.
    async fn compact_log(&self) -> Result<usize, StoreError> {
        let entries = self.store.list(keys::LOG_PREFIX).await?;
        let excess = entries.len().saturating_sub(self.settings.data_log_retention);
        if excess == 0 {
            return Ok(0);
        }

        // everything removed was written before the oldest kept entry started
        let kept_after = entries
            .get(excess)
            .and_then(|(_, entry)| entry.get("after").cloned())
            .and_then(|after| serde_json::from_value::<Bookmark>(after).ok());
        let floor = match kept_after {
            Some(floor) => floor,
            None => self.store.bookmark().await?,
        };

        let mut txn = self.store.begin().await?;
        for (key, _) in entries.iter().take(excess) {
            txn.delete(key).await?;
        }
        txn.put(keys::LOG_FLOOR, serde_json::to_value(floor)?).await?;
        txn.commit().await?;
        Ok(excess)
    }
}

/// Cheap, cloneable address of a running coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    workspace: WorkspaceId,
    incarnation: Uuid,
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub fn workspace(&self) -> &WorkspaceId {
        &self.workspace
    }

    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) async fn enqueue(&self, command: Command) -> Result<(), CoordinatorError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CoordinatorError::Unavailable(self.workspace.clone()))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(command(reply)).await?;
        rx.await.map_err(|_| CoordinatorError::Unavailable(self.workspace.clone()))
    }

    /// Queue a connect and return the pending reply without waiting for it.
    pub(crate) async fn enqueue_connect(
        &self,
        id: ConnectionId,
        identity: Identity,
        outbox: ConnectionSender,
        resume: Option<Bookmark>,
    ) -> Result<oneshot::Receiver<Result<ConnectReport, CoordinatorError>>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Command::Connect { id, identity, outbox, resume, reply }).await?;
        Ok(rx)
    }

    pub async fn connect(
        &self,
        id: ConnectionId,
        identity: Identity,
        outbox: ConnectionSender,
        resume: Option<Bookmark>,
    ) -> Result<ConnectReport, CoordinatorError> {
        self.request(|reply| Command::Connect { id, identity, outbox, resume, reply }).await?
    }

    pub async fn disconnect(&self, id: ConnectionId) -> Result<DisconnectReport, CoordinatorError> {
        self.request(|reply| Command::Disconnect { id, reply: Some(reply) }).await
    }

    /// Fire-and-forget disconnect, usable from synchronous drop paths.
    pub fn disconnect_detached(&self, id: ConnectionId) {
        let handle = self.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.enqueue(Command::Disconnect { id, reply: None }).await {
                debug!("Disconnect of {} not delivered: {}", id, e);
            }
        });
    }

    pub async fn relay(&self, from: ConnectionId, payload: Value) -> Result<FanoutReport, CoordinatorError> {
        self.request(|reply| Command::Relay { from, payload, reply }).await?
    }

    pub async fn broadcast(
        &self,
        message: BroadcastMessage,
        exclude: Vec<ConnectionId>,
    ) -> Result<FanoutReport, CoordinatorError> {
        self.request(|reply| Command::Broadcast { message, exclude, reply }).await
    }

    pub async fn list_presence(&self) -> Result<Vec<PresenceEntry>, CoordinatorError> {
        self.request(|reply| Command::ListPresence { reply }).await
    }

    pub async fn stats(&self) -> Result<CoordinatorStats, CoordinatorError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::SetAlarm { at, reply }).await?
    }

    pub(crate) async fn hibernate(&self) -> Result<bool, CoordinatorError> {
        self.request(|reply| Command::Hibernate { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;
    use crate::store::StorageBackend;

    struct Peer {
        id: ConnectionId,
        rx: mpsc::Receiver<String>,
    }

    impl Peer {
        fn frames(&mut self) -> Vec<Value> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(serde_json::from_str(&frame).unwrap());
            }
            frames
        }

        fn frames_of(&mut self, kind: &str) -> Vec<Value> {
            self.frames().into_iter().filter(|f| f["type"] == kind).collect()
        }
    }

    fn coordinator(backend: &MemoryBackend) -> Coordinator {
        let workspace = WorkspaceId::new("ws-1");
        Coordinator::new(workspace.clone(), backend.open(&workspace), CoordinatorSettings::default())
    }

    async fn connect(coordinator: &mut Coordinator, id: u64, user: &str) -> (Peer, ConnectReport) {
        let (outbox, rx) = mpsc::channel(64);
        let id = ConnectionId::new(id);
        let report = coordinator
            .on_connect(id, Identity::new(user, user.to_uppercase()), outbox, None)
            .await
            .unwrap();
        (Peer { id, rx }, report)
    }

    fn users(coordinator: &Coordinator) -> Vec<String> {
        coordinator.list_presence().into_iter().map(|e| e.user_id).collect()
    }

    #[tokio::test]
    async fn multi_tab_walkthrough() {
        let backend = MemoryBackend::new();
        let mut c = coordinator(&backend);
        c.start().await.unwrap();

        // 1. first tab joins
        let (mut h1, report) = connect(&mut c, 1, "u1").await;
        assert!(report.joined);
        let joins = h1.frames_of("join");
        assert_eq!(joins, vec![json!({"type": "join", "userId": "u1", "displayName": "U1"})]);
        assert_eq!(users(&c), vec!["u1"]);

        // 2. second tab of the same user
        let (mut h2, report) = connect(&mut c, 2, "u1").await;
        assert!(!report.joined);
        assert_eq!(report.user_connections, 2);
        assert!(h1.frames_of("join").is_empty());
        assert!(h2.frames_of("join").is_empty());

        // 5. another user while u1 has two tabs
        let (mut h3, _) = connect(&mut c, 3, "u2").await;
        assert_eq!(users(&c), vec!["u1", "u2"]);
        h1.frames();
        h2.frames();

        // 3. closing one tab changes nothing
        let report = c.on_disconnect(h1.id).await;
        assert!(report.found && !report.left);
        assert_eq!(report.user_connections, 1);
        assert_eq!(users(&c), vec!["u1", "u2"]);
        assert!(h2.frames_of("leave").is_empty());
        assert!(h3.frames_of("leave").is_empty());

        // 4. closing the last tab leaves exactly once
        let report = c.on_disconnect(h2.id).await;
        assert!(report.left);
        assert_eq!(users(&c), vec!["u2"]);
        assert_eq!(h3.frames_of("leave"), vec![json!({"type": "leave", "userId": "u1"})]);
    }

    #[tokio::test]
    async fn one_join_and_one_leave_for_any_disconnect_order() {
        let orders: [[u64; 3]; 6] = [[1, 2, 3], [1, 3, 2], [2, 1, 3], [2, 3, 1], [3, 1, 2], [3, 2, 1]];
        for order in orders {
            let backend = MemoryBackend::new();
            let mut c = coordinator(&backend);
            let (mut observer, _) = connect(&mut c, 100, "watcher").await;
            observer.frames();

            for id in 1..=3 {
                connect(&mut c, id, "u1").await;
                assert_eq!(users(&c), vec!["u1", "watcher"]);
            }
            for (i, id) in order.iter().enumerate() {
                c.on_disconnect(ConnectionId::new(*id)).await;
                let present = users(&c).contains(&"u1".to_string());
                assert_eq!(present, i < 2, "order {:?}", order);
            }

            let frames = observer.frames();
            let joins = frames.iter().filter(|f| f["type"] == "join").count();
            let leaves = frames.iter().filter(|f| f["type"] == "leave").count();
            assert_eq!((joins, leaves), (1, 1), "order {:?}", order);
        }
    }

    #[tokio::test]
    async fn users_do_not_affect_each_other() {
        let backend = MemoryBackend::new();
        let mut c = coordinator(&backend);
        let (mut a, _) = connect(&mut c, 1, "a").await;
        a.frames();

        for round in 0..3u64 {
            let (b, _) = connect(&mut c, 10 + round, "b").await;
            c.on_disconnect(b.id).await;
        }

        assert_eq!(users(&c), vec!["a"]);
        assert_eq!(c.ledger.count("a"), 1);
        let frames = a.frames();
        assert!(frames.iter().all(|f| f["userId"] == "b"));
        assert_eq!(frames.len(), 6);
    }

    #[tokio::test]
    async fn disconnect_twice_is_a_no_op() {
        let backend = MemoryBackend::new();
        let mut c = coordinator(&backend);
        let (h1, _) = connect(&mut c, 1, "u1").await;
        connect(&mut c, 2, "u1").await;

        assert!(c.on_disconnect(h1.id).await.found);
        let again = c.on_disconnect(h1.id).await;
        assert!(!again.found && !again.left);
        assert_eq!(c.ledger.count("u1"), 1);
        assert_eq!(users(&c), vec!["u1"]);
    }

    #[tokio::test]
    async fn duplicate_connect_is_rejected_without_side_effects() {
        let backend = MemoryBackend::new();
        let mut c = coordinator(&backend);
        let (mut h1, _) = connect(&mut c, 1, "u1").await;
        h1.frames();

        let (outbox, _rx) = mpsc::channel(4);
        let err = c
            .on_connect(h1.id, Identity::new("u2", "Other"), outbox, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyRegistered(id) if id == h1.id));
        assert_eq!(users(&c), vec!["u1"]);
        assert_eq!(c.registry.len(), 1);
        assert!(h1.frames().is_empty());
    }

    #[tokio::test]
    async fn restart_discards_stale_presence() {
        let backend = MemoryBackend::new();
        let workspace = WorkspaceId::new("ws-1");
        {
            let mut before = coordinator(&backend);
            before.start().await.unwrap();
            connect(&mut before, 1, "u1").await;
            connect(&mut before, 2, "u2").await;
            // dropped without any disconnect, like an evicted process
        }
        let store = backend.open(&workspace);
        assert_eq!(store.list(keys::PRESENCE_PREFIX).await.unwrap().len(), 2);

        let mut after = coordinator(&backend);
        assert!(after.list_presence().is_empty());
        assert_eq!(after.start().await.unwrap(), 2);
        assert!(after.list_presence().is_empty());
        assert!(store.list(keys::PRESENCE_PREFIX).await.unwrap().is_empty());

        let (_, report) = connect(&mut after, 1, "u1").await;
        assert!(report.joined);
        assert_eq!(after.ledger.count("u1"), 1);
    }

    #[tokio::test]
    async fn storage_failure_keeps_in_memory_presence() {
        let backend = MemoryBackend::new();
        let workspace = WorkspaceId::new("ws-1");
        let mut c = coordinator(&backend);
        backend.store(&workspace).fail_writes(true);

        let (mut observer, _) = connect(&mut c, 9, "watcher").await;
        observer.frames();
        let (_, report) = connect(&mut c, 1, "u1").await;
        assert!(report.joined);
        assert!(report.storage_error.is_some());
        assert_eq!(users(&c), vec!["u1", "watcher"]);
        assert_eq!(observer.frames_of("join").len(), 1);

        let report = c.on_disconnect(ConnectionId::new(1)).await;
        assert!(report.left);
        assert!(report.storage_error.is_some());
        assert_eq!(users(&c), vec!["watcher"]);
    }

    #[tokio::test]
    async fn relay_skips_sender_and_resume_replays_newer_entries() {
        let backend = MemoryBackend::new();
        let mut c = coordinator(&backend);
        let (mut h1, _) = connect(&mut c, 1, "u1").await;
        let (mut h2, _) = connect(&mut c, 2, "u2").await;
        c.relay(h1.id, json!({"n": 1})).await.unwrap();

        let frames = h1.frames();
        assert!(frames.iter().all(|f| f["type"] != "data"));
        let welcome = frames.iter().find(|f| f["type"] == "welcome").unwrap();
        let mark: Bookmark = serde_json::from_value(welcome["bookmark"].clone()).unwrap();
        assert_eq!(h2.frames_of("data"), vec![json!({"type": "data", "payload": {"n": 1}})]);

        let report = c.relay(h2.id, json!({"n": 2})).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(h1.frames_of("data"), vec![json!({"type": "data", "payload": {"n": 2}})]);

        // a reconnecting tab resumes from the bookmark it saw at welcome time
        let (outbox, rx) = mpsc::channel(16);
        c.on_connect(ConnectionId::new(3), Identity::new("u1", "U1"), outbox, Some(mark))
            .await
            .unwrap();
        let mut h3 = Peer { id: ConnectionId::new(3), rx };
        assert_eq!(replay_of(&mut h3), (false, vec![json!({"n": 1}), json!({"n": 2})]));
    }

    #[tokio::test]
    async fn relay_from_unknown_connection_fails() {
        let backend = MemoryBackend::new();
        let mut c = coordinator(&backend);
        let err = c.relay(ConnectionId::new(5), json!(null)).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownConnection(_)));
    }

    #[tokio::test]
    async fn alarm_compacts_log_and_reports_idle() {
        let backend = MemoryBackend::new();
        let workspace = WorkspaceId::new("ws-1");
        let settings = CoordinatorSettings {
            data_log_retention: 2,
            ..CoordinatorSettings::default()
        };
        let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
        let mut c = Coordinator::new(workspace.clone(), backend.open(&workspace), settings).with_evictions(evict_tx);

        let (h1, _) = connect(&mut c, 1, "u1").await;
        for n in 0..5 {
            c.relay(h1.id, json!(n)).await.unwrap();
        }
        assert!(c.stats().alarm.is_some());

        c.on_alarm().await;
        let log = backend.open(&workspace).list(keys::LOG_PREFIX).await.unwrap();
        let kept: Vec<Value> = log.into_iter().map(|(_, v)| v["payload"].clone()).collect();
        assert_eq!(kept, vec![json!(3), json!(4)]);
        assert!(evict_rx.try_recv().is_err());
        assert_eq!(backend.open(&workspace).get_alarm().await.unwrap(), None);

        c.on_disconnect(h1.id).await;
        assert!(c.stats().alarm.is_some());
        c.on_alarm().await;
        assert_eq!(evict_rx.try_recv().unwrap(), (workspace, c.incarnation));
    }

    #[tokio::test]
    async fn idle_alarm_without_a_router_is_harmless() {
        let backend = MemoryBackend::new();
        let workspace = WorkspaceId::new("ws-1");
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        drop(evict_rx);
        let mut c = Coordinator::new(workspace.clone(), backend.open(&workspace), CoordinatorSettings::default())
            .with_evictions(evict_tx);

        let (h1, _) = connect(&mut c, 1, "u1").await;
        c.on_disconnect(h1.id).await;
        c.on_alarm().await;
        assert_eq!(c.stats().alarm, None);
        assert_eq!(backend.open(&workspace).get_alarm().await.unwrap(), None);
    }

    fn replay_of(peer: &mut Peer) -> (bool, Vec<Value>) {
        let replay = peer.frames_of("replay").remove(0);
        let payloads = replay["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["payload"].clone())
            .collect();
        (replay["truncated"].as_bool().unwrap(), payloads)
    }

    #[tokio::test]
    async fn resume_from_before_compaction_is_flagged_truncated() {
        let backend = MemoryBackend::new();
        let workspace = WorkspaceId::new("ws-1");
        let settings = CoordinatorSettings {
            data_log_retention: 2,
            ..CoordinatorSettings::default()
        };
        let store = backend.open(&workspace);
        let mut c = Coordinator::new(workspace.clone(), store.clone(), settings);

        let (mut h1, _) = connect(&mut c, 1, "u1").await;
        let welcome = h1.frames_of("welcome").remove(0);
        let stale: Bookmark = serde_json::from_value(welcome["bookmark"].clone()).unwrap();

        let mut recent = None;
        for n in 0..5 {
            c.relay(h1.id, json!(n)).await.unwrap();
            if n == 2 {
                recent = Some(store.bookmark().await.unwrap());
            }
        }
        c.on_alarm().await;

        // entries 0..=2 are gone and this reader never saw them
        let (outbox, rx) = mpsc::channel(16);
        c.on_connect(ConnectionId::new(2), Identity::new("u1", "U1"), outbox, Some(stale))
            .await
            .unwrap();
        let mut h2 = Peer { id: ConnectionId::new(2), rx };
        assert_eq!(replay_of(&mut h2), (true, vec![json!(3), json!(4)]));

        // this reader had already seen everything that was removed
        let (outbox, rx) = mpsc::channel(16);
        c.on_connect(ConnectionId::new(3), Identity::new("u1", "U1"), outbox, recent)
            .await
            .unwrap();
        let mut h3 = Peer { id: ConnectionId::new(3), rx };
        assert_eq!(replay_of(&mut h3), (false, vec![json!(3), json!(4)]));
    }

    #[tokio::test]
    async fn actor_serializes_concurrent_tabs() {
        let backend = MemoryBackend::new();
        let handle = coordinator(&backend).spawn();

        let (outbox, rx) = mpsc::channel(256);
        handle
            .connect(ConnectionId::new(1000), Identity::new("watcher", "W"), outbox, None)
            .await
            .unwrap();
        let mut observer = Peer { id: ConnectionId::new(1000), rx };

        let mut tasks = Vec::new();
        for id in 0..20u64 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let (outbox, rx) = mpsc::channel(256);
                let id = ConnectionId::new(id);
                handle.connect(id, Identity::new("u1", "U1"), outbox, None).await.unwrap();
                handle.disconnect(id).await.unwrap();
                drop(rx);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let frames = observer.frames();
        let kinds: Vec<&str> = frames
            .iter()
            .filter(|f| f["userId"] == "u1")
            .map(|f| f["type"].as_str().unwrap())
            .collect();
        // every join is followed by its leave before the next join
        assert!(!kinds.is_empty());
        for pair in kinds.chunks(2) {
            assert_eq!(pair, ["join", "leave"]);
        }
        assert_eq!(handle.list_presence().await.unwrap().len(), 1);

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(observer.id, ConnectionId::new(1000));
    }

    #[tokio::test]
    async fn handle_broadcast_and_alarm_go_through_the_queue() {
        let backend = MemoryBackend::new();
        let workspace = WorkspaceId::new("ws-1");
        let handle = coordinator(&backend).spawn();

        let mut peers = Vec::new();
        for (id, user) in [(1, "u1"), (2, "u2"), (3, "u3")] {
            let (outbox, rx) = mpsc::channel(16);
            let id = ConnectionId::new(id);
            handle.connect(id, Identity::new(user, user), outbox, None).await.unwrap();
            peers.push(Peer { id, rx });
        }
        for peer in peers.iter_mut() {
            peer.frames();
        }

        let report = handle
            .broadcast(BroadcastMessage::Data { payload: json!("hi") }, vec![peers[1].id])
            .await
            .unwrap();
        assert_eq!(report.delivered, 2);
        assert!(report.failed.is_empty());
        assert_eq!(peers[0].frames_of("data").len(), 1);
        assert!(peers[1].frames_of("data").is_empty());
        assert_eq!(peers[2].frames_of("data").len(), 1);

        // a second alarm replaces the first instead of queueing behind it
        let later = Utc::now() + chrono::Duration::hours(1);
        let sooner = Utc::now() + chrono::Duration::minutes(30);
        handle.set_alarm(later).await.unwrap();
        handle.set_alarm(sooner).await.unwrap();
        assert_eq!(handle.stats().await.unwrap().alarm, Some(sooner));
        assert_eq!(backend.open(&workspace).get_alarm().await.unwrap(), Some(sooner));
    }

    #[tokio::test]
    async fn hibernate_refuses_while_connections_are_live() {
        let backend = MemoryBackend::new();
        let handle = coordinator(&backend).spawn();
        let (outbox, _rx) = mpsc::channel(8);
        handle.connect(ConnectionId::new(1), Identity::new("u1", "U1"), outbox, None).await.unwrap();

        assert!(!handle.hibernate().await.unwrap());
        handle.disconnect(ConnectionId::new(1)).await.unwrap();
        assert!(handle.hibernate().await.unwrap());
        assert!(matches!(handle.list_presence().await, Err(CoordinatorError::Unavailable(_))));
    }
}
