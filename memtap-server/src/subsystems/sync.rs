//! Memory sync loop: the durability boundary in front of the store.
//!
//! Single consumer over a bounded submission queue. Each dequeued item gets
//! one store attempt; transient failures are re-enqueued on a backoff timer
//! rather than slept on inline, so a flapping store never stalls the queue.
//! Delivery is at-least-once with a bounded content-hash dedup cache in
//! front of the first attempt. Turns that exhaust their retry schedule are
//! logged and dropped; interception never blocks on the store.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use memtap_core::config::SyncConfig;
use memtap_core::models::{ConversationTurn, InsightRecord, Message};
use memtap_core::store::{MemoryStore, RetryPolicy, StoreError};

use super::reflect::ReflectionHandle;

/// Anything the sync loop can make durable.
#[derive(Debug, Clone)]
pub enum SyncItem {
    Turn(ConversationTurn),
    Insight(InsightRecord),
}

impl SyncItem {
    fn user_id(&self) -> &str {
        match self {
            SyncItem::Turn(turn) => &turn.user_id,
            SyncItem::Insight(record) => &record.user_id,
        }
    }

    fn label(&self) -> &str {
        match self {
            SyncItem::Turn(turn) => &turn.turn_id,
            SyncItem::Insight(_) => "insight",
        }
    }

    fn messages(&self) -> Vec<Message> {
        match self {
            SyncItem::Turn(turn) => turn.messages.clone(),
            SyncItem::Insight(record) => record.to_messages(),
        }
    }

    fn metadata(&self) -> serde_json::Value {
        match self {
            SyncItem::Turn(turn) => turn.metadata(),
            SyncItem::Insight(record) => record.metadata(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Pending,
    Submitted,
    Failed,
}

/// Per-item submission bookkeeping, carried across retries.
#[derive(Debug, Clone)]
pub struct SubmissionTicket {
    pub item_id: String,
    pub user_id: String,
    pub attempt_count: usize,
    pub last_error: Option<String>,
    pub status: TicketStatus,
}

impl SubmissionTicket {
    fn new(item: &SyncItem) -> Self {
        Self {
            item_id: item.label().to_string(),
            user_id: item.user_id().to_string(),
            attempt_count: 0,
            last_error: None,
            status: TicketStatus::Pending,
        }
    }
}

pub struct PendingSubmission {
    item: SyncItem,
    ticket: SubmissionTicket,
    delays: VecDeque<Duration>,
    ack: Option<oneshot::Sender<Result<String, StoreError>>>,
}

pub enum SyncCommand {
    Submit {
        item: SyncItem,
        ack: Option<oneshot::Sender<Result<String, StoreError>>>,
    },
    Retry(Box<PendingSubmission>),
}

#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SyncCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Fire-and-forget turn submission from the interception hot path.
    /// A full queue drops the turn with a warning rather than blocking.
    pub fn submit(&self, turn: ConversationTurn) {
        let turn_id = turn.turn_id.clone();
        if let Err(e) = self.tx.try_send(SyncCommand::Submit {
            item: SyncItem::Turn(turn),
            ack: None,
        }) {
            tracing::warn!(turn_id = %turn_id, error = %e, "sync queue full, turn dropped");
        }
    }

    /// Awaitable insight submission. Resolves once the insight is durably
    /// stored or its retry schedule is exhausted.
    pub async fn submit_insight(&self, record: InsightRecord) -> Result<String, StoreError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::Submit {
                item: SyncItem::Insight(record),
                ack: Some(ack),
            })
            .await
            .map_err(|_| StoreError::Unavailable("sync queue closed".to_string()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("sync loop stopped".to_string()))?
    }
}

/// Bounded FIFO of recently submitted content keys. Suppresses the
/// duplicate exchanges a replaying proxy produces; the store's own
/// dedup remains the durable backstop.
struct DedupCache {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false when the key was already present.
    fn insert(&mut self, key: String) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

pub async fn run_sync_loop(
    mut rx: mpsc::Receiver<SyncCommand>,
    handle: SyncHandle,
    store: Arc<dyn MemoryStore>,
    policy: RetryPolicy,
    config: SyncConfig,
    reflection: ReflectionHandle,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(
        max_retries = policy.max_retries,
        dedup_cache_size = config.dedup_cache_size,
        "Sync loop started"
    );
    let mut dedup = DedupCache::new(config.dedup_cache_size);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                None => break,
                Some(SyncCommand::Submit { item, ack }) => {
                    if let SyncItem::Turn(turn) = &item {
                        if !dedup.insert(turn.content_key()) {
                            tracing::debug!(
                                turn_id = %turn.turn_id,
                                "duplicate turn suppressed"
                            );
                            continue;
                        }
                    }
                    let pending = PendingSubmission {
                        ticket: SubmissionTicket::new(&item),
                        delays: policy.schedule().into(),
                        item,
                        ack,
                    };
                    attempt(pending, &store, &handle, &reflection).await;
                }
                Some(SyncCommand::Retry(pending)) => {
                    attempt(*pending, &store, &handle, &reflection).await;
                }
            },
            _ = shutdown.recv() => {
                drain(&mut rx, &store, &reflection, &config).await;
                break;
            }
        }
    }
    tracing::info!("Sync loop stopped");
}

/// One store attempt. Transient failures reschedule on a timer task;
/// permanent failures and exhausted schedules fail the ticket.
async fn attempt(
    mut pending: PendingSubmission,
    store: &Arc<dyn MemoryStore>,
    handle: &SyncHandle,
    reflection: &ReflectionHandle,
) {
    pending.ticket.attempt_count += 1;
    let messages = pending.item.messages();
    let result = store
        .add(&messages, pending.item.user_id(), pending.item.metadata())
        .await;

    match result {
        Ok(memory_id) => {
            pending.ticket.status = TicketStatus::Submitted;
            tracing::info!(
                item = %pending.ticket.item_id,
                user_id = %pending.ticket.user_id,
                memory_id = %memory_id,
                attempts = pending.ticket.attempt_count,
                "submission durable"
            );
            if let SyncItem::Turn(turn) = &pending.item {
                reflection.notify_turn(turn.clone());
            }
            if let Some(ack) = pending.ack.take() {
                let _ = ack.send(Ok(memory_id));
            }
        }
        Err(e) if e.is_retryable() => match pending.delays.pop_front() {
            Some(delay) => {
                pending.ticket.last_error = Some(e.to_string());
                tracing::warn!(
                    item = %pending.ticket.item_id,
                    attempt = pending.ticket.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient store failure, retry scheduled"
                );
                let tx = handle.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(SyncCommand::Retry(Box::new(pending))).await;
                });
            }
            None => fail(pending, e),
        },
        Err(e) => fail(pending, e),
    }
}

fn fail(mut pending: PendingSubmission, error: StoreError) {
    pending.ticket.status = TicketStatus::Failed;
    tracing::error!(
        item = %pending.ticket.item_id,
        user_id = %pending.ticket.user_id,
        attempts = pending.ticket.attempt_count,
        previous_error = pending.ticket.last_error.as_deref().unwrap_or("none"),
        error = %error,
        "submission abandoned"
    );
    if let Some(ack) = pending.ack.take() {
        let _ = ack.send(Err(error));
    }
}

/// Best-effort flush of already-queued submissions within the configured
/// deadline. Each drained item gets a single attempt; scheduled retries
/// are abandoned.
async fn drain(
    rx: &mut mpsc::Receiver<SyncCommand>,
    store: &Arc<dyn MemoryStore>,
    reflection: &ReflectionHandle,
    config: &SyncConfig,
) {
    tracing::info!(
        flush_ms = config.shutdown_flush_ms,
        "Sync loop draining before shutdown"
    );
    rx.close();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(config.shutdown_flush_ms);
    let mut abandoned = 0usize;
    let (noop_handle, _noop_rx) = SyncHandle::channel(1);

    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(SyncCommand::Submit { item, ack })) => {
                let pending = PendingSubmission {
                    ticket: SubmissionTicket::new(&item),
                    delays: VecDeque::new(),
                    item,
                    ack,
                };
                attempt(pending, store, &noop_handle, reflection).await;
            }
            Ok(Some(SyncCommand::Retry(pending))) => {
                fail(*pending, StoreError::Unavailable("shutdown".to_string()));
                abandoned += 1;
            }
            Ok(None) => break,
            Err(_) => {
                // Deadline hit with items still queued.
                while let Ok(command) = rx.try_recv() {
                    if let SyncCommand::Submit { ack: Some(ack), .. } = command {
                        let _ = ack.send(Err(StoreError::Unavailable("shutdown".to_string())));
                    }
                    abandoned += 1;
                }
                break;
            }
        }
    }

    if abandoned > 0 {
        tracing::warn!(abandoned, "submissions abandoned at shutdown");
    }
}
