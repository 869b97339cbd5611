//! Audit Recorder
//!
//! Front door of the audit trail. [`AuditRecorder::record`] never blocks:
//! it seals the payload, stamps the sequence number and hands the entry to a
//! single writer task through a bounded queue, so entries reach the sink in
//! arrival order. Writes that keep failing are retried with backoff and
//! finally abandoned with an alert; the affected execution is then flagged
//! audit-incomplete.
//!
//! When the queue is full the entry waits in a background task for space,
//! up to the retry policy's deadline. Such entries may reach the sink after
//! later ones; their sequence number still records the arrival order.

use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::redact::RedactedCommand;
use super::retry::{RetryDecision, RetryPolicy};
use super::{AuditConfig, AuditEntry, AuditError, AuditOutcome, AuditQuery, AuditSink};
use crate::crypto::{CryptoError, SealedPayload, SecretBox};
use crate::metrics;

/// Tracing target for operational audit alerts
pub const ALERT_TARGET: &str = "execgate::audit::alert";

/// Associated data binding sealed payloads to the audit trail
pub const PAYLOAD_PURPOSE: &[u8] = b"execgate:audit";

/// Entry contents supplied by the caller
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub principal: String,
    pub action: String,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub execution_id: Option<Uuid>,
    pub command: Option<RedactedCommand>,
}

impl AuditDraft {
    pub fn new(principal: impl Into<String>, action: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            principal: principal.into(),
            action: action.into(),
            outcome,
            reason: None,
            execution_id: None,
            command: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    /// Attach the command line; it is redacted here and sealed on record
    pub fn with_command(mut self, arguments: &[String], context: Option<&str>) -> Self {
        self.command = Some(RedactedCommand::new(arguments, context));
        self
    }
}

enum Message {
    Write(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Ids flagged audit-incomplete, oldest dropped first past `capacity`
#[derive(Debug)]
struct IncompleteIds {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl IncompleteIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: Uuid) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(dropped) = self.order.pop_front() {
                self.ids.remove(&dropped);
                warn!(target: ALERT_TARGET, dropped = %dropped, capacity = self.capacity, "Audit-incomplete set full; forgot oldest id");
            }
        }
    }

    fn drain(&mut self) -> Vec<Uuid> {
        self.ids.clear();
        self.order.drain(..).collect()
    }
}

type IncompleteSet = Arc<Mutex<IncompleteIds>>;

/// Ordered, non-blocking audit writer
pub struct AuditRecorder {
    sender: mpsc::Sender<Message>,
    next_sequence: Mutex<u64>,
    incomplete: IncompleteSet,
    /// Entries waiting for queue space
    overflow: Mutex<Vec<JoinHandle<()>>>,
    overflow_limit: usize,
    overflow_deadline: Duration,
    sealer: Arc<SecretBox>,
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for AuditRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditRecorder")
            .field("queue_capacity", &self.sender.max_capacity())
            .finish_non_exhaustive()
    }
}

impl AuditRecorder {
    /// Start the writer task; must be called inside a tokio runtime
    pub fn new(sink: Arc<dyn AuditSink>, sealer: Arc<SecretBox>, config: &AuditConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let incomplete: IncompleteSet = Arc::new(Mutex::new(IncompleteIds::new(config.incomplete_capacity)));

        tokio::spawn(run_writer(
            receiver,
            sink.clone(),
            config.retry.clone(),
            incomplete.clone(),
        ));

        Self {
            sender,
            next_sequence: Mutex::new(0),
            incomplete,
            overflow: Mutex::new(Vec::new()),
            overflow_limit: config.queue_capacity.max(1),
            overflow_deadline: config.retry.deadline(),
            sealer,
            sink,
        }
    }

    /// Record an entry; returns its id
    pub fn record(&self, draft: AuditDraft) -> Uuid {
        let (payload, payload_error) = match &draft.command {
            Some(command) => match self.seal(command) {
                Ok(sealed) => (Some(sealed), None),
                Err(e) => {
                    warn!(principal = %draft.principal, action = %draft.action, error = %e, "Audit payload could not be sealed");
                    (None, Some(e.to_string()))
                }
            },
            None => (None, None),
        };

        let mut next = self.next_sequence.lock().unwrap_or_else(|p| p.into_inner());
        *next += 1;
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            sequence: *next,
            timestamp: Utc::now(),
            principal: draft.principal,
            action: draft.action,
            outcome: draft.outcome,
            reason: draft.reason,
            execution_id: draft.execution_id,
            payload,
            payload_error,
        };
        let id = entry.id;
        debug!(entry_id = %id, sequence = entry.sequence, outcome = %entry.outcome, "Queueing audit entry");

        match self.sender.try_send(Message::Write(entry)) {
            Ok(()) => {}
            Err(TrySendError::Full(Message::Write(entry))) => self.defer(entry),
            Err(TrySendError::Closed(Message::Write(entry))) => {
                abandon(&self.incomplete, &entry, "closed", &AuditError::Closed.to_string());
            }
            Err(_) => {}
        }
        id
    }

    /// Park an entry until the queue has room or the deadline passes
    fn defer(&self, entry: AuditEntry) {
        let mut overflow = self.overflow.lock().unwrap_or_else(|p| p.into_inner());
        overflow.retain(|task| !task.is_finished());
        if overflow.len() >= self.overflow_limit {
            abandon(&self.incomplete, &entry, "queue_full", &AuditError::QueueFull.to_string());
            return;
        }

        warn!(
            entry_id = %entry.id,
            sequence = entry.sequence,
            waiting = overflow.len() + 1,
            "Audit queue full; waiting for space"
        );
        let sender = self.sender.clone();
        let incomplete = self.incomplete.clone();
        let deadline = self.overflow_deadline;
        overflow.push(tokio::spawn(async move {
            match tokio::time::timeout(deadline, sender.reserve()).await {
                Ok(Ok(permit)) => permit.send(Message::Write(entry)),
                Ok(Err(_)) => abandon(&incomplete, &entry, "closed", &AuditError::Closed.to_string()),
                Err(_) => abandon(&incomplete, &entry, "queue_full", &AuditError::QueueFull.to_string()),
            }
        }));
    }

    /// Wait until everything recorded so far has been written or abandoned
    pub async fn flush(&self) -> Result<(), AuditError> {
        let waiting = std::mem::take(&mut *self.overflow.lock().unwrap_or_else(|p| p.into_inner()));
        for task in waiting {
            if let Err(e) = task.await {
                warn!(error = %e, "Deferred audit entry task failed");
            }
        }

        let (done, wait) = oneshot::channel();
        self.sender
            .send(Message::Flush(done))
            .await
            .map_err(|_| AuditError::Closed)?;
        wait.await.map_err(|_| AuditError::Closed)
    }

    /// Whether the entry or execution with this id is missing from the trail
    pub fn is_incomplete(&self, id: Uuid) -> bool {
        self.incomplete
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .ids
            .contains(&id)
    }

    /// Ids flagged audit-incomplete, oldest first
    pub fn incomplete(&self) -> Vec<Uuid> {
        self.incomplete
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .order
            .iter()
            .copied()
            .collect()
    }

    /// Take the flagged ids, e.g. after they have been reconciled
    pub fn drain_incomplete(&self) -> Vec<Uuid> {
        self.incomplete.lock().unwrap_or_else(|p| p.into_inner()).drain()
    }

    /// Read back stored entries
    pub async fn export(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        self.sink.export(query).await
    }

    /// Decrypt an entry's payload; fails closed on any integrity error
    pub fn open_payload(&self, entry: &AuditEntry) -> Result<Option<RedactedCommand>, AuditError> {
        let Some(sealed) = &entry.payload else {
            return Ok(None);
        };
        let plaintext = self
            .sealer
            .open(sealed, PAYLOAD_PURPOSE)
            .map_err(|e| AuditError::Crypto(e.to_string()))?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    fn seal(&self, command: &RedactedCommand) -> Result<SealedPayload, CryptoError> {
        let plaintext = serde_json::to_vec(command).map_err(|_| CryptoError::Encrypt)?;
        self.sealer.seal(&plaintext, PAYLOAD_PURPOSE)
    }
}

/// Flag an entry as lost and raise the operational alert
fn abandon(incomplete: &IncompleteSet, entry: &AuditEntry, reason: &str, detail: &str) {
    let key = entry.execution_id.unwrap_or(entry.id);
    incomplete
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(key);
    metrics::record_audit_failure(reason);
    error!(
        target: ALERT_TARGET,
        entry_id = %entry.id,
        execution_id = ?entry.execution_id,
        principal = %entry.principal,
        action = %entry.action,
        sequence = entry.sequence,
        reason,
        error = detail,
        "Audit entry could not be written; marked audit-incomplete"
    );
}

async fn run_writer(
    mut receiver: mpsc::Receiver<Message>,
    sink: Arc<dyn AuditSink>,
    policy: RetryPolicy,
    incomplete: IncompleteSet,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            Message::Write(entry) => write_with_retry(sink.as_ref(), &entry, &policy, &incomplete).await,
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Audit writer stopped");
}

async fn write_with_retry(
    sink: &dyn AuditSink,
    entry: &AuditEntry,
    policy: &RetryPolicy,
    incomplete: &IncompleteSet,
) {
    let mut attempt = 0;
    loop {
        match sink.append(entry).await {
            Ok(()) => {
                metrics::AUDIT_ENTRIES_TOTAL.inc();
                if attempt > 0 {
                    info!(entry_id = %entry.id, attempts = attempt + 1, "Audit entry written after retry");
                }
                return;
            }
            Err(e) => match policy.next(attempt) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        entry_id = %entry.id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Audit write failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    abandon(incomplete, entry, "retries_exhausted", &e.to_string());
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn sealer() -> Arc<SecretBox> {
        Arc::new(SecretBox::generate().0)
    }

    fn config(retry: RetryPolicy) -> AuditConfig {
        AuditConfig {
            queue_capacity: 64,
            retry,
            ..AuditConfig::default()
        }
    }

    /// Fails the first `failures` appends
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
        inner: MemoryAuditSink,
    }

    #[async_trait]
    impl AuditSink for FlakySink {
        async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(AuditError::Unavailable("disk full".to_string()));
            }
            self.inner.append(entry).await
        }

        async fn export(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
            self.inner.export(query).await
        }
    }

    /// Blocks every append until a permit is released
    struct GatedSink {
        gate: Arc<Semaphore>,
        inner: MemoryAuditSink,
    }

    #[async_trait]
    impl AuditSink for GatedSink {
        async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
            self.gate
                .acquire()
                .await
                .map_err(|e| AuditError::Unavailable(e.to_string()))?
                .forget();
            self.inner.append(entry).await
        }

        async fn export(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
            self.inner.export(query).await
        }
    }

    #[tokio::test]
    async fn test_entries_are_sequenced_and_sealed() {
        let sink = MemoryAuditSink::new();
        let recorder = AuditRecorder::new(Arc::new(sink.clone()), sealer(), &config(RetryPolicy::none()));

        let args = vec!["search".to_string(), "api_token=abc".to_string()];
        recorder.record(
            AuditDraft::new("alice", "call-tool", AuditOutcome::Succeeded)
                .with_command(&args, Some("github")),
        );
        recorder.record(AuditDraft::new("bob", "list-servers", AuditOutcome::Throttled).with_reason("rate limited"));
        recorder.flush().await.unwrap();

        let entries = sink.entries().await;
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);

        let sealed = entries[0].payload.as_ref().unwrap();
        assert_eq!(sealed.alg, crate::crypto::ALGORITHM);
        let opened = recorder.open_payload(&entries[0]).unwrap().unwrap();
        assert_eq!(opened.arguments, vec!["search", "api_token=***"]);
        assert_eq!(opened.context.as_deref(), Some("github"));
        assert!(recorder.open_payload(&entries[1]).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_closed() {
        let sink = MemoryAuditSink::new();
        let recorder = AuditRecorder::new(Arc::new(sink.clone()), sealer(), &config(RetryPolicy::none()));
        recorder.record(
            AuditDraft::new("alice", "call-tool", AuditOutcome::Succeeded).with_command(&["x".to_string()], None),
        );
        recorder.flush().await.unwrap();

        let mut entry = sink.entries().await.remove(0);
        let other = AuditRecorder::new(Arc::new(MemoryAuditSink::new()), sealer(), &config(RetryPolicy::none()));
        assert!(matches!(other.open_payload(&entry), Err(AuditError::Crypto(_))));

        if let Some(payload) = entry.payload.as_mut() {
            payload.nonce_b64 = SecretBox::generate().1[..32].to_string();
        }
        assert!(recorder.open_payload(&entry).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_writes_are_retried() {
        let sink = Arc::new(FlakySink {
            failures: 2,
            calls: AtomicU32::new(0),
            inner: MemoryAuditSink::new(),
        });
        let recorder = AuditRecorder::new(sink.clone(), sealer(), &config(RetryPolicy::default()));

        let id = recorder.record(AuditDraft::new("alice", "list-tools", AuditOutcome::Succeeded));
        recorder.flush().await.unwrap();

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.inner.len().await, 1);
        assert!(!recorder.is_incomplete(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_flag_execution() {
        let sink = Arc::new(FlakySink {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            inner: MemoryAuditSink::new(),
        });
        let policy = RetryPolicy {
            max_retries: 3,
            ..Default::default()
        };
        let recorder = AuditRecorder::new(sink.clone(), sealer(), &config(policy));

        let execution_id = Uuid::new_v4();
        recorder.record(
            AuditDraft::new("alice", "enable-server", AuditOutcome::Succeeded).with_execution(execution_id),
        );
        recorder.flush().await.unwrap();

        assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
        assert!(recorder.is_incomplete(execution_id));
        assert_eq!(recorder.incomplete(), vec![execution_id]);
    }

    fn gated_recorder(retry: RetryPolicy) -> (AuditRecorder, Arc<GatedSink>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Arc::new(GatedSink {
            gate: gate.clone(),
            inner: MemoryAuditSink::new(),
        });
        let config = AuditConfig {
            queue_capacity: 1,
            retry,
            ..AuditConfig::default()
        };
        (AuditRecorder::new(sink.clone(), sealer(), &config), sink, gate)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_does_not_block() {
        let (recorder, sink, gate) = gated_recorder(RetryPolicy::default());

        recorder.record(AuditDraft::new("alice", "list-tools", AuditOutcome::Succeeded));
        tokio::time::sleep(Duration::from_millis(50)).await;
        recorder.record(AuditDraft::new("alice", "list-tools", AuditOutcome::Succeeded));
        let waiting = recorder.record(AuditDraft::new("alice", "list-tools", AuditOutcome::Succeeded));
        assert!(!recorder.is_incomplete(waiting));

        gate.add_permits(10);
        recorder.flush().await.unwrap();

        let sequences: Vec<u64> = sink.inner.entries().await.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(recorder.incomplete().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_waiting_past_deadline_is_flagged() {
        let policy = RetryPolicy::default();
        let (recorder, sink, gate) = gated_recorder(policy.clone());

        recorder.record(AuditDraft::new("alice", "list-tools", AuditOutcome::Succeeded));
        tokio::time::sleep(Duration::from_millis(50)).await;
        recorder.record(AuditDraft::new("alice", "list-tools", AuditOutcome::Succeeded));
        let waiting = recorder.record(AuditDraft::new("alice", "list-tools", AuditOutcome::Succeeded));
        let rejected = recorder.record(AuditDraft::new("alice", "list-tools", AuditOutcome::Succeeded));

        // Only one entry may wait per queue slot
        assert!(recorder.is_incomplete(rejected));
        assert!(!recorder.is_incomplete(waiting));

        tokio::time::sleep(policy.deadline() + Duration::from_millis(10)).await;
        assert!(recorder.is_incomplete(waiting));

        gate.add_permits(10);
        recorder.flush().await.unwrap();
        assert_eq!(sink.inner.len().await, 2);
    }

    #[tokio::test]
    async fn test_incomplete_set_is_bounded_and_drainable() {
        let sink = Arc::new(FlakySink {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            inner: MemoryAuditSink::new(),
        });
        let config = AuditConfig {
            incomplete_capacity: 2,
            retry: RetryPolicy::none(),
            ..AuditConfig::default()
        };
        let recorder = AuditRecorder::new(sink, sealer(), &config);

        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            recorder.record(AuditDraft::new("alice", "enable-server", AuditOutcome::Succeeded).with_execution(*id));
        }
        recorder.flush().await.unwrap();

        assert_eq!(recorder.incomplete(), vec![ids[1], ids[2]]);
        assert!(!recorder.is_incomplete(ids[0]));
        assert_eq!(recorder.drain_incomplete(), vec![ids[1], ids[2]]);
        assert!(recorder.incomplete().is_empty());
        assert!(!recorder.is_incomplete(ids[2]));
    }

    #[tokio::test]
    async fn test_concurrent_records_keep_arrival_order() {
        let sink = MemoryAuditSink::new();
        let recorder = Arc::new(AuditRecorder::new(
            Arc::new(sink.clone()),
            sealer(),
            &config(RetryPolicy::none()),
        ));

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    recorder.record(AuditDraft::new(format!("user-{}", i % 5), "list-tools", AuditOutcome::Succeeded));
                })
            })
            .collect();
        futures::future::join_all(tasks).await;
        recorder.flush().await.unwrap();

        let sequences: Vec<u64> = sink.entries().await.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=50).collect::<Vec<u64>>());
    }
}
