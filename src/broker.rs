use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::correlation::{settlement_of, CorrelationStore, SubmitDisposition, SweepReport};
use crate::error::BrokerError;
use crate::liveness::LivenessTracker;
use crate::scheduler::{Schedule, TimedJob};
use crate::types::{Command, CommandId, CommandResult, ConnectionState, WireResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSettings {
    pub keep_alive_window: Duration,
    pub max_active_lifetime: Duration,
    pub max_result_retention: Duration,
    pub sweep_interval: Duration,
}

impl BrokerSettings {
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        Self {
            keep_alive_window: cfg.keep_alive_window(),
            max_active_lifetime: cfg.max_active_lifetime(),
            max_result_retention: cfg.max_result_retention(),
            sweep_interval: cfg.sweep_interval(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubmitReport {
    pub delivered: usize,
    pub stored: usize,
    pub orphaned: usize,
    pub skipped: usize,
}

impl SubmitReport {
    pub fn accepted(&self) -> usize {
        self.delivered + self.stored + self.orphaned
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSnapshot {
    pub state: ConnectionState,
    pub last_signal_ms: Option<u64>,
    pub pending: usize,
    pub resolved: usize,
    pub waiters: usize,
}

struct BrokerState {
    store: CorrelationStore,
    liveness: LivenessTracker,
}

impl BrokerState {
    fn require_live(&mut self, now: Instant) -> Result<(), BrokerError> {
        match self.liveness.observe(now) {
            ConnectionState::Connected => Ok(()),
            _ => Err(BrokerError::ConnectionExpired),
        }
    }
}

/// Correlates commands issued by local callers with results posted by the
/// polling remote runtime.
///
/// All mutable state sits behind one mutex; each operation below is a
/// single critical section, and `await_result` never holds the lock while
/// suspended.
pub struct CommandBroker {
    settings: BrokerSettings,
    state: Mutex<BrokerState>,
}

impl CommandBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(BrokerState {
                store: CorrelationStore::new(
                    settings.max_active_lifetime,
                    settings.max_result_retention,
                ),
                liveness: LivenessTracker::new(settings.keep_alive_window),
            }),
        }
    }

    pub fn settings(&self) -> BrokerSettings {
        self.settings
    }

    /// Publish a command for the remote runtime. Never fails.
    pub async fn run_command(&self, name: &str, args: Value) -> CommandId {
        let mut command = Command::new(name, args);
        let mut state = self.state.lock().await;
        while state.store.contains(&command.id) {
            warn!("regenerating colliding command id {}", command.id);
            command.id = CommandId::generate();
        }
        let id = command.id.clone();
        if let Err(err) = state.store.put(command) {
            warn!("failed queueing command: {err}");
        }
        debug!("queued command {id} ({name})");
        id
    }

    /// Wait for the result of `id`.
    ///
    /// Returns immediately when a result is already stored. Otherwise the
    /// caller is suspended until the result arrives, the command is
    /// canceled, or the max active lifetime elapses.
    pub async fn await_result(&self, id: &CommandId) -> Result<Value, BrokerError> {
        let (mut receiver, deadline) = {
            let mut state = self.state.lock().await;
            if let Some(result) = state.store.take_result(id) {
                return settlement_of(result);
            }
            if !state.store.is_pending(id) {
                return Err(BrokerError::NotFound(id.clone()));
            }
            let deadline = Instant::now() + self.settings.max_active_lifetime;
            (state.store.register_waiter(id, deadline)?, deadline)
        };

        match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => Err(BrokerError::Canceled(id.clone())),
            Err(_) => {
                let mut state = self.state.lock().await;
                match receiver.try_recv() {
                    // Settled between the deadline firing and taking the lock.
                    Ok(settlement) => settlement,
                    // Still registered: the waiter under `id` is ours.
                    Err(TryRecvError::Empty) => {
                        state.store.release_waiter(id);
                        warn!("command {id} timed out waiting for a result");
                        Err(BrokerError::Timeout(id.clone()))
                    }
                    // Removed without settlement; whatever is under `id` now
                    // belongs to another caller.
                    Err(TryRecvError::Closed) => Err(BrokerError::Timeout(id.clone())),
                }
            }
        }
    }

    pub async fn cancel_command(&self, id: &CommandId) -> bool {
        let canceled = self.state.lock().await.store.cancel(id);
        if canceled {
            info!("canceled command {id}");
        }
        canceled
    }

    /// Record a heartbeat from the remote runtime; returns its timestamp.
    pub async fn signal_liveness(&self) -> u64 {
        self.state.lock().await.liveness.signal(Instant::now())
    }

    /// Pending commands in issue order. Read-only: fetched commands stay
    /// pending until resolved, canceled or swept.
    pub async fn fetch_pending(&self) -> Result<Vec<Command>, BrokerError> {
        let mut state = self.state.lock().await;
        state.require_live(Instant::now())?;
        Ok(state.store.pending_snapshot())
    }

    /// Apply a `{responses: [...]}` submission.
    ///
    /// Entries that do not look like results are skipped; only a body
    /// without a `responses` array fails the whole call.
    pub async fn submit_results(&self, payload: &Value) -> Result<SubmitReport, BrokerError> {
        let mut state = self.state.lock().await;
        state.require_live(Instant::now())?;
        let entries = payload
            .get("responses")
            .and_then(Value::as_array)
            .ok_or(BrokerError::MalformedPayload)?;

        let mut report = SubmitReport::default();
        for entry in entries {
            let parsed = match serde_json::from_value::<WireResult>(entry.clone()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!("skipping malformed result entry: {err}");
                    report.skipped += 1;
                    continue;
                }
            };
            match state.store.submit_result(CommandResult::from_wire(parsed)) {
                SubmitDisposition::Delivered => report.delivered += 1,
                SubmitDisposition::Stored => report.stored += 1,
                SubmitDisposition::Orphaned => report.orphaned += 1,
            }
        }
        debug!(
            "applied {} submitted results ({} skipped)",
            report.accepted(),
            report.skipped
        );
        Ok(report)
    }

    /// Maintenance pass: expire commands, results and waiters, then
    /// re-derive liveness.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let report = state.store.sweep(now);
        state.liveness.observe(now);
        if !report.is_empty() {
            debug!("sweep: {report:?}");
        }
        report
    }

    pub async fn connection_state(&self) -> ConnectionState {
        let state = self.state.lock().await;
        derived_state(&state.liveness)
    }

    pub async fn snapshot(&self) -> BrokerSnapshot {
        let state = self.state.lock().await;
        let counts = state.store.counts();
        BrokerSnapshot {
            state: derived_state(&state.liveness),
            last_signal_ms: state.liveness.last_signal_ms(),
            pending: counts.pending,
            resolved: counts.resolved,
            waiters: counts.waiters,
        }
    }
}

fn derived_state(liveness: &LivenessTracker) -> ConnectionState {
    if liveness.is_live_at(Instant::now()) {
        ConnectionState::Connected
    } else {
        ConnectionState::Disconnected
    }
}

/// Start the periodic sweep for `broker`. Dropping the job stops it.
pub fn spawn_sweeper(broker: Arc<CommandBroker>) -> TimedJob {
    let interval = broker.settings().sweep_interval;
    let mut job = TimedJob::new("broker-sweep", Schedule::Every(interval), move || {
        let broker = broker.clone();
        async move {
            broker.sweep().await;
        }
    });
    job.start();
    job
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::{spawn_sweeper, BrokerSettings, CommandBroker};
    use crate::error::BrokerError;
    use crate::types::{CommandId, ConnectionState};

    fn broker() -> Arc<CommandBroker> {
        Arc::new(CommandBroker::new(BrokerSettings::default()))
    }

    async fn wait_for_waiter(broker: &CommandBroker) {
        for _ in 0..1_000 {
            if broker.snapshot().await.waiters > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("waiter never registered");
    }

    #[tokio::test]
    async fn issued_ids_are_unique() {
        let broker = broker();
        let mut ids = HashSet::new();
        for _ in 0..500 {
            assert!(ids.insert(broker.run_command("echo", json!({})).await));
        }
        assert_eq!(broker.snapshot().await.pending, 500);
    }

    #[tokio::test]
    async fn fetched_command_resolves_outstanding_await() {
        let broker = broker();
        let id = broker.run_command("echo", json!({ "v": 1 })).await;
        let waiting = {
            let broker = broker.clone();
            let id = id.clone();
            tokio::spawn(async move { broker.await_result(&id).await })
        };
        wait_for_waiter(&broker).await;

        broker.signal_liveness().await;
        let fetched = broker.fetch_pending().await.expect("live connection");
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, id);
        assert_eq!(fetched[0].name, "echo");
        assert_eq!(fetched[0].args, json!({ "v": 1 }));

        let report = broker
            .submit_results(&json!({ "responses": [{ "id": id, "result": { "v": 1 } }] }))
            .await
            .expect("submit");
        assert_eq!(report.delivered, 1);
        assert_eq!(waiting.await.expect("join"), Ok(json!({ "v": 1 })));

        let snapshot = broker.snapshot().await;
        assert_eq!((snapshot.pending, snapshot.resolved, snapshot.waiters), (0, 0, 0));
        assert_eq!(
            broker.await_result(&id).await,
            Err(BrokerError::NotFound(id.clone()))
        );
    }

    #[tokio::test]
    async fn error_submitted_before_await_is_returned_immediately() {
        let broker = broker();
        let id = broker.run_command("echo", json!({})).await;
        broker.signal_liveness().await;
        broker
            .submit_results(&json!({ "responses": [{ "id": id, "result": null, "error": "boom" }] }))
            .await
            .expect("submit");

        assert_eq!(
            broker.await_result(&id).await,
            Err(BrokerError::CommandFailed("boom".to_owned()))
        );
    }

    #[tokio::test]
    async fn fetch_is_a_repeatable_snapshot_in_issue_order() {
        let broker = broker();
        let first = broker.run_command("a", json!(1)).await;
        let second = broker.run_command("b", json!(2)).await;
        broker.signal_liveness().await;

        let once = broker.fetch_pending().await.expect("fetch");
        let twice = broker.fetch_pending().await.expect("fetch");
        let ids = |rows: &[crate::types::Command]| {
            rows.iter().map(|row| row.id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&once), vec![first.clone(), second.clone()]);
        assert_eq!(ids(&twice), vec![first, second]);
    }

    #[tokio::test]
    async fn second_concurrent_await_fails() {
        let broker = broker();
        let id = broker.run_command("echo", json!({})).await;
        let first = {
            let broker = broker.clone();
            let id = id.clone();
            tokio::spawn(async move { broker.await_result(&id).await })
        };
        wait_for_waiter(&broker).await;

        assert_eq!(
            broker.await_result(&id).await,
            Err(BrokerError::AlreadyAwaiting(id.clone()))
        );

        assert!(broker.cancel_command(&id).await);
        assert_eq!(first.await.expect("join"), Err(BrokerError::Canceled(id)));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let broker = broker();
        let id = CommandId::from("missing");
        assert_eq!(broker.await_result(&id).await, Err(BrokerError::NotFound(id)));
    }

    #[tokio::test]
    async fn cancel_rejects_waiter_and_second_cancel_is_false() {
        let broker = broker();
        let id = broker.run_command("echo", json!({})).await;
        let waiting = {
            let broker = broker.clone();
            let id = id.clone();
            tokio::spawn(async move { broker.await_result(&id).await })
        };
        wait_for_waiter(&broker).await;

        assert!(broker.cancel_command(&id).await);
        assert_eq!(
            waiting.await.expect("join"),
            Err(BrokerError::Canceled(id.clone()))
        );
        assert!(!broker.cancel_command(&id).await);
        assert_eq!(broker.snapshot().await.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_command_times_out_and_is_swept() {
        let broker = broker();
        let id = broker.run_command("echo", json!({})).await;

        assert_eq!(
            broker.await_result(&id).await,
            Err(BrokerError::Timeout(id.clone()))
        );
        tokio::time::advance(Duration::from_millis(1)).await;

        let report = broker.sweep().await;
        assert_eq!(report.expired_commands, 1);
        assert_eq!(broker.snapshot().await.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_caller_leaves_a_newer_waiter_alone() {
        let broker = broker();
        let id = broker.run_command("echo", json!({})).await;
        let first = {
            let broker = broker.clone();
            let id = id.clone();
            tokio::spawn(async move { broker.await_result(&id).await })
        };
        wait_for_waiter(&broker).await;

        // The first caller's deadline fires while a sweep holds the lock; the
        // sweep settles it and a second caller registers before it resumes.
        let mut guard = broker.state.lock().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let now = tokio::time::Instant::now();
        let report = guard.store.sweep(now);
        assert_eq!(report.expired_waiters, 1);
        assert_eq!(report.expired_commands, 0);
        let mut second = guard
            .store
            .register_waiter(&id, now + Duration::from_secs(30))
            .expect("pending command accepts a new waiter");
        drop(guard);

        assert_eq!(
            first.await.expect("join"),
            Err(BrokerError::Timeout(id.clone()))
        );
        assert_eq!(broker.snapshot().await.waiters, 1);
        assert!(matches!(
            second.try_recv(),
            Err(tokio::sync::oneshot::error::TryRecvError::Empty)
        ));

        broker.signal_liveness().await;
        broker
            .submit_results(&json!({ "responses": [{ "id": id, "result": "late" }] }))
            .await
            .expect("submit");
        assert_eq!(second.try_recv(), Ok(Ok(json!("late"))));
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_after_timeout_is_kept_as_orphan() {
        let broker = broker();
        let id = broker.run_command("echo", json!({})).await;
        assert!(matches!(
            broker.await_result(&id).await,
            Err(BrokerError::Timeout(_))
        ));

        broker.signal_liveness().await;
        let report = broker
            .submit_results(&json!({ "responses": [{ "id": id, "result": "late" }] }))
            .await
            .expect("submit");
        assert_eq!(report.accepted(), 1);
        assert_eq!(broker.await_result(&id).await, Ok(json!("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_result_is_purged_after_retention() {
        let broker = broker();
        let id = broker.run_command("echo", json!({})).await;
        broker.signal_liveness().await;
        broker
            .submit_results(&json!({ "responses": [{ "id": id, "result": 1 }] }))
            .await
            .expect("submit");

        tokio::time::advance(Duration::from_secs(301)).await;
        let report = broker.sweep().await;
        assert_eq!(report.purged_results, 1);
        assert_eq!(broker.await_result(&id).await, Err(BrokerError::NotFound(id)));
    }

    #[tokio::test]
    async fn never_signaled_connection_rejects_fetch_and_submit() {
        let broker = broker();
        let id = broker.run_command("echo", json!({})).await;

        assert_eq!(
            broker.fetch_pending().await.err(),
            Some(BrokerError::ConnectionExpired)
        );
        assert_eq!(
            broker
                .submit_results(&json!({ "responses": [{ "id": id, "result": 1 }] }))
                .await,
            Err(BrokerError::ConnectionExpired)
        );
        let snapshot = broker.snapshot().await;
        assert_eq!((snapshot.pending, snapshot.resolved), (1, 0));
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_connection_leaves_maps_unchanged() {
        let broker = broker();
        let id = broker.run_command("echo", json!({})).await;
        broker.signal_liveness().await;
        assert_eq!(broker.connection_state().await, ConnectionState::Connected);

        tokio::time::advance(Duration::from_millis(5_001)).await;
        let before = broker.snapshot().await;
        assert_eq!(
            broker
                .submit_results(&json!({ "responses": [{ "id": id, "result": 1 }] }))
                .await,
            Err(BrokerError::ConnectionExpired)
        );
        assert_eq!(
            broker.fetch_pending().await.err(),
            Some(BrokerError::ConnectionExpired)
        );
        let after = broker.snapshot().await;
        assert_eq!(before, after);
        assert_eq!(after.state, ConnectionState::Disconnected);

        broker.signal_liveness().await;
        assert_eq!(broker.fetch_pending().await.expect("fresh signal").len(), 1);
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped_individually() {
        let broker = broker();
        let id = broker.run_command("echo", json!({})).await;
        broker.signal_liveness().await;

        let report = broker
            .submit_results(&json!({
                "responses": [
                    { "nope": true },
                    5,
                    { "id": id, "result": "ok" }
                ]
            }))
            .await
            .expect("submit");
        assert_eq!(report.skipped, 2);
        assert_eq!(report.accepted(), 1);
        assert_eq!(broker.await_result(&id).await, Ok(json!("ok")));
    }

    #[tokio::test]
    async fn body_without_responses_array_is_malformed() {
        let broker = broker();
        broker.signal_liveness().await;
        for body in [json!({}), json!({ "responses": "x" }), Value::Null, json!([1])] {
            assert_eq!(
                broker.submit_results(&body).await,
                Err(BrokerError::MalformedPayload)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_moves_connected_to_disconnected() {
        let broker = broker();
        broker.signal_liveness().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        broker.sweep().await;
        let snapshot = broker.snapshot().await;
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(snapshot.last_signal_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_expires_commands_without_traffic() {
        let broker = Arc::new(CommandBroker::new(BrokerSettings {
            keep_alive_window: Duration::from_secs(5),
            max_active_lifetime: Duration::from_secs(1),
            max_result_retention: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(200),
        }));
        let _sweeper = spawn_sweeper(broker.clone());
        broker.run_command("echo", json!({})).await;

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(broker.snapshot().await.pending, 0);
    }
}
