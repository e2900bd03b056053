//! The get-read-version pipeline.
//!
//! Intake queues requests by priority and arms a dynamic batch timer. The
//! starter loop drains the queues highest-priority-first under rate
//! admission, asks the master for the live committed version once per
//! causal-risk group, and fans replies back out with throttle hints. Side
//! loops keep the rate lease fresh, confirm epoch liveness, and refresh the
//! shard-size hint from the data distributor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vellum_core::interfaces::{DataDistributorClient, LogSystemClient, MasterClient, RateKeeperClient};
use vellum_core::messages::{
    GetHealthMetricsRequest, GetRateInfoRequest, GetReadVersionReply, GetReadVersionRequest,
    HealthMetrics,
};
use vellum_core::time::now_seconds;
use vellum_core::types::{TransactionPriority, Version};
use vellum_core::{Notified, ProxyError};

use crate::knobs::Knobs;
use crate::rate::GrvTransactionRateInfo;
use crate::stats::{add, bump, GrvProxyStats};
use crate::throttle::{TagThrottleState, TransactionTagCounter};
use crate::util::delay_jittered;

pub struct GrvProxyConfig {
    pub id: u64,
    pub knobs: Arc<Knobs>,
    /// Peer GRV servers sharing the aggregate batch rate.
    pub grv_proxy_count: usize,
}

/// Shared server state for the GRV role.
pub struct GrvProxyData {
    pub id: u64,
    pub knobs: Arc<Knobs>,
    master: Arc<dyn MasterClient>,
    log_system: Arc<dyn LogSystemClient>,
    pub stats: GrvProxyStats,
    last_start_commit: Mutex<f64>,
    last_commit_latency: Mutex<f64>,
    update_commit_requests: AtomicI64,
    /// Start time of the most recent confirmed epoch-live round trip.
    last_commit_time: Notified<f64>,
    min_known_committed_version: AtomicI64,
}

impl GrvProxyData {
    pub fn min_known_committed_version(&self) -> Version {
        self.min_known_committed_version.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct PriorityQueues {
    system: VecDeque<GetReadVersionRequest>,
    default: VecDeque<GetReadVersionRequest>,
    batch: VecDeque<GetReadVersionRequest>,
}

impl PriorityQueues {
    fn all_empty(&self) -> bool {
        self.system.is_empty() && self.default.is_empty() && self.batch.is_empty()
    }
}

struct BatchTimerState {
    grv_batch_time: f64,
    last_grv_time: f64,
}

#[derive(Default)]
struct TransactionCounts {
    total: AtomicI64,
    batch: AtomicI64,
}

#[derive(Clone, Copy, Default)]
struct HealthState {
    basic: HealthMetrics,
    detailed: HealthMetrics,
}

pub struct GrvProxyHandle {
    pub requests: mpsc::UnboundedSender<GetReadVersionRequest>,
    pub health_requests: mpsc::UnboundedSender<GetHealthMetricsRequest>,
    pub data: Arc<GrvProxyData>,
    tasks: Vec<JoinHandle<()>>,
}

impl GrvProxyHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for GrvProxyHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wire up and start every task of one GRV server.
pub fn spawn_grv_proxy(
    config: GrvProxyConfig,
    master: Arc<dyn MasterClient>,
    log_system: Arc<dyn LogSystemClient>,
    rate_keeper: Arc<dyn RateKeeperClient>,
    data_distributor: Arc<dyn DataDistributorClient>,
) -> GrvProxyHandle {
    let knobs = config.knobs.clone();
    let data = Arc::new(GrvProxyData {
        id: config.id,
        knobs: knobs.clone(),
        master,
        log_system,
        stats: GrvProxyStats::default(),
        last_start_commit: Mutex::new(0.0),
        last_commit_latency: Mutex::new(knobs.required_min_recovery_duration),
        update_commit_requests: AtomicI64::new(0),
        last_commit_time: Notified::new(0.0),
        min_known_committed_version: AtomicI64::new(0),
    });

    let queues = Arc::new(Mutex::new(PriorityQueues::default()));
    let batch_state = Arc::new(Mutex::new(BatchTimerState {
        grv_batch_time: knobs.start_transaction_batch_interval_min,
        last_grv_time: 0.0,
    }));
    let counts = Arc::new(TransactionCounts::default());
    let tag_counter = Arc::new(Mutex::new(TransactionTagCounter::default()));
    let throttles = Arc::new(Mutex::new(TagThrottleState::default()));
    let health = Arc::new(Mutex::new(HealthState::default()));
    let mid_shard_size = Arc::new(AtomicI64::new(knobs.min_shard_bytes));

    let window = knobs.start_transaction_rate_window;
    let empty_budget = knobs.start_transaction_max_empty_queue_budget;
    let max_start = knobs.start_transaction_max_transactions_to_start;
    let normal_rate = Arc::new(Mutex::new(GrvTransactionRateInfo::new(
        10.0,
        window,
        empty_budget,
        max_start,
    )));
    let batch_rate = Arc::new(Mutex::new(GrvTransactionRateInfo::new(
        0.0,
        window,
        empty_budget,
        max_start,
    )));

    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (health_tx, health_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::channel(1);
    let (latency_tx, latency_rx) = mpsc::unbounded_channel();

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(intake_loop(
        data.clone(),
        queues.clone(),
        batch_state.clone(),
        timer_tx.clone(),
        requests_rx,
        latency_rx,
        batch_rate.clone(),
        tag_counter.clone(),
        config.grv_proxy_count,
    )));
    tasks.push(tokio::spawn(starter_loop(
        data.clone(),
        queues.clone(),
        batch_state,
        timer_rx,
        timer_tx,
        normal_rate.clone(),
        batch_rate.clone(),
        counts.clone(),
        throttles.clone(),
        latency_tx,
        mid_shard_size.clone(),
    )));
    tasks.push(tokio::spawn(rate_update_loop(
        data.clone(),
        rate_keeper,
        normal_rate,
        batch_rate,
        tag_counter,
        throttles,
        counts,
        health.clone(),
    )));
    tasks.push(tokio::spawn(health_metrics_server(health, health_rx)));
    tasks.push(tokio::spawn(monitor_dd_metrics(
        data.clone(),
        data_distributor,
        mid_shard_size,
    )));
    if knobs.required_min_recovery_duration > 0.0 {
        tasks.push(tokio::spawn(last_commit_updater(data.clone())));
    }

    GrvProxyHandle {
        requests: requests_tx,
        health_requests: health_tx,
        data,
        tasks,
    }
}

/// Arm the GRV timer to fire once after `delay` seconds.
fn arm_timer(timer_tx: &mpsc::Sender<()>, delay: f64) {
    let timer_tx = timer_tx.clone();
    tokio::spawn(async move {
        delay_jittered(delay).await;
        let _ = timer_tx.try_send(());
    });
}

#[allow(clippy::too_many_arguments)]
async fn intake_loop(
    data: Arc<GrvProxyData>,
    queues: Arc<Mutex<PriorityQueues>>,
    batch_state: Arc<Mutex<BatchTimerState>>,
    timer_tx: mpsc::Sender<()>,
    mut requests_rx: mpsc::UnboundedReceiver<GetReadVersionRequest>,
    mut latency_rx: mpsc::UnboundedReceiver<f64>,
    batch_rate: Arc<Mutex<GrvTransactionRateInfo>>,
    tag_counter: Arc<Mutex<TransactionTagCounter>>,
    grv_proxy_count: usize,
) {
    let knobs = &data.knobs;
    loop {
        tokio::select! {
            maybe_req = requests_rx.recv() => {
                let Some(req) = maybe_req else { break };
                if data.stats.requests_in_flight() > knobs.start_transaction_max_queue_size {
                    bump(&data.stats.txn_request_errors);
                    // Soft overflow signal: an unreadable version with the
                    // locked flag set keeps old clients retrying instead of
                    // failing outright.
                    let _ = req.reply.send(Ok(GetReadVersionReply {
                        version: 1,
                        locked: true,
                        ..Default::default()
                    }));
                    tracing::warn!(id = data.id, "read version queue threshold exceeded");
                    continue;
                }

                tag_counter.lock().record(&req.tags);

                {
                    let mut q = queues.lock();
                    if q.all_empty() {
                        let bs = batch_state.lock();
                        let remaining =
                            (bs.grv_batch_time - (now_seconds() - bs.last_grv_time)).max(0.0);
                        arm_timer(&timer_tx, remaining);
                    }
                    bump(&data.stats.txn_request_in);
                    add(&data.stats.txn_start_in, req.transaction_count as u64);
                    match req.priority {
                        TransactionPriority::Immediate => {
                            add(&data.stats.txn_system_priority_start_in, req.transaction_count as u64);
                            q.system.push_back(req);
                        }
                        TransactionPriority::Default => {
                            add(&data.stats.txn_default_priority_start_in, req.transaction_count as u64);
                            q.default.push_back(req);
                        }
                        TransactionPriority::Batch => {
                            // Pre-reject when the aggregate batch rate split
                            // across the peer set cannot cover even one
                            // transaction per second here.
                            let share = 1.0 / grv_proxy_count.max(1) as f64;
                            if batch_rate.lock().rate <= share {
                                add(&data.stats.txn_throttled, req.transaction_count as u64);
                                bump(&data.stats.txn_request_out);
                                let _ = req.reply.send(Err(ProxyError::BatchTransactionThrottled));
                            } else {
                                add(&data.stats.txn_batch_priority_start_in, req.transaction_count as u64);
                                q.batch.push_back(req);
                            }
                        }
                    }
                }
            }
            Some(reply_latency) = latency_rx.recv() => {
                // Dynamic batching: chase a fraction of the observed default
                // priority reply latency.
                let target = reply_latency * knobs.start_transaction_batch_interval_latency_fraction;
                let alpha = knobs.start_transaction_batch_interval_smoother_alpha;
                let mut bs = batch_state.lock();
                bs.grv_batch_time = (target * alpha + bs.grv_batch_time * (1.0 - alpha))
                    .clamp(
                        knobs.start_transaction_batch_interval_min,
                        knobs.start_transaction_batch_interval_max,
                    );
            }
        }
    }
}

#[derive(Clone, Copy, Default)]
struct GroupCounts {
    transactions: i64,
    system: i64,
    default: i64,
    batch: i64,
}

#[allow(clippy::too_many_arguments)]
async fn starter_loop(
    data: Arc<GrvProxyData>,
    queues: Arc<Mutex<PriorityQueues>>,
    batch_state: Arc<Mutex<BatchTimerState>>,
    mut timer_rx: mpsc::Receiver<()>,
    timer_tx: mpsc::Sender<()>,
    normal_rate: Arc<Mutex<GrvTransactionRateInfo>>,
    batch_rate: Arc<Mutex<GrvTransactionRateInfo>>,
    counts: Arc<TransactionCounts>,
    throttles: Arc<Mutex<TagThrottleState>>,
    latency_tx: mpsc::UnboundedSender<f64>,
    mid_shard_size: Arc<AtomicI64>,
) {
    let knobs = data.knobs.clone();
    while timer_rx.recv().await.is_some() {
        let t = now_seconds();
        let mut elapsed;
        {
            let mut bs = batch_state.lock();
            elapsed = t - bs.last_grv_time;
            bs.last_grv_time = t;
        }
        if elapsed == 0.0 {
            // Avoid an indeterminate multiply against an infinite rate.
            elapsed = 1e-15;
        }

        normal_rate.lock().reset(t);
        batch_rate.lock().reset(t);

        // Index 0 holds requests that must confirm epoch liveness; index 1
        // holds the causal-read-risky group.
        let mut start: [Vec<GetReadVersionRequest>; 2] = [Vec::new(), Vec::new()];
        let mut started = [GroupCounts::default(), GroupCounts::default()];

        let (system_empty, default_empty, batch_empty) = {
            let mut q = queues.lock();
            let mut requests_started = 0;
            while requests_started < knobs.start_transaction_max_requests_to_start {
                let queue = if !q.system.is_empty() {
                    &mut q.system
                } else if !q.default.is_empty() {
                    &mut q.default
                } else if !q.batch.is_empty() {
                    &mut q.batch
                } else {
                    break;
                };

                let total_started = started[0].transactions + started[1].transactions;
                let (priority, tc) = {
                    let front = queue.front().expect("queue checked non-empty");
                    (front.priority, front.transaction_count)
                };
                if priority < TransactionPriority::Default {
                    if !batch_rate.lock().can_start(total_started, tc) {
                        break;
                    }
                } else if priority < TransactionPriority::Immediate
                    && !normal_rate.lock().can_start(total_started, tc)
                {
                    break;
                }

                let req = queue.pop_front().expect("front inspected above");
                let group = usize::from(req.causal_read_risky);
                started[group].transactions += tc;
                match priority {
                    TransactionPriority::Immediate => started[group].system += tc,
                    TransactionPriority::Default => started[group].default += tc,
                    TransactionPriority::Batch => started[group].batch += tc,
                }
                start[group].push(req);
                requests_started += 1;
            }
            (q.system.is_empty(), q.default.is_empty(), q.batch.is_empty())
        };

        if !(system_empty && default_empty && batch_empty) {
            arm_timer(&timer_tx, knobs.start_transaction_batch_queue_check_interval);
        }

        let normal_started = started[0].system + started[1].system + started[0].default + started[1].default;
        let batch_started = started[0].batch + started[1].batch;
        counts
            .total
            .fetch_add(started[0].transactions + started[1].transactions, Ordering::Relaxed);
        counts.batch.fetch_add(batch_started, Ordering::Relaxed);

        normal_rate
            .lock()
            .update_budget(normal_started, system_empty && default_empty, elapsed, t);
        batch_rate.lock().update_budget(
            normal_started + batch_started,
            system_empty && default_empty && batch_empty,
            elapsed,
            t,
        );

        for (group, requests) in start.into_iter().enumerate() {
            if requests.is_empty() {
                continue;
            }
            let data = data.clone();
            let throttles = throttles.clone();
            let latency_tx = latency_tx.clone();
            let mid_shard_size = mid_shard_size.clone();
            let group_counts = started[group];
            tokio::spawn(async move {
                let request_time = now_seconds();
                match get_live_committed_version(&data, group == 1, &group_counts).await {
                    Ok(reply) => {
                        if group == 0 {
                            let _ = latency_tx.send(now_seconds() - request_time);
                        }
                        send_grv_replies(&data, reply, requests, &throttles, &mid_shard_size);
                    }
                    Err(err) => {
                        tracing::error!(id = data.id, error = %err, "read version batch failed");
                        for req in requests {
                            bump(&data.stats.txn_request_out);
                            let _ = req.reply.send(Err(err.clone()));
                        }
                    }
                }
            });
        }
    }
}

/// Returns a version that is committed and visible to every prior commit
/// acknowledged anywhere, by pairing the master's answer with an epoch-live
/// confirmation requested no earlier than the version request.
async fn get_live_committed_version(
    data: &Arc<GrvProxyData>,
    causal_read_risky: bool,
    started: &GroupCounts,
) -> Result<GetReadVersionReply, ProxyError> {
    let knobs = &data.knobs;
    bump(&data.stats.txn_start_batch);

    let master = data.master.clone();
    let version_request = tokio::spawn(async move { master.get_live_committed_version().await });

    if !knobs.always_causal_read_risky && !causal_read_risky {
        update_last_commit(data)
            .await
            .map_err(|_| ProxyError::MasterTlogFailed)?;
    } else if knobs.required_min_recovery_duration > 0.0
        && now_seconds() - knobs.required_min_recovery_duration > data.last_commit_time.get()
    {
        data.last_commit_time
            .when_at_least(now_seconds() - knobs.required_min_recovery_duration)
            .await;
    }

    let rep = version_request
        .await
        .map_err(|_| ProxyError::MasterTlogFailed)?
        .map_err(|_| ProxyError::MasterTlogFailed)?;

    data.min_known_committed_version
        .fetch_max(rep.min_known_committed_version, Ordering::Relaxed);

    add(&data.stats.txn_start_out, started.transactions as u64);
    add(&data.stats.txn_system_priority_start_out, started.system as u64);
    add(&data.stats.txn_default_priority_start_out, started.default as u64);
    add(&data.stats.txn_batch_priority_start_out, started.batch as u64);

    Ok(GetReadVersionReply {
        version: rep.version,
        locked: rep.locked,
        metadata_version: rep.metadata_version,
        mid_shard_size: 0,
        tag_throttle_info: Default::default(),
    })
}

fn send_grv_replies(
    data: &Arc<GrvProxyData>,
    base: GetReadVersionReply,
    requests: Vec<GetReadVersionRequest>,
    throttles: &Arc<Mutex<TagThrottleState>>,
    mid_shard_size: &Arc<AtomicI64>,
) {
    let min_known = data.min_known_committed_version();
    let now = now_seconds();
    for req in requests {
        let mut reply = base.clone();
        if req.use_min_known_committed_version {
            // Only backup workers ask for this; they want durability, not
            // freshness.
            reply.version = min_known;
        }
        reply.mid_shard_size = mid_shard_size.load(Ordering::Relaxed);
        if !req.tags.is_empty() {
            reply.tag_throttle_info = throttles.lock().throttles_for(req.priority, &req.tags, now);
        }
        bump(&data.stats.txn_request_out);
        let _ = req.reply.send(Ok(reply));
    }
}

/// One epoch-live confirmation round trip, recording its latency and
/// completion time.
async fn update_last_commit(data: &Arc<GrvProxyData>) -> anyhow::Result<()> {
    let confirm_start = now_seconds();
    *data.last_start_commit.lock() = confirm_start;
    data.update_commit_requests.fetch_add(1, Ordering::Relaxed);
    let result = data.log_system.confirm_epoch_live().await;
    data.update_commit_requests.fetch_sub(1, Ordering::Relaxed);
    result?;
    *data.last_commit_latency.lock() = now_seconds() - confirm_start;
    data.last_commit_time.set(confirm_start);
    Ok(())
}

/// Keeps epoch-live confirmations flowing often enough that non-risky GRV
/// requests rarely have to wait for one inline.
async fn last_commit_updater(data: Arc<GrvProxyData>) {
    let knobs = data.knobs.clone();
    loop {
        let latency = *data.last_commit_latency.lock();
        let interval = knobs
            .min_confirm_interval
            .max((knobs.required_min_recovery_duration - latency) / 2.0);
        let elapsed = now_seconds() - *data.last_start_commit.lock();
        if elapsed < interval {
            tokio::time::sleep(Duration::from_secs_f64(interval + 0.0001 - elapsed)).await;
        } else if data.update_commit_requests.load(Ordering::Relaxed) < knobs.max_commit_updates {
            let data = data.clone();
            tokio::spawn(async move {
                if let Err(err) = update_last_commit(&data).await {
                    tracing::warn!(id = data.id, error = ?err, "epoch live confirmation failed");
                }
            });
        } else {
            tracing::warn!(id = data.id, "too many outstanding epoch live confirmations");
            *data.last_start_commit.lock() = now_seconds();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn rate_update_loop(
    data: Arc<GrvProxyData>,
    rate_keeper: Arc<dyn RateKeeperClient>,
    normal_rate: Arc<Mutex<GrvTransactionRateInfo>>,
    batch_rate: Arc<Mutex<GrvTransactionRateInfo>>,
    tag_counter: Arc<Mutex<TransactionTagCounter>>,
    throttles: Arc<Mutex<TagThrottleState>>,
    counts: Arc<TransactionCounts>,
    health: Arc<Mutex<HealthState>>,
) {
    let knobs = data.knobs.clone();
    let mut last_detailed_reply = 0.0f64;
    let mut lease_deadline = 0.0f64;
    let mut lease_expired_logged = false;
    loop {
        let detailed = now_seconds() - last_detailed_reply > knobs.detailed_metric_update_rate;

        // Only report counts for tags the rate keeper is actively tracking;
        // the rest of the counter restarts from zero either way.
        let tag_counts = {
            let tracked = throttles.lock().tracked_tags();
            let mut all = tag_counter.lock().take();
            tracked
                .into_iter()
                .filter_map(|tag| all.remove(&tag).map(|count| (tag, count)))
                .collect()
        };

        let request = GetRateInfoRequest {
            proxy_id: data.id,
            total_released_transactions: counts.total.load(Ordering::Relaxed),
            batch_released_transactions: counts.batch.load(Ordering::Relaxed),
            tag_counts,
            detailed,
        };

        let patience = (lease_deadline - now_seconds()).max(0.5);
        let outcome = tokio::time::timeout(
            Duration::from_secs_f64(patience),
            rate_keeper.get_rate_info(request),
        )
        .await;

        match outcome {
            Ok(Ok(rep)) => {
                let now = now_seconds();
                normal_rate.lock().set_rate(rep.transaction_rate, now);
                batch_rate.lock().set_rate(rep.batch_transaction_rate, now);
                if let Some(throttled) = rep.throttled_tags {
                    // Wholesale replacement means no expiry bookkeeping here.
                    throttles.lock().replace(throttled);
                }
                {
                    let mut h = health.lock();
                    h.basic.update(&rep.health_metrics, false);
                    if detailed {
                        h.detailed.update(&rep.health_metrics, true);
                        last_detailed_reply = now;
                    }
                }
                lease_deadline = now + rep.lease_duration;
                lease_expired_logged = false;
                delay_jittered(rep.lease_duration / 2.0).await;
            }
            Ok(Err(err)) => {
                tracing::warn!(id = data.id, error = ?err, "rate keeper request failed");
                expire_lease_if_due(&data, lease_deadline, &normal_rate, &batch_rate, &mut lease_expired_logged);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(_) => {
                expire_lease_if_due(&data, lease_deadline, &normal_rate, &batch_rate, &mut lease_expired_logged);
            }
        }
    }
}

fn expire_lease_if_due(
    data: &Arc<GrvProxyData>,
    lease_deadline: f64,
    normal_rate: &Arc<Mutex<GrvTransactionRateInfo>>,
    batch_rate: &Arc<Mutex<GrvTransactionRateInfo>>,
    logged: &mut bool,
) {
    if now_seconds() >= lease_deadline {
        normal_rate.lock().disable();
        batch_rate.lock().disable();
        if !*logged {
            tracing::warn!(id = data.id, "rate lease expired");
            *logged = true;
        }
    }
}

async fn health_metrics_server(
    health: Arc<Mutex<HealthState>>,
    mut requests: mpsc::UnboundedReceiver<GetHealthMetricsRequest>,
) {
    while let Some(req) = requests.recv().await {
        let state = *health.lock();
        let _ = req.reply.send(if req.detailed { state.detailed } else { state.basic });
    }
}

/// Keeps the average shard size hint fresh for client range-split heuristics.
async fn monitor_dd_metrics(
    data: Arc<GrvProxyData>,
    data_distributor: Arc<dyn DataDistributorClient>,
    mid_shard_size: Arc<AtomicI64>,
) {
    let knobs = data.knobs.clone();
    loop {
        match data_distributor
            .get_metrics(vellum_core::keys::normal_keys(), usize::MAX)
            .await
        {
            Ok(reply) => {
                if let Some(size) = reply.mid_shard_size {
                    mid_shard_size.store(size, Ordering::Relaxed);
                }
            }
            Err(err) => {
                tracing::warn!(id = data.id, error = ?err, "shard size refresh failed");
            }
        }
        tokio::time::sleep(Duration::from_secs_f64(knobs.mid_shard_size_max_staleness)).await;
    }
}
