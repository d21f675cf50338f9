//! Checker coordination
//!
//! One coordinator per replica owns the pending queue, the worker pool,
//! and three service loops: instance discovery, lease renewal, and
//! lifecycle inspection. Replicas share nothing but the KV; exclusive
//! ownership of an instance's check rests entirely on the job record
//! lease.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accessor::AccessorFactory;
use crate::checker::filter::InstanceFilter;
use crate::checker::instance::InstanceChecker;
use crate::checker::jobs::{
    self, finish_instance_check_job, lease_instance_check_job, prepare_instance_check_job,
    LeaseOutcome,
};
use crate::checker::lifecycle::LifecycleInspector;
use crate::checker::CheckOutcome;
use crate::config::CheckerConfig;
use crate::error::Result;
use crate::kv::TxnKv;
use crate::metrics::metrics;
use crate::model::{InstanceInfo, InstanceStatus};
use crate::now_ms;

/// What a worker does after finishing one instance.
#[derive(Debug, PartialEq, Eq)]
enum WorkerSignal {
    Continue,
    /// Terminal failure; the worker exits and the lease is left to
    /// expire so another replica retries.
    Exit,
}

struct CoordinatorState {
    pending_queue: VecDeque<InstanceInfo>,
    pending_map: HashMap<String, i64>,
    working_map: HashMap<String, Arc<InstanceChecker>>,
}

/// Runs the checker side of one replica.
pub struct CheckerCoordinator {
    kv: Arc<dyn TxnKv>,
    factory: Arc<dyn AccessorFactory>,
    config: CheckerConfig,
    filter: InstanceFilter,
    inspector: LifecycleInspector,
    state: Mutex<CoordinatorState>,
    queue_notify: Notify,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CheckerCoordinator {
    pub fn new(
        kv: Arc<dyn TxnKv>,
        factory: Arc<dyn AccessorFactory>,
        config: CheckerConfig,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(crate::error::ParallaxError::Config)?;

        let filter = InstanceFilter::new(&config.recycle_whitelist, &config.recycle_blacklist);
        let inspector = LifecycleInspector::new(
            kv.clone(),
            factory.clone(),
            config.reserved_buffer_days,
        );

        Ok(Arc::new(Self {
            kv,
            factory,
            config,
            filter,
            inspector,
            state: Mutex::new(CoordinatorState {
                pending_queue: VecDeque::new(),
                pending_map: HashMap::new(),
                working_map: HashMap::new(),
            }),
            queue_notify: Notify::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the scanner, lease, inspector, and worker tasks.
    pub fn start(self: &Arc<Self>) {
        info!(
            workers = self.config.recycle_concurrency,
            endpoint = %self.config.owner_endpoint,
            "starting checker coordinator"
        );
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(self.clone().scan_instances_loop()));
        tasks.push(tokio::spawn(self.clone().lease_loop()));
        tasks.push(tokio::spawn(self.clone().inspect_loop()));
        for _ in 0..self.config.recycle_concurrency {
            tasks.push(tokio::spawn(self.clone().worker_loop()));
        }
    }

    /// Stop every loop, signal running checkers, and join all tasks.
    /// No KV writes happen after this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.queue_notify.notify_waiters();
        {
            let state = self.state.lock().unwrap();
            for checker in state.working_map.values() {
                checker.stop();
            }
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Instances currently being checked by this replica.
    pub fn working_instances(&self) -> Vec<String> {
        self.state.lock().unwrap().working_map.keys().cloned().collect()
    }

    /// Instances queued but not yet picked up.
    pub fn pending_instances(&self) -> Vec<String> {
        self.state.lock().unwrap().pending_map.keys().cloned().collect()
    }

    /// Queue instances for checking, deduplicating against instances
    /// already pending. Filtered and deleted instances never enter the
    /// queue.
    pub fn enqueue_instances(&self, instances: Vec<InstanceInfo>) {
        let mut enqueued = 0usize;
        {
            let mut state = self.state.lock().unwrap();
            for instance in instances {
                if self.filter.filter_out(&instance.instance_id) {
                    continue;
                }
                if instance.status == InstanceStatus::Deleted {
                    continue;
                }
                let instance_id = instance.instance_id.clone();
                if state.pending_map.contains_key(&instance_id) {
                    continue;
                }
                state.pending_map.insert(instance_id, now_ms());
                state.pending_queue.push_back(instance);
                enqueued += 1;
            }
        }
        // One permit per item; workers chain further wakeups as they pop.
        for _ in 0..enqueued {
            self.queue_notify.notify_one();
        }
    }

    async fn scan_instances_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.scan_instances_interval_seconds);
        while !self.stopped() {
            match jobs::get_all_instances(&self.kv).await {
                Ok(instances) => {
                    debug!(count = instances.len(), "checker fetched instances");
                    self.enqueue_instances(instances);
                }
                Err(e) => {
                    warn!(error = %e, "failed to fetch instances, retrying next tick");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn lease_loop(self: Arc<Self>) {
        let lease_ms = self.config.recycle_job_lease_expired_ms;
        let interval = Duration::from_millis((lease_ms / 3).max(1) as u64);
        while !self.stopped() {
            let instance_ids = self.working_instances();
            for instance_id in instance_ids {
                match lease_instance_check_job(
                    &self.kv,
                    &instance_id,
                    &self.config.owner_endpoint,
                    lease_ms,
                )
                .await
                {
                    Ok(LeaseOutcome::Renewed) => {}
                    Ok(LeaseOutcome::Lost) => {
                        warn!(instance_id = %instance_id, "lease lost, stopping checker");
                        let state = self.state.lock().unwrap();
                        if let Some(checker) = state.working_map.get(&instance_id) {
                            checker.stop();
                        }
                    }
                    Err(e) => {
                        // Transient; the checker keeps its lease until the
                        // grace window runs out.
                        warn!(instance_id = %instance_id, error = %e, "lease renewal failed");
                    }
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn inspect_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.scan_instances_interval_seconds);
        while !self.stopped() {
            info!("start to inspect instance check intervals");
            match jobs::get_all_instances(&self.kv).await {
                Ok(instances) => {
                    for instance in instances {
                        if self.filter.filter_out(&instance.instance_id) {
                            continue;
                        }
                        if self.stopped() {
                            return;
                        }
                        if instance.status == InstanceStatus::Deleted {
                            continue;
                        }
                        if let Err(e) = self.inspector.do_inspect(&instance).await {
                            warn!(
                                instance_id = %instance.instance_id,
                                error = %e,
                                "check interval alarm: inspection failed"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "check interval alarm: failed to fetch instances");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let Some((instance, enqueue_ms)) = self.next_pending().await else {
                return;
            };
            if self.process_instance(instance, enqueue_ms).await == WorkerSignal::Exit {
                return;
            }
        }
    }

    /// Block until an instance is available or the coordinator stops.
    async fn next_pending(&self) -> Option<(InstanceInfo, i64)> {
        loop {
            if self.stopped() {
                return None;
            }
            let popped = {
                let mut state = self.state.lock().unwrap();
                state.pending_queue.pop_front().map(|instance| {
                    let enqueue_ms = state
                        .pending_map
                        .remove(&instance.instance_id)
                        .unwrap_or_else(now_ms);
                    let more = !state.pending_queue.is_empty();
                    (instance, enqueue_ms, more)
                })
            };
            if let Some((instance, enqueue_ms, more)) = popped {
                if more {
                    self.queue_notify.notify_one();
                }
                return Some((instance, enqueue_ms));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = self.queue_notify.notified() => {}
            }
        }
    }

    async fn process_instance(&self, instance: InstanceInfo, enqueue_ms: i64) -> WorkerSignal {
        let instance_id = instance.instance_id.clone();

        // Concurrent retry of an instance already being checked here.
        if self
            .state
            .lock()
            .unwrap()
            .working_map
            .contains_key(&instance_id)
        {
            return WorkerSignal::Continue;
        }

        let checker =
            match InstanceChecker::init(self.kv.clone(), self.factory.as_ref(), &instance).await {
                Ok(checker) => Arc::new(checker),
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "failed to init instance checker");
                    return WorkerSignal::Continue;
                }
            };

        let lease_ms = self.config.check_object_interval_seconds * 1000;
        match prepare_instance_check_job(
            &self.kv,
            &instance_id,
            &self.config.owner_endpoint,
            lease_ms,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => return WorkerSignal::Continue,
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "failed to acquire check job");
                return WorkerSignal::Continue;
            }
        }

        self.state
            .lock()
            .unwrap()
            .working_map
            .insert(instance_id.clone(), checker.clone());

        let signal = self.run_checker(&checker, &instance_id, enqueue_ms).await;

        // Released on every exit path so the lease loop only ever renews
        // live work; on terminal exits the KV lease still runs out on its
        // own.
        self.state.lock().unwrap().working_map.remove(&instance_id);

        signal
    }

    async fn run_checker(
        &self,
        checker: &Arc<InstanceChecker>,
        instance_id: &str,
        enqueue_ms: i64,
    ) -> WorkerSignal {
        if self.stopped() {
            return WorkerSignal::Exit;
        }

        let ctime_ms = now_ms();
        metrics()
            .enqueue_cost_s
            .with_label_values(&[instance_id])
            .set((ctime_ms - enqueue_ms) / 1000);

        let mut outcome = match checker.do_check().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "instance check aborted");
                None
            }
        };

        if self.config.enable_inverted_check {
            match checker.do_inverted_check().await {
                Ok(CheckOutcome::Clean) => {}
                Ok(CheckOutcome::Divergent) => outcome = None,
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "inverted check aborted");
                    outcome = None;
                }
            }
        }

        let Some(outcome) = outcome else {
            // Terminal: leave the job unfinished so the lease expires and
            // another replica retries.
            return WorkerSignal::Exit;
        };

        if !checker.stopped() {
            if let Err(e) = finish_instance_check_job(
                &self.kv,
                instance_id,
                &self.config.owner_endpoint,
                outcome == CheckOutcome::Clean,
                ctime_ms,
            )
            .await
            {
                warn!(instance_id = %instance_id, error = %e, "failed to finish check job");
            }
        }

        WorkerSignal::Continue
    }
}
