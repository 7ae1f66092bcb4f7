//! Deployment scheduler.
//!
//! Admits deployments against a bounded cpu/memory/slot budget and drives
//! their lifecycle against the runtime port. The state lock is a leaf lock:
//! it is never held across an await, and all runtime I/O happens on copies
//! taken out under it.

pub mod watchdog;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use peercompute_core::message::{Deployment, DeploymentStatus, DeployRequest, ErrorKind};
use peercompute_core::signing::unix_nanos;
use peercompute_core::PeerId;
use peercompute_runtime::{ContainerSpec, RuntimeError, RuntimePort, DEFAULT_STOP_TIMEOUT};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("maximum deployment slots ({0}) reached")]
    CapacitySlots(usize),

    #[error("insufficient cpu: need {requested} millicores, {available} available")]
    CapacityCpu { requested: i64, available: i64 },

    #[error("insufficient memory: need {requested} bytes, {available} available")]
    CapacityMemory { requested: i64, available: i64 },

    #[error("deployment {0} not found")]
    NotFound(String),

    #[error("deployment was stopped before it started")]
    Cancelled,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl SchedulerError {
    /// Wire-level error kind for typed responses.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::CapacitySlots(_) => ErrorKind::CapacitySlots,
            SchedulerError::CapacityCpu { .. } => ErrorKind::CapacityCpu,
            SchedulerError::CapacityMemory { .. } => ErrorKind::CapacityMemory,
            SchedulerError::NotFound(_) => ErrorKind::NotFound,
            SchedulerError::Cancelled => ErrorKind::RuntimeError,
            SchedulerError::Runtime(_) => ErrorKind::RuntimeError,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_deployments: usize,
    pub max_cpu_millicores: i64,
    pub max_memory_bytes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_deployments: 10,
            max_cpu_millicores: 4000,
            max_memory_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

/// Aggregate resource usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub used_cpu: i64,
    pub max_cpu: i64,
    pub used_memory: i64,
    pub max_memory: i64,
    pub used_slots: usize,
    pub max_slots: usize,
}

struct Entry {
    deployment: Deployment,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    deployments: HashMap<String, Entry>,
    used_cpu: i64,
    used_memory: i64,
}

pub struct Scheduler {
    runtime: Arc<dyn RuntimePort>,
    state: Mutex<State>,
    config: SchedulerConfig,
    id_counter: AtomicU64,
}

impl Scheduler {
    pub fn new(runtime: Arc<dyn RuntimePort>, config: SchedulerConfig) -> Self {
        Scheduler {
            runtime,
            state: Mutex::new(State::default()),
            config,
            id_counter: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("scheduler lock poisoned")
    }

    fn admission_check(&self, state: &State, cpu: i64, memory: i64) -> SchedulerResult<()> {
        if state.deployments.len() >= self.config.max_deployments {
            return Err(SchedulerError::CapacitySlots(self.config.max_deployments));
        }
        if state.used_cpu + cpu > self.config.max_cpu_millicores {
            return Err(SchedulerError::CapacityCpu {
                requested: cpu,
                available: self.config.max_cpu_millicores - state.used_cpu,
            });
        }
        if state.used_memory + memory > self.config.max_memory_bytes {
            return Err(SchedulerError::CapacityMemory {
                requested: memory,
                available: self.config.max_memory_bytes - state.used_memory,
            });
        }
        Ok(())
    }

    /// Check whether a deployment with these limits would be admitted now.
    pub fn can_schedule(&self, cpu: i64, memory: i64) -> SchedulerResult<()> {
        let state = self.lock();
        self.admission_check(&state, cpu, memory)
    }

    fn next_deployment_id(&self) -> String {
        let seq = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("dep-{}-{}", unix_nanos(Utc::now()), seq)
    }

    /// Admit and start a deployment. Admission is atomic under the state
    /// lock; pulling and starting happen outside it and roll the admission
    /// back on failure. The token cancels the in-flight pull, whether fired
    /// by `stop` or by the caller's deadline.
    pub async fn schedule(
        &self,
        req: &DeployRequest,
        cancel: CancellationToken,
    ) -> SchedulerResult<Deployment> {
        let deployment_id = {
            let mut state = self.lock();
            self.admission_check(&state, req.cpu_millicores, req.memory_bytes)?;

            let deployment_id = self.next_deployment_id();
            let deployment = Deployment {
                id: deployment_id.clone(),
                image: req.image.clone(),
                container_id: None,
                requester_id: req.requester_id.clone(),
                status: DeploymentStatus::Pending,
                cpu_limit: req.cpu_millicores,
                memory_limit: req.memory_bytes,
                expose_port: req.expose_port,
                exposed_url: None,
                started_at: Utc::now(),
                stopped_at: None,
            };
            state.used_cpu += req.cpu_millicores;
            state.used_memory += req.memory_bytes;
            state.deployments.insert(
                deployment_id.clone(),
                Entry {
                    deployment,
                    cancel: cancel.clone(),
                },
            );
            deployment_id
        };

        info!(deployment = %deployment_id, image = %req.image, "Deployment admitted");

        if !self.transition(&deployment_id, DeploymentStatus::Pulling) {
            return Err(SchedulerError::Cancelled);
        }
        match self.runtime.pull(&req.image, &cancel).await {
            Ok(()) => {}
            Err(RuntimeError::Cancelled) => {
                // Either stop already removed the entry, or the caller's
                // deadline fired; fail() is a no-op in the first case.
                self.fail(&deployment_id);
                return Err(SchedulerError::Cancelled);
            }
            Err(e) => {
                self.fail(&deployment_id);
                return Err(e.into());
            }
        }

        if !self.transition(&deployment_id, DeploymentStatus::Starting) {
            return Err(SchedulerError::Cancelled);
        }
        let spec = ContainerSpec {
            deployment_id: deployment_id.clone(),
            requester_id: req.requester_id.to_string(),
            image: req.image.clone(),
            cpu_millicores: req.cpu_millicores,
            memory_bytes: req.memory_bytes,
            expose_port: req.expose_port,
            environment: req.environment.clone(),
        };
        let container_id = match self.runtime.run(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.fail(&deployment_id);
                return Err(e.into());
            }
        };

        let finished = {
            let mut state = self.lock();
            match state.deployments.get_mut(&deployment_id) {
                Some(entry) => {
                    entry.deployment.container_id = Some(container_id.clone());
                    entry.deployment.status = DeploymentStatus::Running;
                    Some(entry.deployment.clone())
                }
                None => None,
            }
        };

        match finished {
            Some(deployment) => {
                info!(deployment = %deployment_id, container = %container_id, "Deployment running");
                Ok(deployment)
            }
            None => {
                // Stopped while the container was starting; undo the start
                warn!(deployment = %deployment_id, "Deployment stopped while starting, removing container");
                let _ = self.runtime.stop(&container_id, DEFAULT_STOP_TIMEOUT).await;
                Err(SchedulerError::Cancelled)
            }
        }
    }

    /// Stop a deployment and release its resources.
    pub async fn stop(&self, deployment_id: &str) -> SchedulerResult<()> {
        let container_id = {
            let mut state = self.lock();
            let entry = state
                .deployments
                .get_mut(deployment_id)
                .ok_or_else(|| SchedulerError::NotFound(deployment_id.to_string()))?;

            match entry.deployment.status {
                DeploymentStatus::Pending | DeploymentStatus::Pulling => {
                    // Cancel the in-flight admission; the schedule task will
                    // observe the missing entry and go no further.
                    entry.cancel.cancel();
                    let entry = state
                        .deployments
                        .remove(deployment_id)
                        .expect("entry disappeared under lock");
                    state.used_cpu -= entry.deployment.cpu_limit;
                    state.used_memory -= entry.deployment.memory_limit;
                    info!(deployment = %deployment_id, "Deployment cancelled during admission");
                    return Ok(());
                }
                DeploymentStatus::Starting => {
                    // The schedule task owns cleanup of the container
                    entry.cancel.cancel();
                    let entry = state
                        .deployments
                        .remove(deployment_id)
                        .expect("entry disappeared under lock");
                    state.used_cpu -= entry.deployment.cpu_limit;
                    state.used_memory -= entry.deployment.memory_limit;
                    return Ok(());
                }
                DeploymentStatus::Running => {
                    entry.deployment.status = DeploymentStatus::Stopping;
                    entry.deployment.container_id.clone()
                }
                DeploymentStatus::Stopping => return Ok(()),
                _ => {
                    return Err(SchedulerError::NotFound(deployment_id.to_string()));
                }
            }
        };

        let stop_result = match &container_id {
            Some(id) => self.runtime.stop(id, DEFAULT_STOP_TIMEOUT).await,
            None => Ok(()),
        };

        // Resources are released whether or not the runtime cooperated
        {
            let mut state = self.lock();
            if let Some(mut entry) = state.deployments.remove(deployment_id) {
                state.used_cpu -= entry.deployment.cpu_limit;
                state.used_memory -= entry.deployment.memory_limit;
                entry.deployment.status = DeploymentStatus::Stopped;
                entry.deployment.stopped_at = Some(Utc::now());
            }
        }

        info!(deployment = %deployment_id, "Deployment stopped");
        stop_result.map_err(SchedulerError::from)
    }

    /// Stop every deployment; best-effort, returns the failures.
    pub async fn stop_all(&self) -> Vec<(String, SchedulerError)> {
        let ids: Vec<String> = {
            let state = self.lock();
            state.deployments.keys().cloned().collect()
        };

        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                errors.push((id, e));
            }
        }
        errors
    }

    pub fn get(&self, deployment_id: &str) -> Option<Deployment> {
        let state = self.lock();
        state
            .deployments
            .get(deployment_id)
            .map(|e| e.deployment.clone())
    }

    pub fn list(&self) -> Vec<Deployment> {
        let state = self.lock();
        state
            .deployments
            .values()
            .map(|e| e.deployment.clone())
            .collect()
    }

    pub fn list_by_requester(&self, requester: &PeerId) -> Vec<Deployment> {
        let state = self.lock();
        state
            .deployments
            .values()
            .filter(|e| &e.deployment.requester_id == requester)
            .map(|e| e.deployment.clone())
            .collect()
    }

    pub fn usage(&self) -> ResourceUsage {
        let state = self.lock();
        ResourceUsage {
            used_cpu: state.used_cpu,
            max_cpu: self.config.max_cpu_millicores,
            used_memory: state.used_memory,
            max_memory: self.config.max_memory_bytes,
            used_slots: state.deployments.len(),
            max_slots: self.config.max_deployments,
        }
    }

    /// Record the public URL assigned to an exposed deployment.
    pub fn set_exposed_url(&self, deployment_id: &str, url: String) {
        let mut state = self.lock();
        if let Some(entry) = state.deployments.get_mut(deployment_id) {
            entry.deployment.exposed_url = Some(url);
        }
    }

    /// Transition a live deployment to `status`; false if it is gone.
    fn transition(&self, deployment_id: &str, status: DeploymentStatus) -> bool {
        let mut state = self.lock();
        match state.deployments.get_mut(deployment_id) {
            Some(entry) => {
                entry.deployment.status = status;
                true
            }
            None => false,
        }
    }

    /// Mark a deployment failed and roll back its admission.
    fn fail(&self, deployment_id: &str) {
        let mut state = self.lock();
        if let Some(mut entry) = state.deployments.remove(deployment_id) {
            state.used_cpu -= entry.deployment.cpu_limit;
            state.used_memory -= entry.deployment.memory_limit;
            entry.deployment.status = DeploymentStatus::Failed;
            entry.deployment.stopped_at = Some(Utc::now());
            warn!(deployment = %deployment_id, "Deployment failed, resources released");
        }
    }

    /// Watchdog hook: the container died underneath a Running deployment.
    pub(crate) fn mark_terminated(&self, deployment_id: &str) {
        let mut state = self.lock();
        if let Some(mut entry) = state.deployments.remove(deployment_id) {
            state.used_cpu -= entry.deployment.cpu_limit;
            state.used_memory -= entry.deployment.memory_limit;
            entry.deployment.status = DeploymentStatus::Terminated;
            entry.deployment.stopped_at = Some(Utc::now());
            warn!(deployment = %deployment_id, "Container died, deployment terminated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use peercompute_core::Identity;
    use peercompute_runtime::{
        ContainerStats, LogStream, ManagedContainer, RuntimeResult,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Scriptable in-memory runtime for scheduler tests.
    #[derive(Default)]
    struct MockRuntime {
        fail_pull: AtomicBool,
        fail_run: AtomicBool,
        slow_pull: AtomicBool,
        running: Mutex<HashMap<String, bool>>,
        next_container: AtomicU64,
    }

    #[async_trait]
    impl RuntimePort for MockRuntime {
        async fn ping(&self) -> RuntimeResult<()> {
            Ok(())
        }

        async fn pull(&self, image: &str, cancel: &CancellationToken) -> RuntimeResult<()> {
            if self.slow_pull.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                }
            }
            if self.fail_pull.load(Ordering::SeqCst) {
                return Err(RuntimeError::Pull {
                    image: image.to_string(),
                    message: "mock failure".into(),
                });
            }
            Ok(())
        }

        async fn run(&self, _spec: &ContainerSpec) -> RuntimeResult<String> {
            if self.fail_run.load(Ordering::SeqCst) {
                return Err(RuntimeError::Start("mock failure".into()));
            }
            let id = format!("ctr-{}", self.next_container.fetch_add(1, Ordering::SeqCst));
            self.running.lock().unwrap().insert(id.clone(), true);
            Ok(id)
        }

        async fn stop(&self, handle: &str, _timeout: Duration) -> RuntimeResult<()> {
            self.running.lock().unwrap().remove(handle);
            Ok(())
        }

        async fn logs(
            &self,
            _handle: &str,
            _follow: bool,
            _tail: Option<usize>,
        ) -> RuntimeResult<LogStream> {
            Err(RuntimeError::Logs("not supported by mock".into()))
        }

        async fn stats(&self, _handle: &str) -> RuntimeResult<ContainerStats> {
            Ok(ContainerStats::default())
        }

        async fn is_running(&self, handle: &str) -> RuntimeResult<bool> {
            Ok(*self.running.lock().unwrap().get(handle).unwrap_or(&false))
        }

        async fn list_managed(&self) -> RuntimeResult<Vec<ManagedContainer>> {
            Ok(Vec::new())
        }

        async fn cleanup_all(&self) -> RuntimeResult<()> {
            Ok(())
        }
    }

    fn request(cpu: i64, memory: i64) -> DeployRequest {
        DeployRequest {
            request_id: "req-1".into(),
            image: "nginx:alpine".into(),
            cpu_millicores: cpu,
            memory_bytes: memory,
            expose_port: 0,
            environment: BTreeMap::new(),
            requester_id: Identity::generate().peer_id().clone(),
            timestamp: 0,
            signature: Vec::new(),
        }
    }

    fn scheduler_with(config: SchedulerConfig) -> (Arc<Scheduler>, Arc<MockRuntime>) {
        let runtime = Arc::new(MockRuntime::default());
        let scheduler = Arc::new(Scheduler::new(runtime.clone(), config));
        (scheduler, runtime)
    }

    #[tokio::test]
    async fn test_schedule_reaches_running_and_counts_resources() {
        let (scheduler, _) = scheduler_with(SchedulerConfig::default());
        let deployment = scheduler.schedule(&request(500, 256 << 20), CancellationToken::new()).await.unwrap();

        assert_eq!(deployment.status, DeploymentStatus::Running);
        assert!(deployment.container_id.is_some());

        let usage = scheduler.usage();
        assert_eq!(usage.used_cpu, 500);
        assert_eq!(usage.used_memory, 256 << 20);
        assert_eq!(usage.used_slots, 1);
    }

    #[tokio::test]
    async fn test_admission_bounds() {
        let (scheduler, _) = scheduler_with(SchedulerConfig {
            max_deployments: 1,
            max_cpu_millicores: 1000,
            max_memory_bytes: 1 << 30,
        });

        assert!(matches!(
            scheduler.can_schedule(1001, 1),
            Err(SchedulerError::CapacityCpu { .. })
        ));
        assert!(matches!(
            scheduler.can_schedule(1, (1 << 30) + 1),
            Err(SchedulerError::CapacityMemory { .. })
        ));

        scheduler.schedule(&request(500, 1 << 20), CancellationToken::new()).await.unwrap();
        assert!(matches!(
            scheduler.schedule(&request(100, 1 << 20), CancellationToken::new()).await,
            Err(SchedulerError::CapacitySlots(1))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_schedules_do_not_over_admit() {
        let slots = 4usize;
        let (scheduler, _) = scheduler_with(SchedulerConfig {
            max_deployments: slots,
            max_cpu_millicores: 100_000,
            max_memory_bytes: 1 << 40,
        });

        let mut handles = Vec::new();
        for _ in 0..slots + 1 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler.schedule(&request(100, 1 << 20), CancellationToken::new()).await
            }));
        }

        let mut ok = 0;
        let mut slot_errors = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(SchedulerError::CapacitySlots(_)) => slot_errors += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, slots);
        assert_eq!(slot_errors, 1);

        let usage = scheduler.usage();
        assert_eq!(usage.used_slots, slots);
        assert_eq!(usage.used_cpu, 100 * slots as i64);
    }

    #[tokio::test]
    async fn test_pull_failure_rolls_back() {
        let (scheduler, runtime) = scheduler_with(SchedulerConfig::default());
        runtime.fail_pull.store(true, Ordering::SeqCst);

        let err = scheduler.schedule(&request(500, 1 << 20), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Runtime(_)));

        let usage = scheduler.usage();
        assert_eq!(usage.used_cpu, 0);
        assert_eq!(usage.used_memory, 0);
        assert_eq!(usage.used_slots, 0);
    }

    #[tokio::test]
    async fn test_run_failure_rolls_back() {
        let (scheduler, runtime) = scheduler_with(SchedulerConfig::default());
        runtime.fail_run.store(true, Ordering::SeqCst);

        assert!(scheduler.schedule(&request(500, 1 << 20), CancellationToken::new()).await.is_err());
        assert_eq!(scheduler.usage().used_slots, 0);
    }

    #[tokio::test]
    async fn test_stop_during_pull_cancels_and_releases() {
        let (scheduler, runtime) = scheduler_with(SchedulerConfig::default());
        runtime.slow_pull.store(true, Ordering::SeqCst);

        let schedule = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.schedule(&request(500, 1 << 20), CancellationToken::new()).await })
        };

        // Wait for the deployment to enter Pulling
        let id = loop {
            if let Some(d) = scheduler.list().into_iter().next() {
                if d.status == DeploymentStatus::Pulling {
                    break d.id;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        scheduler.stop(&id).await.unwrap();

        let result = schedule.await.unwrap();
        assert!(matches!(result, Err(SchedulerError::Cancelled)));

        let usage = scheduler.usage();
        assert_eq!(usage.used_cpu, 0);
        assert_eq!(usage.used_memory, 0);
        assert_eq!(usage.used_slots, 0);
    }

    #[tokio::test]
    async fn test_stop_unknown_is_not_found() {
        let (scheduler, _) = scheduler_with(SchedulerConfig::default());
        assert!(matches!(
            scheduler.stop("dep-missing").await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_all_drains_totals() {
        let (scheduler, _) = scheduler_with(SchedulerConfig::default());
        for _ in 0..3 {
            scheduler.schedule(&request(500, 1 << 20), CancellationToken::new()).await.unwrap();
        }
        assert_eq!(scheduler.usage().used_slots, 3);

        let errors = scheduler.stop_all().await;
        assert!(errors.is_empty());

        let usage = scheduler.usage();
        assert_eq!(usage.used_cpu, 0);
        assert_eq!(usage.used_memory, 0);
        assert_eq!(usage.used_slots, 0);
    }

    #[tokio::test]
    async fn test_snapshots_are_copies() {
        let (scheduler, _) = scheduler_with(SchedulerConfig::default());
        let deployment = scheduler.schedule(&request(500, 1 << 20), CancellationToken::new()).await.unwrap();

        let mut snapshot = scheduler.get(&deployment.id).unwrap();
        snapshot.status = DeploymentStatus::Failed;

        assert_eq!(
            scheduler.get(&deployment.id).unwrap().status,
            DeploymentStatus::Running
        );
    }

    #[tokio::test]
    async fn test_list_by_requester_filters() {
        let (scheduler, _) = scheduler_with(SchedulerConfig::default());
        let req_a = request(100, 1 << 20);
        let req_b = request(100, 1 << 20);
        scheduler.schedule(&req_a, CancellationToken::new()).await.unwrap();
        scheduler.schedule(&req_b, CancellationToken::new()).await.unwrap();

        let mine = scheduler.list_by_requester(&req_a.requester_id);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].requester_id, req_a.requester_id);
    }

    #[tokio::test]
    async fn test_watchdog_terminates_dead_container() {
        let (scheduler, runtime) = scheduler_with(SchedulerConfig::default());
        let deployment = scheduler.schedule(&request(500, 1 << 20), CancellationToken::new()).await.unwrap();
        let container = deployment.container_id.clone().unwrap();

        // Kill the container behind the scheduler's back
        runtime.running.lock().unwrap().insert(container, false);

        watchdog::sweep(&scheduler, runtime.clone()).await;

        assert!(scheduler.get(&deployment.id).is_none());
        assert_eq!(scheduler.usage().used_slots, 0);
    }
}
