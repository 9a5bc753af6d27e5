//! Execution substrate: the "dispatch + await" capability the scheduler
//! runs on top of.
//!
//! The scheduler only depends on the [`Substrate`] trait. The bundled
//! [`LocalSubstrate`] executes stages as tokio tasks with semaphore-backed
//! CPU/GPU accounting; a distributed implementation can be injected in its
//! place without touching the scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::core::errors::{KilnError, Result};
use crate::stage::Artifact;

/// Per-stage resource request. `None` falls back to the substrate's
/// default allocation; explicit values are exclusive reservations held for
/// the stage's entire lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: Option<u32>,
    pub gpus: Option<u32>,
}

impl ResourceRequest {
    pub fn cpus(mut self, n: u32) -> Self {
        self.cpus = Some(n);
        self
    }

    pub fn gpus(mut self, n: u32) -> Self {
        self.gpus = Some(n);
        self
    }
}

/// Concrete CPU/GPU reservation granted by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub cpus: u32,
    pub gpus: u32,
}

/// How the substrate schedules stage work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubstrateMode {
    /// Independent stages overlap in execution.
    Parallel,
    /// Stages run one at a time, for reproducible debugging.
    Debug,
}

/// Final state of one stage's asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub success: bool,
    pub error: Option<String>,
    pub artifact: Option<Artifact>,
    pub reservation: Reservation,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
}

impl StageOutcome {
    fn succeeded(stage: &str, artifact: Artifact, reservation: Reservation) -> Self {
        Self {
            stage: stage.to_string(),
            success: true,
            error: None,
            artifact: Some(artifact),
            reservation,
            started_at: now(),
            finished_at: now(),
        }
    }

    fn failed(stage: &str, error: String, reservation: Reservation) -> Self {
        Self {
            stage: stage.to_string(),
            success: false,
            error: Some(error),
            artifact: None,
            reservation,
            started_at: now(),
            finished_at: now(),
        }
    }

    /// Synthetic outcome for a stage whose task went away without ever
    /// publishing a result (e.g. a panicking action).
    pub(crate) fn aborted(stage: &str) -> Self {
        Self::failed(
            stage,
            "stage task aborted before publishing an outcome".to_string(),
            Reservation { cpus: 0, gpus: 0 },
        )
    }
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Opaque token for one in-flight or completed stage.
///
/// Cloneable: every dependent stage and the completion barrier hold their
/// own copy. Resolves exactly once.
#[derive(Debug, Clone)]
pub struct StageHandle {
    stage: String,
    rx: watch::Receiver<Option<StageOutcome>>,
}

impl StageHandle {
    /// Name of the stage this handle tracks.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Whether the underlying work has finished (successfully or not).
    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait until the stage's work has finished and return its outcome.
    pub async fn resolved(&self) -> StageOutcome {
        let mut rx = self.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().as_ref() {
                return outcome.clone();
            }
            if rx.changed().await.is_err() {
                warn!(stage = %self.stage, "stage task dropped its outcome channel");
                return StageOutcome::aborted(&self.stage);
            }
        }
    }
}

/// Boxed stage work: a future producing the stage's artifact.
pub type StageWork = std::pin::Pin<
    Box<dyn std::future::Future<Output = anyhow::Result<Artifact>> + Send>,
>;

/// Abstract execution substrate.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Activate the substrate. Idempotent: re-activating an already active
    /// substrate is a no-op and the original mode is kept.
    async fn ensure_active(&self, mode: SubstrateMode) -> Result<()>;

    fn is_active(&self) -> bool;

    /// Allocation applied when a stage makes no explicit request.
    fn default_resources(&self) -> Reservation;

    /// Submit one stage's work.
    ///
    /// Returns immediately with a handle; the work itself must not begin
    /// until every handle in `prerequisites` has resolved. Work errors are
    /// captured in the handle, never raised here.
    fn submit(
        &self,
        stage: &str,
        work: StageWork,
        prerequisites: Vec<StageHandle>,
        resources: ResourceRequest,
    ) -> Result<StageHandle>;

    /// Completion barrier: wait until every handle has resolved, in no
    /// particular order, and return all outcomes.
    async fn await_all(&self, handles: &[StageHandle]) -> Vec<StageOutcome> {
        await_handles(handles).await
    }
}

/// Wait for every handle to resolve and collect the outcomes, preserving
/// the submission order of `handles`.
pub async fn await_handles(handles: &[StageHandle]) -> Vec<StageOutcome> {
    join_all(handles.iter().map(|h| h.resolved())).await
}

/// Tokio-backed substrate running stages as local asynchronous tasks.
pub struct LocalSubstrate {
    cpu_capacity: u32,
    gpu_capacity: u32,
    cpu_slots: Arc<Semaphore>,
    gpu_slots: Arc<Semaphore>,
    /// Single run slot used when activated in debug mode.
    run_slot: Arc<Semaphore>,
    default_alloc: Reservation,
    active: AtomicBool,
    serial: AtomicBool,
    reservations: DashMap<String, Reservation>,
}

impl LocalSubstrate {
    /// Substrate with explicit CPU/GPU capacity.
    pub fn new(cpus: u32, gpus: u32) -> Self {
        Self {
            cpu_capacity: cpus,
            gpu_capacity: gpus,
            cpu_slots: Arc::new(Semaphore::new(cpus as usize)),
            gpu_slots: Arc::new(Semaphore::new(gpus as usize)),
            run_slot: Arc::new(Semaphore::new(1)),
            default_alloc: Reservation { cpus: 1, gpus: 0 },
            active: AtomicBool::new(false),
            serial: AtomicBool::new(false),
            reservations: DashMap::new(),
        }
    }

    /// Substrate sized to the host: all available cores, no GPUs.
    pub fn with_host_capacity() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self::new(cpus, 0)
    }

    /// Override the allocation used for stages without an explicit request.
    pub fn with_default_alloc(mut self, alloc: Reservation) -> Self {
        self.default_alloc = alloc;
        self
    }

    /// The reservation granted to `stage`, if it was submitted here.
    pub fn reservation_for(&self, stage: &str) -> Option<Reservation> {
        self.reservations.get(stage).map(|r| *r.value())
    }

    fn resolve_request(&self, resources: ResourceRequest) -> Reservation {
        Reservation {
            cpus: resources.cpus.unwrap_or(self.default_alloc.cpus),
            gpus: resources.gpus.unwrap_or(self.default_alloc.gpus),
        }
    }
}

#[async_trait]
impl Substrate for LocalSubstrate {
    async fn ensure_active(&self, mode: SubstrateMode) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            debug!("substrate already active; keeping current mode");
            return Ok(());
        }
        self.serial
            .store(mode == SubstrateMode::Debug, Ordering::SeqCst);
        info!(
            ?mode,
            cpus = self.cpu_capacity,
            gpus = self.gpu_capacity,
            "local substrate active"
        );
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn default_resources(&self) -> Reservation {
        self.default_alloc
    }

    fn submit(
        &self,
        stage: &str,
        work: StageWork,
        prerequisites: Vec<StageHandle>,
        resources: ResourceRequest,
    ) -> Result<StageHandle> {
        if !self.is_active() {
            return Err(KilnError::substrate_unavailable(
                "substrate is not active; call ensure_active first",
            ));
        }

        let granted = self.resolve_request(resources);
        if granted.cpus > self.cpu_capacity {
            return Err(KilnError::configuration(format!(
                "stage '{}' requests {} CPUs but the substrate has {}",
                stage, granted.cpus, self.cpu_capacity
            )));
        }
        if granted.gpus > self.gpu_capacity {
            return Err(KilnError::configuration(format!(
                "stage '{}' requests {} GPUs but the substrate has {}",
                stage, granted.gpus, self.gpu_capacity
            )));
        }
        self.reservations.insert(stage.to_string(), granted);

        let (tx, rx) = watch::channel(None);
        let handle = StageHandle {
            stage: stage.to_string(),
            rx,
        };

        let name = stage.to_string();
        let cpu_slots = self.cpu_slots.clone();
        let gpu_slots = self.gpu_slots.clone();
        let run_slot = self.run_slot.clone();
        let serial = self.serial.load(Ordering::SeqCst);

        debug!(
            stage = %name,
            deps = prerequisites.len(),
            cpus = granted.cpus,
            gpus = granted.gpus,
            "submitting stage work"
        );

        tokio::spawn(async move {
            // Work must not begin until every prerequisite has resolved.
            let mut failed_deps = Vec::new();
            for dep in &prerequisites {
                let outcome = dep.resolved().await;
                if !outcome.success {
                    failed_deps.push(outcome.stage);
                }
            }

            if !failed_deps.is_empty() {
                warn!(
                    stage = %name,
                    failed = ?failed_deps,
                    "skipping stage: prerequisites failed"
                );
                let _ = tx.send(Some(StageOutcome::failed(
                    &name,
                    format!("prerequisite stage(s) failed: {}", failed_deps.join(", ")),
                    granted,
                )));
                return;
            }

            // The debug run slot serializes stages; CPU/GPU permits are the
            // stage's exclusive reservation for its lifetime.
            let _serial_permit = if serial {
                match run_slot.acquire_owned().await {
                    Ok(p) => Some(p),
                    Err(_) => {
                        let _ = tx.send(Some(StageOutcome::failed(
                            &name,
                            "substrate shut down".to_string(),
                            granted,
                        )));
                        return;
                    }
                }
            } else {
                None
            };
            // Resource classes are acquired in a fixed order (CPUs,
            // then GPUs) so no task ever holds permits of one class
            // while parked on the other's queue.
            let _cpu_permits = match cpu_slots.acquire_many_owned(granted.cpus).await {
                Ok(p) => p,
                Err(_) => {
                    let _ = tx.send(Some(StageOutcome::failed(
                        &name,
                        "substrate shut down".to_string(),
                        granted,
                    )));
                    return;
                }
            };
            let _gpu_permits = match gpu_slots.acquire_many_owned(granted.gpus).await {
                Ok(p) => p,
                Err(_) => {
                    let _ = tx.send(Some(StageOutcome::failed(
                        &name,
                        "substrate shut down".to_string(),
                        granted,
                    )));
                    return;
                }
            };

            let started_at = now();
            debug!(stage = %name, "stage work starting");
            let outcome = match work.await {
                Ok(artifact) => {
                    let mut outcome = StageOutcome::succeeded(&name, artifact, granted);
                    outcome.started_at = started_at;
                    outcome
                }
                Err(err) => {
                    let mut outcome = StageOutcome::failed(&name, format!("{err:#}"), granted);
                    outcome.started_at = started_at;
                    outcome
                }
            };
            debug!(stage = %name, success = outcome.success, "stage work finished");
            let _ = tx.send(Some(outcome));
        });

        Ok(handle)
    }
}
