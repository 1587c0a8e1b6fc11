//! # Scheduler / Executor
//!
//! Dependency-driven concurrent execution of a compiled DAG. One task
//! per node: inline-computed data nodes evaluate as soon as their
//! transform inputs complete; module nodes await their consume edges,
//! take a slot in the priority worker pool, and run through the module
//! options executor. Every data result lives in a single-assignment
//! cell, so a consumer never observes a pending producer.
//!
//! A run with unsupplied inputs reports `Suspended` with the missing
//! name/type map; the execution state is retained and can be resumed
//! with supplemental inputs. Already-completed cells are preserved
//! across resumption. Cancellation is cooperative: every task races its
//! work against the run's cancellation token.

pub mod cache;
pub mod cell;
pub mod limits;
pub mod options;
pub mod transform;

pub use cache::{CacheBackend, InMemoryCache};
pub use cell::DataCell;
pub use limits::{LimiterRegistry, TokenBucket};
pub use options::{execute_with_options, ModuleExecution};

use crate::config::RuntimeConfig;
use crate::dag::{DagSpec, DataId, ModuleId, ModuleKind, PipelineImage};
use crate::registry::FunctionRegistry;
use crate::value::{CType, CValue};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::Instrument;
use uuid::Uuid;

// ============================================================================
// Errors and signals
// ============================================================================

/// Failures surfaced by the executor.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("module '{module}' failed: {message}")]
    ModuleFailed {
        module: String,
        message: String,
        /// Cause chain, populated when the failure wraps another
        cause: Option<Arc<RuntimeError>>,
    },

    #[error("module '{module}' timed out after {timeout_ms}ms")]
    Timeout { module: String, timeout_ms: u64 },

    #[error("run exceeded the global timeout of {timeout_ms}ms")]
    RunTimeout { timeout_ms: u64 },

    #[error("execution cancelled")]
    Cancelled,

    #[error("missing required input '{name}'")]
    MissingInput { name: String },

    #[error("input '{name}' has type {found}, expected {expected}")]
    InputTypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("module '{module}' produced {found}, expected {expected}")]
    OutputTypeMismatch {
        module: String,
        expected: String,
        found: String,
    },

    #[error("'{node}' failed upstream: {cause}")]
    UpstreamFailed { node: String, cause: Arc<RuntimeError> },

    #[error("no execution with id {execution_id}")]
    UnknownExecution { execution_id: Uuid },

    #[error("internal runtime error: {0}")]
    Internal(String),
}

/// Terminal state of a run (or its current state, for suspensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Suspended,
    Failed,
}

/// Result of driving a run: completed outputs, or the missing-input map
/// for suspensions, or the failure with whatever partial outputs
/// finished.
#[derive(Debug, Clone)]
pub struct Signal {
    pub execution_id: Uuid,
    pub status: RunStatus,
    pub outputs: BTreeMap<String, CValue>,
    pub missing: BTreeMap<String, CType>,
    pub error: Option<Arc<RuntimeError>>,
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation token shared by every task of a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// Priority worker pool
// ============================================================================

struct Waiter {
    priority: u8,
    seq: u64,
    enqueued: Instant,
    tx: oneshot::Sender<()>,
}

struct PoolState {
    available: usize,
    waiting: Vec<Waiter>,
    next_seq: u64,
}

/// Bounded pool ordering admission by priority (0..=100, higher first).
/// Entries waiting longer than the starvation timeout are admitted
/// first, oldest first, regardless of priority.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    starvation: Duration,
}

impl WorkerPool {
    pub fn new(capacity: usize, starvation: Duration) -> Self {
        WorkerPool {
            state: Mutex::new(PoolState {
                available: capacity.max(1),
                waiting: Vec::new(),
                next_seq: 0,
            }),
            starvation,
        }
    }

    pub async fn acquire(self: &Arc<Self>, priority: u8) -> WorkerPermit {
        let rx = {
            let mut state = self.state.lock();
            if state.available > 0 {
                state.available -= 1;
                return WorkerPermit {
                    pool: Arc::clone(self),
                };
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.push(Waiter {
                priority,
                seq,
                enqueued: Instant::now(),
                tx,
            });
            rx
        };
        // The releasing side transfers the slot directly
        let _ = rx.await;
        WorkerPermit {
            pool: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        loop {
            let Some(index) = self.pick(&state.waiting) else {
                state.available += 1;
                return;
            };
            let waiter = state.waiting.swap_remove(index);
            if waiter.tx.send(()).is_ok() {
                return;
            }
            // Receiver went away (cancelled); pick again
        }
    }

    fn pick(&self, waiting: &[Waiter]) -> Option<usize> {
        if waiting.is_empty() {
            return None;
        }
        // Starved entries first, in FIFO order
        let starved = waiting
            .iter()
            .enumerate()
            .filter(|(_, w)| w.enqueued.elapsed() >= self.starvation)
            .min_by_key(|(_, w)| w.seq);
        if let Some((index, _)) = starved {
            return Some(index);
        }
        waiting
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| (w.priority, u64::MAX - w.seq))
            .map(|(index, _)| index)
    }
}

/// RAII slot in the worker pool.
pub struct WorkerPermit {
    pool: Arc<WorkerPool>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.pool.release();
    }
}

// ============================================================================
// Runtime
// ============================================================================

struct RunState {
    image: Arc<PipelineImage>,
    cells: HashMap<DataId, Arc<DataCell>>,
    cancel: CancelToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// The pipeline executor. Owns the shared cache, limiter registry, and
/// worker pool; tracks in-flight and suspended runs by execution id.
pub struct PipelineRuntime {
    registry: Arc<FunctionRegistry>,
    cache: Arc<dyn CacheBackend>,
    limiters: Arc<LimiterRegistry>,
    pool: Arc<WorkerPool>,
    config: RuntimeConfig,
    runs: dashmap::DashMap<Uuid, Arc<RunState>>,
}

impl PipelineRuntime {
    pub fn new(registry: Arc<FunctionRegistry>, config: RuntimeConfig) -> Self {
        let pool = Arc::new(WorkerPool::new(
            config.max_workers,
            Duration::from_millis(config.starvation_timeout_ms),
        ));
        PipelineRuntime {
            registry,
            cache: Arc::new(InMemoryCache::new()),
            limiters: Arc::new(LimiterRegistry::new()),
            pool,
            config,
            runs: dashmap::DashMap::new(),
        }
    }

    /// Swap in a non-default cache backend.
    pub fn with_cache_backend(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = cache;
        self
    }

    /// Start a run with the given top-level inputs and drive it to
    /// completion, suspension, or failure.
    pub async fn run(
        &self,
        image: Arc<PipelineImage>,
        inputs: BTreeMap<String, CValue>,
    ) -> Signal {
        let execution_id = Uuid::new_v4();
        tracing::debug!(execution_id = %execution_id, "run_started");
        let state = self.setup(image, execution_id);
        self.runs.insert(execution_id, Arc::clone(&state));

        if let Err(error) = supply_inputs(&state, inputs) {
            self.finish(execution_id);
            return Signal {
                execution_id,
                status: RunStatus::Failed,
                outputs: BTreeMap::new(),
                missing: BTreeMap::new(),
                error: Some(Arc::new(error)),
            };
        }
        self.await_outcome(execution_id, state).await
    }

    /// Resume a suspended run with supplemental inputs. Completed cells
    /// are preserved; resuming an unknown id fails.
    pub async fn resume(
        &self,
        execution_id: Uuid,
        inputs: BTreeMap<String, CValue>,
    ) -> Signal {
        let Some(state) = self.runs.get(&execution_id).map(|s| Arc::clone(&s)) else {
            return Signal {
                execution_id,
                status: RunStatus::Failed,
                outputs: BTreeMap::new(),
                missing: BTreeMap::new(),
                error: Some(Arc::new(RuntimeError::UnknownExecution { execution_id })),
            };
        };
        tracing::debug!(execution_id = %execution_id, "run_resumed");
        if let Err(error) = supply_inputs(&state, inputs) {
            self.finish(execution_id);
            return Signal {
                execution_id,
                status: RunStatus::Failed,
                outputs: BTreeMap::new(),
                missing: BTreeMap::new(),
                error: Some(Arc::new(error)),
            };
        }
        self.await_outcome(execution_id, state).await
    }

    /// Cancel a running or suspended execution. In-flight module tasks
    /// are asked to stop cooperatively; whatever has not drained by the
    /// configured timeout is abandoned.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        let Some(state) = self.runs.get(&execution_id).map(|s| Arc::clone(&s)) else {
            return false;
        };
        tracing::debug!(execution_id = %execution_id, "run_cancelled");
        state.cancel.cancel();
        let drain = Duration::from_millis(self.config.drain_timeout_ms);
        let handles: Vec<_> = std::mem::take(&mut *state.tasks.lock());
        tokio::spawn(async move {
            tokio::time::sleep(drain).await;
            for handle in handles {
                handle.abort();
            }
        });
        true
    }

    /// Ids of runs currently executing or suspended.
    pub fn executions(&self) -> Vec<Uuid> {
        self.runs.iter().map(|entry| *entry.key()).collect()
    }

    fn finish(&self, execution_id: Uuid) {
        self.runs.remove(&execution_id);
    }

    // ------------------------------------------------------------------------
    // Task setup
    // ------------------------------------------------------------------------

    fn setup(&self, image: Arc<PipelineImage>, execution_id: Uuid) -> Arc<RunState> {
        let spec = &image.spec;
        let mut cells: HashMap<DataId, Arc<DataCell>> = HashMap::new();
        for id in spec.data.keys() {
            cells.insert(*id, Arc::new(DataCell::new()));
        }

        let state = Arc::new(RunState {
            image: Arc::clone(&image),
            cells,
            cancel: CancelToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for (data_id, node) in &spec.data {
            if let Some(transform) = &node.inline {
                handles.push(self.spawn_inline_task(
                    &state,
                    *data_id,
                    node.name.clone(),
                    transform.clone(),
                    node.transform_inputs.clone(),
                ));
            }
        }
        for module_id in spec.modules.keys() {
            handles.push(self.spawn_module_task(&state, *module_id, execution_id));
        }
        *state.tasks.lock() = handles;
        state
    }

    fn spawn_inline_task(
        &self,
        state: &Arc<RunState>,
        data_id: DataId,
        name: String,
        transform: crate::dag::InlineTransform,
        transform_inputs: BTreeMap<String, DataId>,
    ) -> tokio::task::JoinHandle<()> {
        let cell = Arc::clone(&state.cells[&data_id]);
        let inputs: Vec<(String, String, Arc<DataCell>)> = transform_inputs
            .iter()
            .map(|(param, id)| {
                let upstream_name = state
                    .image
                    .spec
                    .data
                    .get(id)
                    .map(|d| d.name.clone())
                    .unwrap_or_default();
                (param.clone(), upstream_name, Arc::clone(&state.cells[id]))
            })
            .collect();
        let cancel = state.cancel.clone();

        tokio::spawn(async move {
            let mut values = BTreeMap::new();
            for (param, upstream_name, upstream) in &inputs {
                match wait_or_cancel(upstream, &cancel).await {
                    Ok(value) => {
                        values.insert(param.clone(), value);
                    }
                    Err(error) => {
                        cell.set_failed(Arc::new(RuntimeError::UpstreamFailed {
                            node: upstream_name.clone(),
                            cause: error,
                        }));
                        return;
                    }
                }
            }
            match transform::evaluate_transform(&transform, &values) {
                Ok(value) => {
                    tracing::trace!(node = %name, "inline_node_completed");
                    cell.set_value(value);
                }
                Err(error) => {
                    cell.set_failed(Arc::new(error));
                }
            }
        })
    }

    fn spawn_module_task(
        &self,
        state: &Arc<RunState>,
        module_id: ModuleId,
        execution_id: Uuid,
    ) -> tokio::task::JoinHandle<()> {
        let spec = &state.image.spec;
        let module = spec.modules[&module_id].clone();
        let options = spec
            .module_options
            .get(&module_id)
            .cloned()
            .unwrap_or_default();

        let consumed: Vec<(String, String, Arc<DataCell>)> = spec
            .consumed_by(module_id)
            .into_iter()
            .map(|(data_id, nickname)| {
                let upstream_name = spec
                    .data
                    .get(&data_id)
                    .map(|d| d.name.clone())
                    .unwrap_or_default();
                (nickname, upstream_name, Arc::clone(&state.cells[&data_id]))
            })
            .collect();
        let produced: Vec<Arc<DataCell>> = spec
            .produced_by(module_id)
            .into_iter()
            .map(|data_id| Arc::clone(&state.cells[&data_id]))
            .collect();
        let fallback_cell = options
            .fallback
            .and_then(|id| state.cells.get(&id).map(Arc::clone));

        let cancel = state.cancel.clone();
        let registry = Arc::clone(&self.registry);
        let cache = Arc::clone(&self.cache);
        let limiters = Arc::clone(&self.limiters);
        let pool = Arc::clone(&self.pool);

        tokio::spawn(async move {
            let fail_all = |error: Arc<RuntimeError>| {
                for cell in &produced {
                    cell.set_failed(Arc::clone(&error));
                }
            };

            // Lazy calls defer until a consumer demands the output
            if options.lazy {
                if let Some(first) = produced.first() {
                    tokio::select! {
                        () = first.wait_demanded() => {}
                        () = cancel.cancelled() => {
                            fail_all(Arc::new(RuntimeError::Cancelled));
                            return;
                        }
                    }
                }
            }

            let result = match &module.metadata.kind {
                ModuleKind::SyntheticBranch { case_count } => {
                    run_branch(*case_count, &consumed, &cancel).await
                }
                ModuleKind::User => {
                    run_user_module(
                        &module.metadata.name,
                        &module.produces,
                        &consumed,
                        fallback_cell,
                        &options,
                        &registry,
                        cache.as_ref(),
                        &limiters,
                        &pool,
                        &cancel,
                        execution_id,
                    )
                    .await
                }
            };

            match result {
                Ok(value) => {
                    for cell in &produced {
                        cell.set_value(value.clone());
                    }
                }
                Err(error) => fail_all(error),
            }
        })
    }

    // ------------------------------------------------------------------------
    // Outcome
    // ------------------------------------------------------------------------

    async fn await_outcome(&self, execution_id: Uuid, state: Arc<RunState>) -> Signal {
        let spec = &state.image.spec;
        let externals = spec.external_inputs();

        let missing: BTreeMap<String, CType> = externals
            .iter()
            .filter(|(_, (id, _))| !state.cells[id].is_set())
            .map(|(name, (_, ctype))| (name.clone(), ctype.clone()))
            .collect();
        let missing_ids: HashSet<DataId> = externals
            .iter()
            .filter(|(name, _)| missing.contains_key(*name))
            .map(|(_, (id, _))| *id)
            .collect();

        // Outputs transitively depending on a missing input cannot
        // complete in this round
        let mut blocked: HashSet<String> = HashSet::new();
        for (name, data_id) in &spec.output_bindings {
            let upstream = upstream_closure(spec, *data_id);
            if upstream.iter().any(|id| missing_ids.contains(id)) {
                blocked.insert(name.clone());
            }
        }

        let collect = async {
            let mut outputs = BTreeMap::new();
            let mut first_error: Option<Arc<RuntimeError>> = None;
            for name in &spec.declared_outputs {
                if blocked.contains(name) {
                    continue;
                }
                let Some(data_id) = spec.output_bindings.get(name) else {
                    continue;
                };
                match state.cells[data_id].wait().await {
                    Ok(value) => {
                        outputs.insert(name.clone(), value);
                    }
                    Err(error) => {
                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                    }
                }
            }
            (outputs, first_error)
        };

        let (outputs, first_error) = match self.config.global_timeout_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), collect).await
                {
                    Ok(result) => result,
                    Err(_) => {
                        state.cancel.cancel();
                        self.finish(execution_id);
                        return Signal {
                            execution_id,
                            status: RunStatus::Failed,
                            outputs: BTreeMap::new(),
                            missing: BTreeMap::new(),
                            error: Some(Arc::new(RuntimeError::RunTimeout { timeout_ms })),
                        };
                    }
                }
            }
            None => collect.await,
        };

        if let Some(error) = first_error {
            tracing::debug!(execution_id = %execution_id, error = %error, "run_failed");
            self.finish(execution_id);
            return Signal {
                execution_id,
                status: RunStatus::Failed,
                outputs,
                missing: BTreeMap::new(),
                error: Some(error),
            };
        }

        if !blocked.is_empty() {
            tracing::debug!(
                execution_id = %execution_id,
                missing = ?missing.keys().collect::<Vec<_>>(),
                "run_suspended"
            );
            return Signal {
                execution_id,
                status: RunStatus::Suspended,
                outputs,
                missing,
                error: None,
            };
        }

        tracing::debug!(execution_id = %execution_id, "run_completed");
        self.finish(execution_id);
        Signal {
            execution_id,
            status: RunStatus::Completed,
            outputs,
            missing: BTreeMap::new(),
            error: None,
        }
    }
}

// ============================================================================
// Task helpers
// ============================================================================

async fn wait_or_cancel(
    cell: &DataCell,
    cancel: &CancelToken,
) -> Result<CValue, Arc<RuntimeError>> {
    tokio::select! {
        result = cell.wait() => result,
        () = cancel.cancelled() => Err(Arc::new(RuntimeError::Cancelled)),
    }
}

/// Synthetic branch: conditions in declaration order, first true wins,
/// later inputs are never awaited once an arm is taken.
async fn run_branch(
    case_count: usize,
    consumed: &[(String, String, Arc<DataCell>)],
    cancel: &CancelToken,
) -> Result<CValue, Arc<RuntimeError>> {
    let cell_for = |param: &str| -> Option<&Arc<DataCell>> {
        consumed
            .iter()
            .find(|(nickname, _, _)| nickname == param)
            .map(|(_, _, cell)| cell)
    };
    let missing =
        |param: &str| Arc::new(RuntimeError::Internal(format!("branch input '{param}' missing")));

    for index in 0..case_count {
        let cond_param = format!("cond{index}");
        let cond_cell = cell_for(&cond_param).ok_or_else(|| missing(&cond_param))?;
        let cond = wait_or_cancel(cond_cell, cancel).await?;
        if cond.as_bool() == Some(true) {
            let expr_param = format!("expr{index}");
            let expr_cell = cell_for(&expr_param).ok_or_else(|| missing(&expr_param))?;
            return wait_or_cancel(expr_cell, cancel).await;
        }
    }
    let otherwise = cell_for("otherwise").ok_or_else(|| missing("otherwise"))?;
    wait_or_cancel(otherwise, cancel).await
}

#[allow(clippy::too_many_arguments)]
async fn run_user_module(
    module_name: &str,
    produces: &BTreeMap<String, CType>,
    consumed: &[(String, String, Arc<DataCell>)],
    fallback_cell: Option<Arc<DataCell>>,
    options: &crate::ir::IRModuleCallOptions,
    registry: &FunctionRegistry,
    cache: &dyn CacheBackend,
    limiters: &LimiterRegistry,
    pool: &Arc<WorkerPool>,
    cancel: &CancelToken,
    execution_id: Uuid,
) -> Result<CValue, Arc<RuntimeError>> {
    let mut inputs = BTreeMap::new();
    for (nickname, upstream_name, cell) in consumed {
        match wait_or_cancel(cell, cancel).await {
            Ok(value) => {
                inputs.insert(nickname.clone(), value);
            }
            Err(error) => {
                return Err(Arc::new(RuntimeError::UpstreamFailed {
                    node: upstream_name.clone(),
                    cause: error,
                }))
            }
        }
    }
    let fallback = match fallback_cell {
        Some(cell) => Some(wait_or_cancel(&cell, cancel).await?),
        None => None,
    };

    let implementation = registry.implementation(module_name).ok_or_else(|| {
        Arc::new(RuntimeError::ModuleFailed {
            module: module_name.to_string(),
            message: "no implementation registered".to_string(),
            cause: None,
        })
    })?;
    let output_type = produces
        .get("out")
        .cloned()
        .ok_or_else(|| Arc::new(RuntimeError::Internal("module produces no 'out'".into())))?;

    // Priority admission, then the options stack
    let priority = options.priority.unwrap_or(50);
    let _slot = pool.acquire(priority).await;

    let span = tracing::debug_span!(
        "module_invocation",
        module = module_name,
        execution_id = %execution_id,
    );
    execute_with_options(
        ModuleExecution {
            module_name,
            implementation,
            inputs,
            options,
            fallback,
            output_type: &output_type,
        },
        cache,
        limiters,
        cancel,
    )
    .instrument(span)
    .await
    .map_err(Arc::new)
}

fn supply_inputs(
    state: &Arc<RunState>,
    inputs: BTreeMap<String, CValue>,
) -> Result<(), RuntimeError> {
    let externals = state.image.spec.external_inputs();
    for (name, value) in inputs {
        let Some((data_id, ctype)) = externals.get(&name) else {
            tracing::warn!(input = %name, "ignoring unknown input");
            continue;
        };
        let found = value.ctype();
        if found != *ctype {
            return Err(RuntimeError::InputTypeMismatch {
                name,
                expected: ctype.render(),
                found: found.render(),
            });
        }
        state.cells[data_id].set_value(value);
    }
    Ok(())
}

/// Every data node upstream of `data_id`, including itself.
fn upstream_closure(spec: &DagSpec, data_id: DataId) -> HashSet<DataId> {
    let mut closure = HashSet::new();
    let mut stack = vec![data_id];
    while let Some(id) = stack.pop() {
        if !closure.insert(id) {
            continue;
        }
        if let Some(module) = spec.producer(id) {
            for (upstream, _) in spec.consumed_by(module) {
                stack.push(upstream);
            }
            if let Some(options) = spec.module_options.get(&module) {
                if let Some(fallback) = options.fallback {
                    stack.push(fallback);
                }
            }
        } else if let Some(node) = spec.data.get(&id) {
            stack.extend(node.transform_inputs.values().copied());
        }
    }
    closure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let pool = Arc::new(WorkerPool::new(2, Duration::from_secs(60)));
        let a = pool.acquire(50).await;
        let _b = pool.acquire(50).await;

        let acquired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acquired);
        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            let _c = pool2.acquire(50).await;
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!acquired.load(Ordering::SeqCst));

        drop(a);
        waiter.await.expect("join");
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_worker_pool_prefers_higher_priority() {
        let pool = Arc::new(WorkerPool::new(1, Duration::from_secs(60)));
        let slot = pool.acquire(50).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (priority, label) in [(10u8, "low"), (95u8, "critical"), (50u8, "normal")] {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let permit = pool.acquire(priority).await;
                order.lock().push(label);
                drop(permit);
            }));
        }
        // Let all three enqueue before releasing the slot
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(slot);
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(*order.lock(), vec!["critical", "normal", "low"]);
    }

    #[tokio::test]
    async fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let watcher = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel();
        watcher.await.expect("join");
        assert!(token.is_cancelled());
    }
}
