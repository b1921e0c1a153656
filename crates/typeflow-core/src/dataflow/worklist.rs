//! Worklist scheduler and drain loop
//!
//! Blocks of every routine share one ordered queue. A block whose callee's
//! return type changed is either re-queued right away or parked in the dirty
//! set until the queue runs dry, which is what breaks ping chains on
//! recursive call cycles.
//!
//! Lock order: a block state lock may be held while taking the queue lock,
//! never the other way around.

use super::cfg::{BlockId, BlockKey, Cfg};
use super::context::FlowContext;
use super::mask::TypeMask;
use super::state::FlowState;
use super::type_table::TypeTable;
use super::walker::{seed_entry, Walker};
use crate::config::AnalysisConfig;
use crate::diagnostics::Diagnostic;
use crate::error::{FlowError, Result};
use crate::interprocedural::{CallGraph, CallSite};
use crate::program::{Program, RoutineId, SymbolResolver};
use indexmap::IndexSet;
use parking_lot::Mutex;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, debug_span, trace, warn};

/// What a caller learns when it subscribes to a callee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalleeStatus {
    /// No CFG, the callee will never be analyzed
    NotAnalyzable,
    /// Published and nothing of it is pending
    Stable,
    /// Expect a ping once the callee publishes again
    Unstable,
}

/// Queue order: structural position first, then identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    ordinal: u32,
    routine: RoutineId,
    block: BlockId,
}

impl QueueKey {
    fn new(key: BlockKey, ordinal: u32) -> Self {
        Self {
            ordinal,
            routine: key.routine,
            block: key.block,
        }
    }

    fn key(self) -> BlockKey {
        BlockKey::new(self.routine, self.block)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeSet<QueueKey>,
    /// Queued plus in-flight blocks per routine
    outstanding: FxHashMap<RoutineId, usize>,
    dirty: IndexSet<BlockKey>,
}

impl QueueState {
    fn release(&mut self, routine: RoutineId, count: usize) {
        if let Some(n) = self.outstanding.get_mut(&routine) {
            *n = n.saturating_sub(count);
            if *n == 0 {
                self.outstanding.remove(&routine);
            }
        }
    }
}

/// Mutable analysis data of one routine
#[derive(Debug)]
pub(crate) struct RoutineRuntime {
    pub(crate) ctx: FlowContext,
    states: Vec<Mutex<Option<FlowState>>>,
    /// Reverse postorder position of every block
    order: Vec<u32>,
    diagnostics: Mutex<BTreeMap<BlockId, Vec<Diagnostic>>>,
    failure: Mutex<Option<FlowError>>,
}

impl RoutineRuntime {
    fn new(id: RoutineId, cfg: Option<&Cfg>) -> Self {
        Self {
            ctx: FlowContext::new(id),
            states: Self::empty_states(cfg),
            order: Self::block_order(cfg),
            diagnostics: Mutex::new(BTreeMap::new()),
            failure: Mutex::new(None),
        }
    }

    fn empty_states(cfg: Option<&Cfg>) -> Vec<Mutex<Option<FlowState>>> {
        let len = cfg.map(Cfg::len).unwrap_or(0);
        (0..len).map(|_| Mutex::new(None)).collect()
    }

    /// Blocks the entry cannot reach are ordered after all others
    fn block_order(cfg: Option<&Cfg>) -> Vec<u32> {
        let Some(cfg) = cfg else {
            return Vec::new();
        };
        let len = cfg.len() as u32;
        let mut order: Vec<u32> = (0..len).map(|i| len + i).collect();
        for (position, block) in cfg.reverse_postorder().into_iter().enumerate() {
            if let Some(slot) = order.get_mut(block.index()) {
                *slot = position as u32;
            }
        }
        order
    }

    fn ordinal(&self, block: BlockId) -> u32 {
        self.order.get(block.index()).copied().unwrap_or(block.0)
    }

    pub(crate) fn failure(&self) -> Option<FlowError> {
        self.failure.lock().clone()
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    pub(crate) fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().values().flatten().cloned().collect()
    }

    /// Block entry state of the last analysis
    pub(crate) fn state(&self, block: BlockId) -> Option<FlowState> {
        self.states.get(block.index()).and_then(|slot| slot.lock().clone())
    }
}

/// Counters reported after a drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub batches: usize,
    pub blocks: usize,
    pub dirty_flushes: usize,
}

pub struct Scheduler {
    program: Program,
    types: Arc<TypeTable>,
    resolver: Box<dyn SymbolResolver>,
    config: AnalysisConfig,
    call_graph: CallGraph,
    runtimes: Vec<RoutineRuntime>,
    queue: Mutex<QueueState>,
    /// Bumped on every block state change and every return publication
    progress: AtomicU64,
    blocks_processed: AtomicUsize,
    batches: AtomicUsize,
    dirty_flushes: AtomicUsize,
}

impl Scheduler {
    pub fn new(
        program: Program,
        types: Arc<TypeTable>,
        resolver: Box<dyn SymbolResolver>,
        config: AnalysisConfig,
    ) -> Self {
        let runtimes = program
            .routines()
            .map(|routine| RoutineRuntime::new(routine.id, routine.cfg.as_deref()))
            .collect();
        Self {
            program,
            types,
            resolver,
            config,
            call_graph: CallGraph::new(),
            runtimes,
            queue: Mutex::new(QueueState::default()),
            progress: AtomicU64::new(0),
            blocks_processed: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
            dirty_flushes: AtomicUsize::new(0),
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn resolver(&self) -> &dyn SymbolResolver {
        self.resolver.as_ref()
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn call_graph(&self) -> &CallGraph {
        &self.call_graph
    }

    pub(crate) fn runtime(&self, routine: RoutineId) -> Result<&RoutineRuntime> {
        self.runtimes
            .get(routine.index())
            .ok_or(FlowError::UnknownRoutine(routine))
    }

    fn cfg(&self, routine: RoutineId) -> Result<Arc<Cfg>> {
        self.program
            .routine(routine)
            .and_then(|r| r.cfg.clone())
            .ok_or(FlowError::UnknownRoutine(routine))
    }

    pub fn stats(&self) -> DrainStats {
        DrainStats {
            batches: self.batches.load(Ordering::Relaxed),
            blocks: self.blocks_processed.load(Ordering::Relaxed),
            dirty_flushes: self.dirty_flushes.load(Ordering::Relaxed),
        }
    }

    /// Queue a block unless it is already pending
    pub fn enqueue(&self, key: BlockKey) -> bool {
        let ordinal = self
            .runtimes
            .get(key.routine.index())
            .map_or(key.block.0, |runtime| runtime.ordinal(key.block));
        let mut queue = self.queue.lock();
        let inserted = queue.pending.insert(QueueKey::new(key, ordinal));
        if inserted {
            *queue.outstanding.entry(key.routine).or_default() += 1;
        }
        inserted
    }

    /// Subscribe `site` to the callee's return type
    pub fn enqueue_routine(&self, callee: RoutineId, site: CallSite) -> CalleeStatus {
        let analyzable = self
            .program
            .routine(callee)
            .is_some_and(|routine| routine.is_analyzable());
        if !analyzable {
            return CalleeStatus::NotAnalyzable;
        }
        self.call_graph.add_call(site, callee);
        if self.is_return_stable(callee) {
            CalleeStatus::Stable
        } else {
            CalleeStatus::Unstable
        }
    }

    /// Published and no block of the routine waiting or running
    pub fn is_return_stable(&self, routine: RoutineId) -> bool {
        if self.call_graph.published(routine).is_none() {
            return false;
        }
        let queue = self.queue.lock();
        !queue.outstanding.contains_key(&routine) && !queue.dirty.iter().any(|key| key.routine == routine)
    }

    /// A callee of `caller` published a new return type
    pub fn ping(&self, caller: BlockKey) {
        let callees = self.call_graph.callees_of(caller.routine);
        if callees.iter().all(|&callee| self.is_return_stable(callee)) {
            self.enqueue(caller);
        } else {
            trace!(block = %caller, "parking pinged block");
            self.queue.lock().dirty.insert(caller);
        }
    }

    /// Safety valve behind the stalled-progress check, never below the
    /// number of blocks so large programs still converging are not cut off
    fn flush_limit(&self) -> usize {
        let blocks: usize = self.runtimes.iter().map(|runtime| runtime.states.len()).sum();
        self.config.max_dirty_flushes.max(blocks)
    }

    fn take_batch(&self) -> Vec<BlockKey> {
        let mut queue = self.queue.lock();
        let size = match self.config.batch_size {
            0 => queue.pending.len(),
            n => n.min(queue.pending.len()),
        };
        let mut batch = Vec::with_capacity(size);
        for _ in 0..size {
            let Some(next) = queue.pending.pop_first() else {
                break;
            };
            let key = next.key();
            queue.dirty.shift_remove(&key);
            batch.push(key);
        }
        batch
    }

    /// Mark the routine's entry for analysis with a freshly seeded state
    pub(crate) fn seed(&self, routine: RoutineId) -> Result<()> {
        let runtime = self.runtime(routine)?;
        let info = self.program.routine(routine).ok_or(FlowError::UnknownRoutine(routine))?;
        let Some(cfg) = info.cfg.as_deref() else {
            return Ok(());
        };
        let state = seed_entry(self, info, &runtime.ctx)?;
        let slot = runtime
            .states
            .get(cfg.entry.index())
            .ok_or(FlowError::UnknownBlock { routine, block: cfg.entry })?;
        *slot.lock() = Some(state);
        self.enqueue(BlockKey::new(routine, cfg.entry));
        Ok(())
    }

    /// Drain until quiescence, abandonment or a stalled dirty set
    pub fn drain(&self) -> Result<()> {
        let span = debug_span!("analyze", routines = self.runtimes.len());
        let _guard = span.enter();

        let started = Instant::now();
        let deadline = self.config.deadline();
        let mut flushes = 0usize;
        let mut unproductive = 0usize;
        let mut last_progress = self.progress.load(Ordering::Acquire);
        let flush_limit = self.flush_limit();

        loop {
            if let Some(deadline) = deadline {
                if started.elapsed() >= deadline {
                    let pending = self.pending_blocks();
                    warn!(pending, "deadline exceeded, abandoning analysis");
                    return Err(FlowError::Abandoned { pending });
                }
            }

            let batch = self.take_batch();
            if batch.is_empty() {
                let dirty: Vec<BlockKey> = std::mem::take(&mut self.queue.lock().dirty).into_iter().collect();
                if dirty.is_empty() {
                    debug!(elapsed = ?started.elapsed(), "worklist quiescent");
                    return Ok(());
                }

                flushes += 1;
                self.dirty_flushes.fetch_add(1, Ordering::Relaxed);
                let progress = self.progress.load(Ordering::Acquire);
                unproductive = if progress == last_progress { unproductive + 1 } else { 0 };
                last_progress = progress;

                if unproductive >= 2 || flushes > flush_limit {
                    let stalled: Vec<RoutineId> = dirty
                        .iter()
                        .map(|key| key.routine)
                        .collect::<IndexSet<_>>()
                        .into_iter()
                        .collect();
                    {
                        let mut queue = self.queue.lock();
                        queue.dirty.extend(dirty.iter().copied());
                    }
                    let mut routines = self.call_graph.cycles_through(&stalled);
                    if routines.is_empty() {
                        routines = stalled;
                        routines.sort();
                    }
                    warn!(?routines, flushes, "dirty set stopped shrinking");
                    return Err(FlowError::NonConvergence { routines });
                }

                debug!(count = dirty.len(), flush = flushes, "flushing dirty blocks");
                for key in dirty {
                    self.enqueue(key);
                }
                continue;
            }

            self.batches.fetch_add(1, Ordering::Relaxed);
            debug!(size = batch.len(), "processing batch");
            if self.config.runs_parallel() {
                batch.par_iter().for_each(|&key| self.run_block(key));
            } else {
                batch.iter().for_each(|&key| self.run_block(key));
            }
        }
    }

    fn run_block(&self, key: BlockKey) {
        let outcome = self.process_block(key);
        self.blocks_processed.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().release(key.routine, 1);
        match outcome {
            Ok(true) => self.publish_return(key.routine),
            Ok(false) => {}
            Err(err) => self.fail_routine(key.routine, err),
        }
    }

    /// Walk one block and hand its outgoing states to the successors.
    /// Returns whether the block is the routine's exit.
    fn process_block(&self, key: BlockKey) -> Result<bool> {
        let runtime = self.runtime(key.routine)?;
        if runtime.is_failed() {
            return Ok(false);
        }
        let cfg = self.cfg(key.routine)?;
        let block = cfg.block(key.block).ok_or(FlowError::UnknownBlock {
            routine: key.routine,
            block: key.block,
        })?;
        let state = runtime.state(key.block).ok_or(FlowError::MissingState {
            routine: key.routine,
            block: key.block,
        })?;
        state.check_version(&runtime.ctx)?;

        trace!(block = %key, "processing block");
        let outcome = Walker::new(self, key, &runtime.ctx, state).walk_block(block)?;
        runtime.diagnostics.lock().insert(key.block, outcome.diagnostics);

        for (target, incoming) in outcome.edges {
            let slot = runtime.states.get(target.index()).ok_or(FlowError::UnknownBlock {
                routine: key.routine,
                block: target,
            })?;
            let mut current = slot.lock();
            let changed = match current.as_mut() {
                Some(existing) => existing.merge_from(&incoming)?,
                None => {
                    *current = Some(incoming);
                    true
                }
            };
            if changed {
                self.progress.fetch_add(1, Ordering::AcqRel);
                self.enqueue(BlockKey::new(key.routine, target));
            }
        }
        for target in outcome.requeue {
            self.enqueue(BlockKey::new(key.routine, target));
        }
        if outcome.return_changed {
            self.enqueue(BlockKey::new(key.routine, cfg.exit));
        }
        Ok(key.block == cfg.exit)
    }

    fn publish_return(&self, routine: RoutineId) {
        let Ok(runtime) = self.runtime(routine) else {
            return;
        };
        if runtime.is_failed() {
            return;
        }
        let mask = runtime.ctx.return_mask();
        if let Some(subscribers) = self.call_graph.publish(routine, mask) {
            self.progress.fetch_add(1, Ordering::AcqRel);
            debug!(%routine, %mask, subscribers = subscribers.len(), "return type published");
            for subscriber in subscribers {
                self.ping(subscriber);
            }
        }
    }

    /// Stop analyzing a routine, callers see `Any` from now on
    pub(crate) fn fail_routine(&self, routine: RoutineId, err: FlowError) {
        warn!(%routine, error = %err, "routine analysis failed");
        if let Ok(runtime) = self.runtime(routine) {
            let mut failure = runtime.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        {
            let mut queue = self.queue.lock();
            let before = queue.pending.len();
            queue.pending.retain(|key| key.routine != routine);
            let dropped = before - queue.pending.len();
            queue.release(routine, dropped);
            queue.dirty.retain(|key| key.routine != routine);
        }
        if let Some(subscribers) = self.call_graph.publish(routine, TypeMask::ANY) {
            self.progress.fetch_add(1, Ordering::AcqRel);
            for subscriber in subscribers {
                self.ping(subscriber);
            }
        }
    }

    /// Blocks queued, running or parked
    pub fn pending_blocks(&self) -> usize {
        let queue = self.queue.lock();
        queue.pending.len() + queue.dirty.len()
    }

    /// Routines that still have queued or parked work
    pub(crate) fn routines_with_work(&self) -> Vec<RoutineId> {
        let queue = self.queue.lock();
        let mut routines: IndexSet<RoutineId> = queue.pending.iter().map(|key| key.routine).collect();
        routines.extend(queue.dirty.iter().map(|key| key.routine));
        routines.into_iter().collect()
    }

    pub(crate) fn clear_queue(&self) {
        *self.queue.lock() = QueueState::default();
    }

    /// Swap in a rewritten CFG; every state of the routine becomes stale
    pub(crate) fn replace_cfg(&mut self, routine: RoutineId, cfg: Cfg) -> Result<()> {
        if !self.program.set_cfg(routine, cfg) {
            return Err(FlowError::UnknownRoutine(routine));
        }
        let new_cfg = self.cfg(routine)?;
        let runtime = self
            .runtimes
            .get_mut(routine.index())
            .ok_or(FlowError::UnknownRoutine(routine))?;
        let version = runtime.ctx.bump_version();
        runtime.states = RoutineRuntime::empty_states(Some(&new_cfg));
        runtime.order = RoutineRuntime::block_order(Some(&new_cfg));
        runtime.diagnostics.get_mut().clear();
        *runtime.failure.get_mut() = None;

        let queue = self.queue.get_mut();
        let before = queue.pending.len();
        queue.pending.retain(|key| key.routine != routine);
        let dropped = before - queue.pending.len();
        queue.release(routine, dropped);
        queue.dirty.retain(|key| key.routine != routine);

        self.call_graph.reset_routine(routine);
        debug!(%routine, version, "cfg replaced");
        self.seed(routine)
    }

    pub(crate) fn runtimes(&self) -> &[RoutineRuntime] {
        &self.runtimes
    }
}
