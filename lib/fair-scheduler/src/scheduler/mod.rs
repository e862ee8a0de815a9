// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fair replica scheduler.
//!
//! One [`ReplicaScheduler`] governs one replica. Each tick it forms at most one
//! batch:
//!
//! - **Whole prefill**: the waiting queue is scanned in fairness order and
//!   candidates are admitted under the micro-batch, concurrency, token-width
//!   and allocation budgets. If nothing is admitted, preempted requests are
//!   resumed, evicting the least favored ones when memory runs out.
//! - **Chunked prefill**: decode continuations are resumed first, then running
//!   prefills and waiting requests compete jointly for the single prefill chunk
//!   a batch may carry.
//!
//! Requests live in an arena owned by the scheduler; queues and batches refer
//! to them by id.

mod batch;
mod builder;
mod chunked;
mod chunking;
mod preemption;
mod queues;


pub use batch::{Batch, BatchEntry, BatchId};
pub use chunking::{ChunkingStrategy, SarathiChunking, WholePrefill};
pub use queues::{PreemptedPool, WaitingQueue};

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use validator::Validate;

use self::batch::BatchDraft;
use crate::allocation::{AllocationController, BlockAllocator};
use crate::config::{BatchingMode, ConfigError, FairnessKind, ReplicaConfig, SchedulerConfig};
use crate::error::SchedulerError;
use crate::fairness::{DampingTable, FairnessPolicy, FcfsPolicy, SelectionKey, ServedRound, VtcPolicy};
use crate::request::{ClientId, RequestId, ScheduledRequest};

/// Counters describing what the scheduler has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Calls to `get_next_batch`.
    pub ticks: u64,
    pub batches: u64,
    /// Ticks that produced no batch.
    pub idle_ticks: u64,
    /// Admissions from the waiting queue.
    pub admitted: u64,
    /// Preempted requests and running prefills placed in a batch again.
    pub resumed: u64,
    pub evictions: u64,
    pub completed: u64,
}

/// Scheduler for a single replica.
pub struct ReplicaScheduler<R: ScheduledRequest> {
    config: SchedulerConfig,
    micro_batch_size: usize,
    policy: Box<dyn FairnessPolicy>,
    allocator: Box<dyn AllocationController>,
    chunking: Box<dyn ChunkingStrategy>,
    requests: HashMap<RequestId, R>,
    waiting: WaitingQueue,
    preempted: PreemptedPool,
    in_flight: BTreeSet<BatchId>,
    next_batch_id: u64,
    stats: SchedulerStats,
}

impl<R: ScheduledRequest> ReplicaScheduler<R> {
    /// Create a scheduler. The configuration is validated again here.
    pub fn new(
        config: SchedulerConfig,
        allocator: Box<dyn AllocationController>,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(ConfigError::from)?;

        let policy: Box<dyn FairnessPolicy> = match config.fairness {
            FairnessKind::Vtc => Box::new(VtcPolicy::new(DampingTable::from_config(&config))),
            FairnessKind::Fcfs => Box::new(FcfsPolicy::new()),
        };
        let chunking: Box<dyn ChunkingStrategy> = match config.batching {
            BatchingMode::Whole => Box::new(WholePrefill),
            BatchingMode::Chunked { chunk_size } => Box::new(SarathiChunking::new(chunk_size)),
        };

        tracing::debug!(
            replica_id = config.replica_id,
            policy = policy.name(),
            batching = ?config.batching,
            admission = ?config.admission,
            "created replica scheduler"
        );

        Ok(Self {
            micro_batch_size: config.effective_micro_batch_size(),
            config,
            policy,
            allocator,
            chunking,
            requests: HashMap::new(),
            waiting: WaitingQueue::new(),
            preempted: PreemptedPool::new(),
            in_flight: BTreeSet::new(),
            next_batch_id: 0,
            stats: SchedulerStats::default(),
        })
    }

    /// Create a scheduler with a [`BlockAllocator`] sized by `config.allocator`.
    pub fn from_config(config: &ReplicaConfig) -> Result<Self, SchedulerError> {
        config.validate().map_err(ConfigError::from)?;
        Self::new(
            config.scheduler.clone(),
            Box::new(BlockAllocator::new(&config.allocator)),
        )
    }

    /// Replace the fairness policy. Must be called before any request is added.
    pub fn with_policy(mut self, policy: Box<dyn FairnessPolicy>) -> Self {
        debug_assert!(self.requests.is_empty());
        self.policy = policy;
        self
    }

    /// Replace the per-request chunk sizing.
    pub fn with_chunking(mut self, chunking: Box<dyn ChunkingStrategy>) -> Self {
        self.chunking = chunking;
        self
    }

    /// Enqueue a new request.
    pub fn add_request(&mut self, request: R) -> Result<(), SchedulerError> {
        let id = request.id();
        if self.requests.contains_key(&id) {
            return Err(SchedulerError::DuplicateRequest(id));
        }

        self.policy.on_arrival(&request);
        tracing::trace!(
            request_id = %id,
            client_id = %request.client_id(),
            num_prefill_tokens = request.num_prefill_tokens(),
            "request arrived"
        );
        self.requests.insert(id, request);
        self.waiting.push_back(id);
        Ok(())
    }

    /// Advance scheduling by one tick.
    ///
    /// Returns `None` when nothing could be admitted or resumed.
    pub fn get_next_batch(&mut self) -> Option<Batch> {
        self.stats.ticks += 1;

        let draft = match self.config.batching {
            BatchingMode::Whole => self.schedule_whole(),
            BatchingMode::Chunked { .. } => self.schedule_chunked(),
        };

        if draft.is_empty() {
            self.stats.idle_ticks += 1;
            tracing::trace!(
                num_waiting = self.waiting.len(),
                num_preempted = self.preempted.len(),
                "no batch this tick"
            );
            return None;
        }

        Some(self.emit(draft))
    }

    /// Form batches until every pipeline stage is busy or nothing is schedulable.
    pub fn on_schedule(&mut self) -> Vec<Batch> {
        let mut batches = Vec::new();
        while self.in_flight.len() < self.config.num_pipeline_stages {
            match self.get_next_batch() {
                Some(batch) => batches.push(batch),
                None => break,
            }
        }
        batches
    }

    /// Account a finished batch.
    ///
    /// Progress of every member is advanced, the fairness policy is charged,
    /// completed requests are freed and returned, and the rest wait in the
    /// preempted pool for their next round. Must be called exactly once for
    /// each batch returned by [`get_next_batch`](Self::get_next_batch).
    pub fn on_batch_end(&mut self, batch: &Batch) -> Result<Vec<R>, SchedulerError> {
        if batch.replica_id() != self.config.replica_id {
            return Err(SchedulerError::ReplicaMismatch {
                expected: self.config.replica_id,
                actual: batch.replica_id(),
            });
        }
        if !self.in_flight.contains(&batch.id()) {
            return Err(SchedulerError::UnknownBatch(batch.id()));
        }
        if let Some(entry) = batch
            .entries()
            .iter()
            .find(|e| !self.requests.contains_key(&e.request_id))
        {
            return Err(SchedulerError::UnknownRequest(entry.request_id));
        }
        self.in_flight.remove(&batch.id());

        for entry in batch.entries() {
            if let Some(request) = self.requests.get_mut(&entry.request_id) {
                request.on_batch_end(entry.num_tokens);
            }
        }

        let served: Vec<ServedRound<'_>> = batch
            .entries()
            .iter()
            .filter_map(|entry| {
                self.requests.get(&entry.request_id).map(|request| ServedRound {
                    request: request as &dyn ScheduledRequest,
                    num_tokens: entry.num_tokens,
                })
            })
            .collect();
        self.policy.on_batch_complete(&served);

        let mut completed = Vec::new();
        for entry in batch.entries() {
            let id = entry.request_id;
            let done = self.requests.get(&id).is_some_and(|r| r.is_completed());
            if !done {
                self.preempted.push_back(id);
                continue;
            }
            if let Err(error) = self.allocator.free(id) {
                tracing::error!(request_id = %id, %error, "completed request held no allocation");
                debug_assert!(false, "completed request {id} held no allocation: {error}");
            }
            if let Some(request) = self.requests.remove(&id) {
                completed.push(request);
            }
            self.stats.completed += 1;
        }

        tracing::debug!(
            batch_id = %batch.id(),
            num_completed = completed.len(),
            num_preempted = self.preempted.len(),
            "batch finished"
        );
        Ok(completed)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn policy(&self) -> &dyn FairnessPolicy {
        self.policy.as_ref()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn request(&self, id: RequestId) -> Option<&R> {
        self.requests.get(&id)
    }

    /// Fairness counter of `client`, if the policy keeps one.
    pub fn counter(&self, client: ClientId) -> Option<f64> {
        self.policy.counter(client)
    }

    pub fn waiting(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.waiting.iter()
    }

    pub fn preempted(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.preempted.iter()
    }

    pub fn num_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_preempted(&self) -> usize {
        self.preempted.len()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Requests holding an allocation.
    pub fn num_allocated(&self) -> usize {
        self.allocator.num_allocated()
    }

    pub fn is_allocated(&self, id: RequestId) -> bool {
        self.allocator.is_allocated(id)
    }

    /// No request is tracked and no batch is in flight.
    pub fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.in_flight.is_empty()
    }

    /// Look up a request that a queue refers to.
    fn tracked(&self, id: RequestId) -> Option<&R> {
        let request = self.requests.get(&id);
        if request.is_none() {
            tracing::error!(request_id = %id, "queued request is not tracked");
            debug_assert!(false, "queued request {id} is not tracked");
        }
        request
    }

    fn selection_key(&self, request: &R) -> SelectionKey {
        self.policy.selection_key(request)
    }

    /// Order items by the fairness key of their request, most favored first.
    fn rank<T>(&self, items: impl IntoIterator<Item = (RequestId, T)>) -> Vec<(RequestId, T)> {
        let mut keyed: Vec<(SelectionKey, RequestId, T)> = items
            .into_iter()
            .filter_map(|(id, item)| {
                self.tracked(id)
                    .map(|request| (self.selection_key(request), id, item))
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().map(|(_, id, item)| (id, item)).collect()
    }

    fn sort_preempted(&mut self) {
        let policy = &self.policy;
        let requests = &self.requests;
        self.preempted.sort_by_key(|id| {
            requests
                .get(id)
                .map(|request| policy.selection_key(request))
        });
    }

    /// Reserve capacity for a request that passed `can_allocate`.
    fn allocate(&mut self, id: RequestId) -> bool {
        let Some(request) = self.requests.get(&id) else {
            return false;
        };
        match self.allocator.allocate(request) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(request_id = %id, %error, "allocation failed after feasibility check");
                debug_assert!(false, "allocation failed for request {id}: {error}");
                false
            }
        }
    }

    /// Append an allocated request to the batch.
    fn push_entry(&mut self, id: RequestId, num_tokens: usize, draft: &mut BatchDraft) {
        let Some(request) = self.requests.get(&id) else {
            return;
        };
        self.policy.on_admitted(request);
        draft.push(BatchEntry {
            request_id: id,
            client_id: request.client_id(),
            num_tokens,
            is_prefill: !request.is_prefill_complete(),
        });
    }

    fn emit(&mut self, draft: BatchDraft) -> Batch {
        let id = BatchId(self.next_batch_id);
        self.next_batch_id += 1;

        let batch = Batch::new(self.config.replica_id, id, draft.into_entries());
        self.in_flight.insert(id);
        self.stats.batches += 1;

        tracing::debug!(
            replica_id = self.config.replica_id,
            batch_id = %id,
            num_requests = batch.len(),
            num_tokens = batch.total_tokens(),
            width = batch.width(),
            requests = ?batch.request_ids().collect::<Vec<_>>(),
            "formed batch"
        );
        batch
    }
}
