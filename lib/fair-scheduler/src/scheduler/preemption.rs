// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Resuming preempted requests and evicting victims under memory pressure.

use super::batch::BatchDraft;
use super::ReplicaScheduler;
use crate::request::{RequestId, ScheduledRequest};

/// Outcome of trying to give a preempted request what it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Resume {
    Allocated,
    /// No victim was left, so the request itself was evicted.
    Evicted,
    Failed,
}

impl<R: ScheduledRequest> ReplicaScheduler<R> {
    /// Resume preempted requests in fairness order.
    ///
    /// Stops at the first request that does not fit the batch. Every
    /// iteration either places a request, evicts one, or ends the pass.
    pub(super) fn resume_preempted(&mut self, draft: &mut BatchDraft) {
        self.sort_preempted();

        while let Some(id) = self.preempted.pop_front() {
            let Some(request) = self.tracked(id) else {
                continue;
            };
            let num_tokens = self.chunking.next_num_tokens(
                request,
                draft.contains_prefill(),
                draft.total_tokens(),
            );

            if draft.len() >= self.micro_batch_size
                || num_tokens == 0
                || !draft.fits_width(num_tokens, self.config.max_tokens_in_batch)
            {
                self.preempted.push_front(id);
                break;
            }

            match self.allocate_or_evict(id) {
                Resume::Allocated => {
                    self.push_entry(id, num_tokens, draft);
                    self.stats.resumed += 1;
                }
                Resume::Evicted => break,
                Resume::Failed => {
                    self.preempted.push_front(id);
                    break;
                }
            }
        }
    }

    /// Allocate for `id`, evicting the least favored preempted requests until
    /// it fits. With nobody left to evict, `id` is evicted instead.
    ///
    /// `id` must already be out of the preempted pool.
    pub(super) fn allocate_or_evict(&mut self, id: RequestId) -> Resume {
        loop {
            let Some(request) = self.tracked(id) else {
                return Resume::Failed;
            };
            if self.allocator.can_allocate(request) {
                return if self.allocate(id) {
                    Resume::Allocated
                } else {
                    Resume::Failed
                };
            }

            match self.preempted.pop_back() {
                Some(victim) => self.evict(victim),
                None => {
                    self.evict(id);
                    return Resume::Evicted;
                }
            }
        }
    }

    /// Restart a request, release its allocation and requeue it at the head
    /// of the waiting queue.
    pub(super) fn evict(&mut self, id: RequestId) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.restart();
        }
        if let Err(error) = self.allocator.free(id) {
            tracing::error!(request_id = %id, %error, "evicted request held no allocation");
            debug_assert!(false, "evicted request {id} held no allocation: {error}");
        }
        self.waiting.push_front(id);
        self.stats.evictions += 1;

        tracing::debug!(
            request_id = %id,
            num_waiting = self.waiting.len(),
            num_preempted = self.preempted.len(),
            "evicted request"
        );
    }
}
