// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Greedy, fairness-ordered admission for whole-prefill batching.

use super::batch::BatchDraft;
use super::ReplicaScheduler;
use crate::config::AdmissionPolicy;
use crate::request::{RequestId, ScheduledRequest};

/// Why a candidate could not join the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Blocked {
    MicroBatchFull,
    ConcurrencyCap,
    NoChunkBudget,
    TokenBudget,
    Allocation,
}

impl Blocked {
    /// Limits that no other candidate can get past either.
    pub(super) fn is_global(self) -> bool {
        matches!(self, Self::MicroBatchFull | Self::ConcurrencyCap)
    }
}

impl<R: ScheduledRequest> ReplicaScheduler<R> {
    pub(super) fn schedule_whole(&mut self) -> BatchDraft {
        let mut draft = BatchDraft::default();
        self.admit_waiting(&mut draft);
        if draft.is_empty() {
            self.resume_preempted(&mut draft);
        }
        draft
    }

    /// Budget checks for a candidate, in order: micro-batch size, concurrency
    /// cap (new allocations only), chunk budget, token width, allocation.
    pub(super) fn check_candidate(
        &self,
        request: &R,
        num_tokens: usize,
        needs_new_allocation: bool,
        draft: &BatchDraft,
    ) -> Result<(), Blocked> {
        if draft.len() >= self.micro_batch_size {
            return Err(Blocked::MicroBatchFull);
        }
        if needs_new_allocation && self.allocator.num_allocated() >= self.config.batch_size_cap {
            return Err(Blocked::ConcurrencyCap);
        }
        if num_tokens == 0 {
            return Err(Blocked::NoChunkBudget);
        }
        if !draft.fits_width(num_tokens, self.config.max_tokens_in_batch) {
            return Err(Blocked::TokenBudget);
        }
        if !self.allocator.can_allocate(request) {
            return Err(Blocked::Allocation);
        }
        Ok(())
    }

    /// Whether the scan continues past a blocked candidate.
    pub(super) fn continue_after(&self, id: RequestId, blocked: Blocked) -> bool {
        let skip = !blocked.is_global() && self.config.admission == AdmissionPolicy::SkipInfeasible;
        tracing::trace!(request_id = %id, ?blocked, skip, "candidate not admitted");
        skip
    }

    /// Admit waiting requests in fairness order.
    fn admit_waiting(&mut self, draft: &mut BatchDraft) {
        let ranked = self.rank(self.waiting.iter().map(|id| (id, ())));

        for (id, ()) in ranked {
            let Some(request) = self.tracked(id) else {
                continue;
            };
            let num_tokens = self.chunking.next_num_tokens(
                request,
                draft.contains_prefill(),
                draft.total_tokens(),
            );

            if let Err(blocked) = self.check_candidate(request, num_tokens, true, draft) {
                if self.continue_after(id, blocked) {
                    continue;
                }
                break;
            }

            if !self.allocate(id) {
                break;
            }
            self.waiting.remove(id);
            self.push_entry(id, num_tokens, draft);
            self.stats.admitted += 1;
        }
    }
}
