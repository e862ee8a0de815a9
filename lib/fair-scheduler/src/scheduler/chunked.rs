// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Chunked-prefill batch formation.
//!
//! Preempted requests whose prefill is done resume as one-token decode
//! continuations. Preempted requests still mid-prefill ("running prefills")
//! are ranked together with the waiting queue, so a fresh request of a
//! less-served client can take the prefill slot ahead of a running prefill.
//! Whatever does not make it into the batch is merged back into the preempted
//! pool and re-sorted, since counters move every tick.

use super::batch::BatchDraft;
use super::preemption::Resume;
use super::ReplicaScheduler;
use crate::request::{RequestId, ScheduledRequest};

/// Where a prefill candidate comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    RunningPrefill,
    Waiting,
}

impl<R: ScheduledRequest> ReplicaScheduler<R> {
    pub(super) fn schedule_chunked(&mut self) -> BatchDraft {
        let mut draft = BatchDraft::default();
        let mut running_prefills = Vec::new();
        let mut skipped = Vec::new();

        self.resume_decodes(&mut draft, &mut running_prefills, &mut skipped);
        self.admit_prefill_chunks(&mut draft, &mut running_prefills);

        self.preempted.extend(skipped);
        self.preempted.extend(running_prefills);
        self.sort_preempted();

        draft
    }

    /// Resume decode continuations in fairness order and set aside running prefills.
    fn resume_decodes(
        &mut self,
        draft: &mut BatchDraft,
        running_prefills: &mut Vec<RequestId>,
        skipped: &mut Vec<RequestId>,
    ) {
        self.sort_preempted();

        while let Some(id) = self.preempted.pop_front() {
            if draft.len() >= self.micro_batch_size {
                self.preempted.push_front(id);
                break;
            }
            let Some(request) = self.tracked(id) else {
                continue;
            };
            if !request.is_prefill_complete() {
                running_prefills.push(id);
                continue;
            }

            let num_tokens = self.chunking.next_num_tokens(
                request,
                draft.contains_prefill(),
                draft.total_tokens(),
            );
            if num_tokens == 0 || !draft.fits_width(num_tokens, self.config.max_tokens_in_batch) {
                skipped.push(id);
                continue;
            }

            match self.allocate_or_evict(id) {
                Resume::Allocated => {
                    self.push_entry(id, num_tokens, draft);
                    self.stats.resumed += 1;
                }
                Resume::Evicted => {}
                Resume::Failed => skipped.push(id),
            }
        }
    }

    /// Fill the batch's prefill slot from running prefills and the waiting
    /// queue, ranked jointly.
    fn admit_prefill_chunks(&mut self, draft: &mut BatchDraft, running_prefills: &mut Vec<RequestId>) {
        let candidates = running_prefills
            .iter()
            .map(|id| (*id, Origin::RunningPrefill))
            .chain(self.waiting.iter().map(|id| (id, Origin::Waiting)));
        let ranked = self.rank(candidates.collect::<Vec<_>>());

        for (id, origin) in ranked {
            let Some(request) = self.tracked(id) else {
                continue;
            };
            let num_tokens = self.chunking.next_num_tokens(
                request,
                draft.contains_prefill(),
                draft.total_tokens(),
            );

            let fresh = origin == Origin::Waiting;
            if let Err(blocked) = self.check_candidate(request, num_tokens, fresh, draft) {
                if self.continue_after(id, blocked) {
                    continue;
                }
                break;
            }

            if !self.allocate(id) {
                continue;
            }
            self.push_entry(id, num_tokens, draft);
            match origin {
                Origin::Waiting => {
                    self.waiting.remove(id);
                    self.stats.admitted += 1;
                }
                Origin::RunningPrefill => {
                    running_prefills.retain(|r| *r != id);
                    self.stats.resumed += 1;
                }
            }
        }
    }
}
