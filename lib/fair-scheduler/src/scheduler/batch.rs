// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Batches produced by the scheduler.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::request::{ClientId, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request and the tokens it processes in this batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub request_id: RequestId,
    pub client_id: ClientId,
    pub num_tokens: usize,
    /// The request still had prefill work when the batch was formed.
    pub is_prefill: bool,
}

/// Ordered set of requests advanced together in one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    replica_id: u32,
    id: BatchId,
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new(replica_id: u32, id: BatchId, entries: Vec<BatchEntry>) -> Self {
        Self {
            replica_id,
            id,
            entries,
        }
    }

    pub fn replica_id(&self) -> u32 {
        self.replica_id
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn request_ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.entries.iter().map(|e| e.request_id)
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.entries.iter().any(|e| e.request_id == request_id)
    }

    /// Sum of tokens over all entries.
    pub fn total_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.num_tokens).sum()
    }

    pub fn max_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.num_tokens).max().unwrap_or(0)
    }

    /// Tokens the batch occupies when every member runs as wide as the largest.
    pub fn width(&self) -> usize {
        self.len() * self.max_tokens()
    }
}

/// Batch under construction within a tick.
#[derive(Debug, Default)]
pub(super) struct BatchDraft {
    entries: Vec<BatchEntry>,
    max_tokens: usize,
    total_tokens: usize,
    contains_prefill: bool,
}

impl BatchDraft {
    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(super) fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub(super) fn contains_prefill(&self) -> bool {
        self.contains_prefill
    }

    /// Whether one more member with `num_tokens` keeps
    /// `members * max_tokens_per_member` within `budget`.
    pub(super) fn fits_width(&self, num_tokens: usize, budget: usize) -> bool {
        (self.entries.len() + 1)
            .checked_mul(self.max_tokens.max(num_tokens))
            .is_some_and(|width| width <= budget)
    }

    pub(super) fn push(&mut self, entry: BatchEntry) {
        self.max_tokens = self.max_tokens.max(entry.num_tokens);
        self.total_tokens += entry.num_tokens;
        self.contains_prefill |= entry.is_prefill;
        self.entries.push(entry);
    }

    pub(super) fn into_entries(self) -> Vec<BatchEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, num_tokens: usize, is_prefill: bool) -> BatchEntry {
        BatchEntry {
            request_id: RequestId(id),
            client_id: ClientId(0),
            num_tokens,
            is_prefill,
        }
    }

    #[test]
    fn test_width_uses_largest_member() {
        let mut draft = BatchDraft::default();
        assert!(draft.fits_width(10, 10));
        draft.push(entry(0, 10, true));

        // 2 * 10 > 16 even though 10 + 1 would fit a sum budget
        assert!(!draft.fits_width(1, 16));
        assert!(draft.fits_width(1, 20));
        draft.push(entry(1, 1, false));

        assert!(draft.contains_prefill());
        assert_eq!(draft.total_tokens(), 11);

        let batch = Batch::new(0, BatchId(0), draft.into_entries());
        assert_eq!(batch.width(), 20);
        assert_eq!(batch.total_tokens(), 11);
        assert!(batch.contains(RequestId(1)));
    }
}
