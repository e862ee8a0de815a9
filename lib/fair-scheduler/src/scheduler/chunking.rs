// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-request token counts for the next round.

use crate::request::ScheduledRequest;

/// Decides how many tokens a request processes if added to the current batch.
///
/// Returning 0 means the request cannot take part in this batch.
pub trait ChunkingStrategy: Send {
    fn next_num_tokens(
        &self,
        request: &dyn ScheduledRequest,
        batch_contains_prefill: bool,
        num_batch_tokens: usize,
    ) -> usize;
}

/// Runs the whole remaining prefill in one round, then one token per decode round.
#[derive(Debug, Default, Clone, Copy)]
pub struct WholePrefill;

impl ChunkingStrategy for WholePrefill {
    fn next_num_tokens(
        &self,
        request: &dyn ScheduledRequest,
        _batch_contains_prefill: bool,
        _num_batch_tokens: usize,
    ) -> usize {
        if request.is_prefill_complete() {
            return 1;
        }
        request
            .num_prefill_tokens()
            .saturating_sub(request.num_processed_tokens())
    }
}

/// Sarathi-style chunked prefill.
///
/// A batch holds at most one prefill chunk, sized to what is left of
/// `chunk_size` after the tokens already committed in the batch. Decodes always
/// get one token.
#[derive(Debug, Clone, Copy)]
pub struct SarathiChunking {
    chunk_size: usize,
}

impl SarathiChunking {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }
}

impl ChunkingStrategy for SarathiChunking {
    fn next_num_tokens(
        &self,
        request: &dyn ScheduledRequest,
        batch_contains_prefill: bool,
        num_batch_tokens: usize,
    ) -> usize {
        if request.is_prefill_complete() {
            return 1;
        }
        if batch_contains_prefill {
            return 0;
        }
        let remaining = request
            .num_prefill_tokens()
            .saturating_sub(request.num_processed_tokens());
        remaining.min(self.chunk_size.saturating_sub(num_batch_tokens))
    }
}
