// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Replica resource allocation.
//!
//! The scheduler only depends on [`AllocationController`]. [`BlockAllocator`]
//! is a paged KV-cache model: capacity is a pool of fixed-size blocks and each
//! request holds enough blocks for the tokens it has processed.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::BlockAllocatorConfig;
use crate::request::{RequestId, ScheduledRequest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("request {request_id} needs {required} blocks but only {available} are free")]
    Insufficient {
        request_id: RequestId,
        required: usize,
        available: usize,
    },

    #[error("request {0} holds no allocation")]
    NotAllocated(RequestId),
}

/// Admission and reservation of replica resources.
///
/// `allocate` must only follow a successful `can_allocate` for the same
/// request, and every successful first allocation is released by exactly one
/// `free`.
pub trait AllocationController: Send {
    /// Whether `request` can be given what it needs for its next round.
    fn can_allocate(&self, request: &dyn ScheduledRequest) -> bool;

    /// Reserve capacity for `request`. Growing an existing reservation is allowed.
    fn allocate(&mut self, request: &dyn ScheduledRequest) -> Result<(), AllocationError>;

    /// Release everything held by `request_id`.
    fn free(&mut self, request_id: RequestId) -> Result<(), AllocationError>;

    fn is_allocated(&self, request_id: RequestId) -> bool;

    /// Number of requests currently holding a reservation.
    fn num_allocated(&self) -> usize;
}

/// Block-granular allocator with a free-block watermark for new admissions.
#[derive(Debug)]
pub struct BlockAllocator {
    num_blocks: usize,
    block_size: usize,
    watermark_blocks: usize,
    num_allocated_blocks: usize,
    allocation_map: BTreeMap<RequestId, usize>,
}

impl BlockAllocator {
    pub fn new(config: &BlockAllocatorConfig) -> Self {
        Self {
            num_blocks: config.num_blocks,
            block_size: config.block_size,
            watermark_blocks: config.watermark_blocks(),
            num_allocated_blocks: 0,
            allocation_map: BTreeMap::new(),
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn free_blocks(&self) -> usize {
        self.num_blocks - self.num_allocated_blocks
    }

    pub fn num_allocated_blocks(&self) -> usize {
        self.num_allocated_blocks
    }

    /// Blocks currently reserved by `request_id`.
    pub fn blocks_of(&self, request_id: RequestId) -> Option<usize> {
        self.allocation_map.get(&request_id).copied()
    }

    fn blocks_needed(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    /// Blocks to add to an existing reservation of `held` blocks.
    fn growth(&self, request: &dyn ScheduledRequest, held: usize) -> usize {
        let reserved_tokens = held * self.block_size;
        self.blocks_needed(request.num_processed_tokens().saturating_sub(reserved_tokens))
    }
}

impl AllocationController for BlockAllocator {
    fn can_allocate(&self, request: &dyn ScheduledRequest) -> bool {
        match self.allocation_map.get(&request.id()) {
            // New requests reserve their whole prefill and must leave the watermark intact.
            None => {
                let required = self.blocks_needed(request.num_prefill_tokens());
                self.free_blocks()
                    .checked_sub(required)
                    .is_some_and(|left| left >= self.watermark_blocks)
            }
            Some(&held) => self.growth(request, held) <= self.free_blocks(),
        }
    }

    fn allocate(&mut self, request: &dyn ScheduledRequest) -> Result<(), AllocationError> {
        let request_id = request.id();
        let required = match self.allocation_map.get(&request_id) {
            None => self.blocks_needed(request.num_prefill_tokens()),
            Some(&held) => self.growth(request, held),
        };

        if required > self.free_blocks() {
            return Err(AllocationError::Insufficient {
                request_id,
                required,
                available: self.free_blocks(),
            });
        }

        self.num_allocated_blocks += required;
        *self.allocation_map.entry(request_id).or_insert(0) += required;
        tracing::trace!(
            request_id = %request_id,
            blocks = required,
            free_blocks = self.free_blocks(),
            "allocated blocks"
        );
        Ok(())
    }

    fn free(&mut self, request_id: RequestId) -> Result<(), AllocationError> {
        let held = self
            .allocation_map
            .remove(&request_id)
            .ok_or(AllocationError::NotAllocated(request_id))?;
        self.num_allocated_blocks -= held;
        tracing::trace!(
            request_id = %request_id,
            blocks = held,
            free_blocks = self.free_blocks(),
            "freed blocks"
        );
        Ok(())
    }

    fn is_allocated(&self, request_id: RequestId) -> bool {
        self.allocation_map.contains_key(&request_id)
    }

    fn num_allocated(&self) -> usize {
        self.allocation_map.len()
    }
}
