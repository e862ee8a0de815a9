// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Errors surfaced by the replica scheduler.

use thiserror::Error;

use crate::allocation::AllocationError;
use crate::config::ConfigError;
use crate::request::RequestId;
use crate::scheduler::BatchId;

/// Errors returned by [`ReplicaScheduler`](crate::scheduler::ReplicaScheduler).
///
/// Recoverable scheduling outcomes (nothing admissible this tick, no victim to
/// evict) are not errors; they surface as `None` from `get_next_batch`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("request {0} is already tracked by this replica")]
    DuplicateRequest(RequestId),

    #[error("request {0} is not tracked by this replica")]
    UnknownRequest(RequestId),

    #[error("batch {0} is not in flight on this replica")]
    UnknownBatch(BatchId),

    #[error("batch belongs to replica {actual}, expected replica {expected}")]
    ReplicaMismatch { expected: u32, actual: u32 },

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}
