// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fair batch scheduling for simulated inference replicas.
//!
//! A [`ReplicaScheduler`] admits, batches and preempts requests of many
//! clients on a single replica. Clients are ordered by a Virtual Token Counter
//! ledger, so the least-served client goes first, while batches respect the
//! replica's request, token and KV-cache budgets.
//!
//! ```rust,ignore
//! let config = ReplicaConfig::from_env()?;
//! let mut scheduler = ReplicaScheduler::<SimRequest>::from_config(&config)?;
//! scheduler.add_request(SimRequest::new(RequestId(0), ClientId(0), 0.0, 128, 16))?;
//! while let Some(batch) = scheduler.get_next_batch() {
//!     let completed = scheduler.on_batch_end(&batch)?;
//! }
//! ```

pub mod allocation;
pub mod client;
pub mod config;
pub mod error;
pub mod fairness;
pub mod logging;
pub mod request;
pub mod scheduler;

pub use allocation::{AllocationController, AllocationError, BlockAllocator};
pub use client::{
    BinomialClientAssignmentConfig, BinomialClientAssignmentGenerator, ClientAssignmentConfig,
    ClientAssignmentGenerator, FixedClientAssignmentGenerator,
};
pub use config::{
    AdmissionPolicy, BatchingMode, BlockAllocatorConfig, ClientDamping, ConfigError,
    FairnessKind, ReplicaConfig, SchedulerConfig,
};
pub use error::SchedulerError;
pub use fairness::{
    DampingTable, FairnessPolicy, FcfsPolicy, SelectionKey, ServiceCostFactors,
    VirtualCounterLedger, VtcPolicy,
};
pub use request::{ClientId, RequestId, ScheduledRequest, SimRequest};
pub use scheduler::{
    Batch, BatchEntry, BatchId, ChunkingStrategy, ReplicaScheduler, SarathiChunking,
    SchedulerStats, WholePrefill,
};
