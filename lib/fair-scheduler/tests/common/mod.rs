// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic replay harness driving a replica scheduler step by step.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use dynamo_fair_scheduler::fairness::split_round;
use dynamo_fair_scheduler::{
    Batch, ClientAssignmentGenerator, ClientId, ReplicaConfig, ReplicaScheduler, RequestId,
    ScheduledRequest, SimRequest,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Random workload shape.
#[derive(Debug, Clone)]
pub struct Workload {
    pub seed: u64,
    pub max_arrivals_per_step: usize,
    pub prefill_tokens: RangeInclusive<usize>,
    pub decode_tokens: RangeInclusive<usize>,
}

pub struct ReplicaHarness {
    pub scheduler: ReplicaScheduler<SimRequest>,
    config: ReplicaConfig,
    clients: Box<dyn ClientAssignmentGenerator>,
    rng: ChaCha8Rng,
    next_request_id: u64,
    step: usize,
    outstanding: BTreeMap<ClientId, usize>,
    /// Service admitted per client, in undamped units.
    pub served: BTreeMap<ClientId, f64>,
    /// Every batch formed so far, in order.
    pub batches: Vec<Batch>,
}

impl ReplicaHarness {
    pub fn new(config: ReplicaConfig, seed: u64) -> anyhow::Result<Self> {
        dynamo_fair_scheduler::logging::init();

        let scheduler = ReplicaScheduler::from_config(&config)?;
        let clients = config
            .client_assignment
            .clone()
            .unwrap_or_default()
            .build()?;

        Ok(Self {
            scheduler,
            config,
            clients,
            rng: ChaCha8Rng::seed_from_u64(seed),
            next_request_id: 0,
            step: 0,
            outstanding: BTreeMap::new(),
            served: BTreeMap::new(),
            batches: Vec::new(),
        })
    }

    pub fn submit(&mut self, client: ClientId, prefill: usize, decode: usize) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;

        let request = SimRequest::new(id, client, self.step as f64, prefill, decode)
            .with_cost_factors(self.config.service_cost);
        self.scheduler
            .add_request(request)
            .expect("fresh request id");
        *self.outstanding.entry(client).or_insert(0) += 1;
        id
    }

    /// Submit up to `workload.max_arrivals_per_step` random requests.
    pub fn submit_random(&mut self, workload: &Workload) {
        let arrivals = self.rng.random_range(0..=workload.max_arrivals_per_step);
        for _ in 0..arrivals {
            let client = self.clients.next_client_id();
            let prefill = self.rng.random_range(workload.prefill_tokens.clone());
            let decode = self.rng.random_range(workload.decode_tokens.clone());
            self.submit(client, prefill, decode);
        }
    }

    /// Keep `backlog` unfinished requests per client.
    pub fn top_up(&mut self, clients: &[ClientId], backlog: usize, prefill: usize, decode: usize) {
        for client in clients {
            while self.outstanding.get(client).copied().unwrap_or(0) < backlog {
                self.submit(*client, prefill, decode);
            }
        }
    }

    /// Fill the pipeline, finish every batch and check batch invariants.
    pub fn step(&mut self) -> Vec<Batch> {
        self.step += 1;
        let batches = self.scheduler.on_schedule();

        let scheduler_config = self.config.scheduler.clone();
        assert!(
            self.scheduler.num_allocated() <= scheduler_config.batch_size_cap,
            "allocation cap exceeded"
        );

        for batch in &batches {
            assert!(batch.width() <= scheduler_config.max_tokens_in_batch);
            assert!(batch.len() <= scheduler_config.effective_micro_batch_size());
            self.record_service(batch);
        }

        for batch in &batches {
            let completed = self
                .scheduler
                .on_batch_end(batch)
                .expect("batch accepted");
            for request in completed {
                if let Some(count) = self.outstanding.get_mut(&request.client_id()) {
                    *count -= 1;
                }
            }
        }

        self.batches.extend(batches.iter().cloned());
        batches
    }

    pub fn run(&mut self, steps: usize, workload: &Workload) {
        for _ in 0..steps {
            self.submit_random(workload);
            self.step();
        }
    }

    pub fn served(&self, client: ClientId) -> f64 {
        self.served.get(&client).copied().unwrap_or(0.0)
    }

    fn record_service(&mut self, batch: &Batch) {
        for entry in batch.entries() {
            let Some(request) = self.scheduler.request(entry.request_id) else {
                continue;
            };
            let split = split_round(
                request.num_prefill_tokens(),
                request.num_processed_tokens() + entry.num_tokens,
                entry.num_tokens,
            );
            *self.served.entry(entry.client_id).or_insert(0.0) += self
                .config
                .service_cost
                .service_for(split.prefill, split.decode);
        }
    }
}
