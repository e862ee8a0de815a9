// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fairness policies that rank queued requests and account served work.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::{round_service, VirtualCounterLedger};
use crate::config::SchedulerConfig;
use crate::request::{ClientId, RequestId, ScheduledRequest};

/// Ordering key for request selection. Lower keys are scheduled first.
///
/// Ties on the counter fall back to arrival time and then to the request id,
/// which makes the order total and replayable.
#[derive(Debug, Clone, Copy)]
pub struct SelectionKey {
    pub counter: f64,
    pub arrived_at: f64,
    pub request_id: RequestId,
}

impl Ord for SelectionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .total_cmp(&other.counter)
            .then_with(|| self.arrived_at.total_cmp(&other.arrived_at))
            .then_with(|| self.request_id.cmp(&other.request_id))
    }
}

impl PartialOrd for SelectionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SelectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SelectionKey {}

/// One request's share of a finished batch, after its progress was advanced.
pub struct ServedRound<'a> {
    pub request: &'a dyn ScheduledRequest,
    pub num_tokens: usize,
}

/// Pluggable fairness policy used by the replica scheduler.
///
/// The policy decides the order in which candidates are considered and how
/// completed work is accounted. It never touches queues or allocations.
pub trait FairnessPolicy: Send {
    fn name(&self) -> &'static str;

    /// Called once when a request enters the replica.
    fn on_arrival(&mut self, request: &dyn ScheduledRequest);

    /// Ranking key for a candidate request.
    fn selection_key(&self, request: &dyn ScheduledRequest) -> SelectionKey;

    /// Called when a request is placed in a batch.
    fn on_admitted(&mut self, _request: &dyn ScheduledRequest) {}

    /// Account the work of a finished batch.
    fn on_batch_complete(&mut self, served: &[ServedRound<'_>]);

    /// Current counter of `client`, if the policy keeps one.
    fn counter(&self, client: ClientId) -> Option<f64>;
}

/// Per-client damping factors. Service charged to a client is divided by its factor.
#[derive(Debug, Clone)]
pub struct DampingTable {
    default: f64,
    per_client: BTreeMap<ClientId, f64>,
}

impl DampingTable {
    pub fn new(default: f64) -> Self {
        Self {
            default,
            per_client: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        let mut table = Self::new(config.default_damping);
        for entry in &config.client_damping {
            table.per_client.insert(entry.client_id, entry.damping);
        }
        table
    }

    pub fn with_client(mut self, client: ClientId, damping: f64) -> Self {
        self.per_client.insert(client, damping);
        self
    }

    pub fn get(&self, client: ClientId) -> f64 {
        self.per_client.get(&client).copied().unwrap_or(self.default)
    }
}

impl Default for DampingTable {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Virtual Token Counter policy.
///
/// Requests of the least-served client go first. Every finished round charges
/// the client its damped service cost, so clients with a larger damping factor
/// receive proportionally more service.
#[derive(Debug, Default)]
pub struct VtcPolicy {
    ledger: VirtualCounterLedger,
    damping: DampingTable,
    last_client_scheduled: Option<ClientId>,
}

impl VtcPolicy {
    pub fn new(damping: DampingTable) -> Self {
        Self {
            ledger: VirtualCounterLedger::new(),
            damping,
            last_client_scheduled: None,
        }
    }

    pub fn ledger(&self) -> &VirtualCounterLedger {
        &self.ledger
    }

    pub fn last_client_scheduled(&self) -> Option<ClientId> {
        self.last_client_scheduled
    }
}

impl FairnessPolicy for VtcPolicy {
    fn name(&self) -> &'static str {
        "vtc"
    }

    fn on_arrival(&mut self, request: &dyn ScheduledRequest) {
        self.ledger.on_arrival(request.client_id());
    }

    fn selection_key(&self, request: &dyn ScheduledRequest) -> SelectionKey {
        SelectionKey {
            counter: self.ledger.get(request.client_id()),
            arrived_at: request.arrived_at(),
            request_id: request.id(),
        }
    }

    fn on_admitted(&mut self, request: &dyn ScheduledRequest) {
        self.last_client_scheduled = Some(request.client_id());
    }

    fn on_batch_complete(&mut self, served: &[ServedRound<'_>]) {
        let mut per_client: BTreeMap<ClientId, f64> = BTreeMap::new();
        for round in served {
            *per_client.entry(round.request.client_id()).or_insert(0.0) +=
                round_service(round.request, round.num_tokens);
        }

        for (client, service) in per_client {
            let charged = service / self.damping.get(client);
            self.ledger.charge(client, charged);
            tracing::trace!(
                client_id = %client,
                service,
                charged,
                counter = self.ledger.get(client),
                "charged client"
            );
        }
    }

    fn counter(&self, client: ClientId) -> Option<f64> {
        self.ledger.contains(client).then(|| self.ledger.get(client))
    }
}

/// First-come-first-served baseline: order by arrival only, no accounting.
#[derive(Debug, Default, Clone)]
pub struct FcfsPolicy;

impl FcfsPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl FairnessPolicy for FcfsPolicy {
    fn name(&self) -> &'static str {
        "fcfs"
    }

    fn on_arrival(&mut self, _request: &dyn ScheduledRequest) {}

    fn selection_key(&self, request: &dyn ScheduledRequest) -> SelectionKey {
        SelectionKey {
            counter: 0.0,
            arrived_at: request.arrived_at(),
            request_id: request.id(),
        }
    }

    fn on_batch_complete(&mut self, _served: &[ServedRound<'_>]) {}

    fn counter(&self, _client: ClientId) -> Option<f64> {
        None
    }
}
