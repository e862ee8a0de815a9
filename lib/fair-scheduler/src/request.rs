// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request contract consumed by the scheduler, plus a simulated request.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fairness::ServiceCostFactors;

/// Identity of a request within a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant that issued a request. Fairness is accounted per client.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operations the scheduler needs from a request.
///
/// The scheduler never owns the semantics of progress: it asks the request how
/// far it has come and how much its work costs, and only mutates it through
/// [`on_batch_end`](Self::on_batch_end) and [`restart`](Self::restart).
pub trait ScheduledRequest: Send {
    fn id(&self) -> RequestId;

    fn client_id(&self) -> ClientId;

    /// Arrival timestamp, used as the fairness tie-breaker.
    fn arrived_at(&self) -> f64;

    fn num_prefill_tokens(&self) -> usize;

    fn num_processed_tokens(&self) -> usize;

    fn is_prefill_complete(&self) -> bool {
        self.num_processed_tokens() >= self.num_prefill_tokens()
    }

    /// Whether all prefill and decode tokens have been processed.
    fn is_completed(&self) -> bool;

    /// Service units for processing `num_tokens` prefill tokens.
    fn prefill_token_cost(&self, num_tokens: usize) -> f64;

    /// Service units for one decode token.
    fn decode_token_cost(&self) -> f64;

    /// Advance progress after a batch containing this request finished.
    fn on_batch_end(&mut self, num_tokens: usize);

    /// Drop all progress so the request is recomputed from scratch.
    fn restart(&mut self);
}

/// A simulated inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimRequest {
    id: RequestId,
    client_id: ClientId,
    arrived_at: f64,
    num_prefill_tokens: usize,
    num_decode_tokens: usize,
    num_processed_tokens: usize,
    num_restarts: usize,
    cost: ServiceCostFactors,
}

impl SimRequest {
    pub fn new(
        id: RequestId,
        client_id: ClientId,
        arrived_at: f64,
        num_prefill_tokens: usize,
        num_decode_tokens: usize,
    ) -> Self {
        Self {
            id,
            client_id,
            arrived_at,
            num_prefill_tokens,
            num_decode_tokens,
            num_processed_tokens: 0,
            num_restarts: 0,
            cost: ServiceCostFactors::default(),
        }
    }

    pub fn with_cost_factors(mut self, cost: ServiceCostFactors) -> Self {
        self.cost = cost;
        self
    }

    pub fn num_decode_tokens(&self) -> usize {
        self.num_decode_tokens
    }

    pub fn total_tokens(&self) -> usize {
        self.num_prefill_tokens + self.num_decode_tokens
    }

    /// Number of times this request was evicted and restarted.
    pub fn num_restarts(&self) -> usize {
        self.num_restarts
    }

    /// Service this request represents if run to completion.
    pub fn total_service(&self) -> f64 {
        self.cost
            .service_for(self.num_prefill_tokens, self.num_decode_tokens)
    }
}

impl ScheduledRequest for SimRequest {
    fn id(&self) -> RequestId {
        self.id
    }

    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn arrived_at(&self) -> f64 {
        self.arrived_at
    }

    fn num_prefill_tokens(&self) -> usize {
        self.num_prefill_tokens
    }

    fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    fn is_completed(&self) -> bool {
        self.num_processed_tokens >= self.total_tokens()
    }

    fn prefill_token_cost(&self, num_tokens: usize) -> f64 {
        self.cost.prefill * num_tokens as f64
    }

    fn decode_token_cost(&self) -> f64 {
        self.cost.decode
    }

    fn on_batch_end(&mut self, num_tokens: usize) {
        self.num_processed_tokens = (self.num_processed_tokens + num_tokens).min(self.total_tokens());
    }

    // Tokens already generated become part of the context that has to be
    // prefilled again; the total amount of work is unchanged.
    fn restart(&mut self) {
        let total = self.total_tokens();
        self.num_prefill_tokens = self.num_prefill_tokens.max(self.num_processed_tokens);
        self.num_decode_tokens = total - self.num_prefill_tokens;
        self.num_processed_tokens = 0;
        self.num_restarts += 1;
    }
}
