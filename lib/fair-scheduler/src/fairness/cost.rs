// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Service cost model.
//!
//! A scheduling round may straddle the prefill/decode boundary: a request with
//! 2 prefill tokens left that is given 4 tokens finishes its prefill and
//! decodes 2 tokens in the same round. The split below counts tokens on each
//! side of the boundary using the progress recorded before the round.
//!
//! Checking only whether the prefill is complete after the round charges such
//! a round entirely at the decode rate, which disagrees with this split exactly
//! on straddling rounds. Token accounting is the method used here.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::request::ScheduledRequest;

/// Tokens processed in one round, split by phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundTokens {
    pub prefill: usize,
    pub decode: usize,
}

/// Split a round of `num_tokens` into prefill and decode tokens.
///
/// `num_processed_after` is the request's progress once the round finished.
pub fn split_round(
    num_prefill_tokens: usize,
    num_processed_after: usize,
    num_tokens: usize,
) -> RoundTokens {
    let tokens_before = num_processed_after.saturating_sub(num_tokens);
    let prefill_remaining = num_prefill_tokens.saturating_sub(tokens_before);
    let prefill = prefill_remaining.min(num_tokens);
    RoundTokens {
        prefill,
        decode: num_tokens - prefill,
    }
}

/// Undamped service units for a round that has already been applied to `request`.
pub fn round_service<R: ScheduledRequest + ?Sized>(request: &R, num_tokens: usize) -> f64 {
    let split = split_round(
        request.num_prefill_tokens(),
        request.num_processed_tokens(),
        num_tokens,
    );
    request.prefill_token_cost(split.prefill) + request.decode_token_cost() * split.decode as f64
}

/// Per-token service factors for each phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_cost_factors"))]
#[serde(default)]
pub struct ServiceCostFactors {
    pub prefill: f64,
    pub decode: f64,
}

impl Default for ServiceCostFactors {
    fn default() -> Self {
        Self {
            prefill: 1.0,
            decode: 2.0,
        }
    }
}

impl ServiceCostFactors {
    pub fn service_for(&self, prefill_tokens: usize, decode_tokens: usize) -> f64 {
        self.prefill * prefill_tokens as f64 + self.decode * decode_tokens as f64
    }
}

fn validate_cost_factors(factors: &ServiceCostFactors) -> Result<(), ValidationError> {
    let valid = |v: f64| v.is_finite() && v >= 0.0;
    if !valid(factors.prefill) || !valid(factors.decode) {
        let mut error = ValidationError::new("cost_factor_out_of_range");
        error.message = Some(
            format!(
                "cost factors must be finite and non-negative (prefill={}, decode={})",
                factors.prefill, factors.decode
            )
            .into(),
        );
        return Err(error);
    }
    Ok(())
}
