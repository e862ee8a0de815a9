// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client assignment for generated workloads.
//!
//! The scheduler only reads `client_id` from requests; these generators decide
//! which client a newly generated request belongs to.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::config::ConfigError;
use crate::request::ClientId;

pub trait ClientAssignmentGenerator: Send {
    fn next_client_id(&mut self) -> ClientId;
}

/// Assigns every request to the same client.
#[derive(Debug, Clone)]
pub struct FixedClientAssignmentGenerator {
    client_id: ClientId,
}

impl FixedClientAssignmentGenerator {
    pub fn new(client_id: ClientId) -> Self {
        Self { client_id }
    }
}

impl ClientAssignmentGenerator for FixedClientAssignmentGenerator {
    fn next_client_id(&mut self) -> ClientId {
        self.client_id
    }
}

fn default_seed() -> u64 {
    42
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_binomial_config"))]
pub struct BinomialClientAssignmentConfig {
    /// Probability that a request goes to client 1 instead of client 0.
    pub activation_rate: f64,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn validate_binomial_config(config: &BinomialClientAssignmentConfig) -> Result<(), ValidationError> {
    validate_activation_rate(config.activation_rate)
}

pub(crate) fn validate_activation_rate(rate: f64) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&rate) {
        let mut error = ValidationError::new("activation_rate_out_of_range");
        error.message = Some(format!("activation_rate must be in [0, 1], got {rate}").into());
        return Err(error);
    }
    Ok(())
}

/// Splits requests between clients 0 and 1 with a seeded coin.
#[derive(Debug, Clone)]
pub struct BinomialClientAssignmentGenerator {
    activation_rate: f64,
    rng: ChaCha8Rng,
}

impl BinomialClientAssignmentGenerator {
    pub fn new(config: &BinomialClientAssignmentConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            activation_rate: config.activation_rate,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
        })
    }
}

impl ClientAssignmentGenerator for BinomialClientAssignmentGenerator {
    fn next_client_id(&mut self) -> ClientId {
        let sample: f64 = self.rng.random();
        ClientId(u32::from(sample < self.activation_rate))
    }
}

/// Serializable choice of client assignment generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientAssignmentConfig {
    Fixed { client_id: ClientId },
    Binomial(BinomialClientAssignmentConfig),
}

impl Default for ClientAssignmentConfig {
    fn default() -> Self {
        Self::Fixed {
            client_id: ClientId(0),
        }
    }
}

impl ClientAssignmentConfig {
    pub fn build(&self) -> Result<Box<dyn ClientAssignmentGenerator>, ConfigError> {
        Ok(match self {
            Self::Fixed { client_id } => Box::new(FixedClientAssignmentGenerator::new(*client_id)),
            Self::Binomial(config) => Box::new(BinomialClientAssignmentGenerator::new(config)?),
        })
    }
}
