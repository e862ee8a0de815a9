// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Replica scheduler configuration.
//!
//! Every config struct is buildable through a validating builder and loadable
//! through [`ReplicaConfig::figment`], which layers code defaults, TOML files
//! and `DYN_FAIR_SCHEDULER_*` environment variables.

use std::collections::BTreeSet;

use derive_builder::Builder;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::client::{validate_activation_rate, ClientAssignmentConfig};
use crate::fairness::ServiceCostFactors;
use crate::request::ClientId;

const CONFIG_PATH_ENV: &str = "DYN_FAIR_SCHEDULER_CONFIG_PATH";
const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/fair_scheduler.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Uninitialized field: {0}")]
    UninitializedField(&'static str),

    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

impl From<derive_builder::UninitializedFieldError> for ConfigError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        Self::UninitializedField(e.field_name())
    }
}

/// What the batch builder does when the best-ranked candidate cannot be admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// End batch formation for the tick. Keeps strict fairness order.
    #[default]
    StopOnFirstInfeasible,
    /// Move on to the next-best candidate.
    SkipInfeasible,
}

/// How prefill work is split across ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BatchingMode {
    /// A request's whole prefill runs in one tick.
    #[default]
    Whole,
    /// Prefills are chunked so a tick commits at most `chunk_size` tokens
    /// before decode continuations are added.
    Chunked { chunk_size: usize },
}

/// Fairness policy used to rank candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FairnessKind {
    #[default]
    Vtc,
    Fcfs,
}

/// Weight of one client. A client with twice the damping gets twice the service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientDamping {
    pub client_id: ClientId,
    pub damping: f64,
}

/// Scheduling limits and policies of one replica.
///
/// Required builder fields: `batch_size_cap` and `max_tokens_in_batch`.
#[derive(Debug, Clone, PartialEq, Builder, Validate, Serialize, Deserialize)]
#[builder(
    pattern = "owned",
    build_fn(private, name = "build_private", error = "ConfigError")
)]
#[validate(schema(function = "validate_scheduler_config"))]
#[serde(default)]
pub struct SchedulerConfig {
    #[builder(default)]
    pub replica_id: u32,

    /// Maximum number of requests holding an allocation at once.
    #[validate(range(min = 1))]
    pub batch_size_cap: usize,

    /// Budget for `requests_in_batch * max_tokens_per_request`.
    #[validate(range(min = 1))]
    pub max_tokens_in_batch: usize,

    /// Maximum requests per batch. `None` derives it from the cap and the
    /// number of pipeline stages.
    #[builder(default)]
    #[validate(range(min = 1))]
    pub max_micro_batch_size: Option<usize>,

    /// Batches allowed in flight at once.
    #[builder(default = "1")]
    #[validate(range(min = 1))]
    pub num_pipeline_stages: usize,

    #[builder(default)]
    pub admission: AdmissionPolicy,

    #[builder(default)]
    pub batching: BatchingMode,

    #[builder(default)]
    pub fairness: FairnessKind,

    /// Damping of clients without an explicit entry.
    #[builder(default = "1.0")]
    pub default_damping: f64,

    #[builder(default)]
    pub client_damping: Vec<ClientDamping>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            replica_id: 0,
            batch_size_cap: 128,
            max_tokens_in_batch: 4096,
            max_micro_batch_size: None,
            num_pipeline_stages: 1,
            admission: AdmissionPolicy::default(),
            batching: BatchingMode::default(),
            fairness: FairnessKind::default(),
            default_damping: 1.0,
            client_damping: Vec::new(),
        }
    }
}

impl SchedulerConfigBuilder {
    pub fn build(self) -> Result<SchedulerConfig, ConfigError> {
        let config = self.build_private()?;
        config.validate()?;
        Ok(config)
    }
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// Requests allowed in a single batch.
    pub fn effective_micro_batch_size(&self) -> usize {
        self.max_micro_batch_size
            .unwrap_or_else(|| (self.batch_size_cap / self.num_pipeline_stages).max(1))
    }
}

fn damping_error(value: f64) -> ValidationError {
    let mut error = ValidationError::new("damping_out_of_range");
    error.message = Some(format!("damping must be finite and positive, got {value}").into());
    error
}

fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ValidationError> {
    let valid_damping = |v: f64| v.is_finite() && v > 0.0;
    if !valid_damping(config.default_damping) {
        return Err(damping_error(config.default_damping));
    }

    let mut seen = BTreeSet::new();
    for entry in &config.client_damping {
        if !valid_damping(entry.damping) {
            return Err(damping_error(entry.damping));
        }
        if !seen.insert(entry.client_id) {
            let mut error = ValidationError::new("duplicate_client_damping");
            error.message =
                Some(format!("client {} has more than one damping entry", entry.client_id).into());
            return Err(error);
        }
    }

    if let BatchingMode::Chunked { chunk_size } = config.batching {
        if chunk_size == 0 || chunk_size > config.max_tokens_in_batch {
            let mut error = ValidationError::new("chunk_size_out_of_range");
            error.message = Some(
                format!(
                    "chunk_size ({chunk_size}) must be in 1..={}",
                    config.max_tokens_in_batch
                )
                .into(),
            );
            return Err(error);
        }
    }

    if let Some(micro) = config.max_micro_batch_size {
        if micro > config.batch_size_cap {
            let mut error = ValidationError::new("micro_batch_exceeds_cap");
            error.message = Some(
                format!(
                    "max_micro_batch_size ({micro}) exceeds batch_size_cap ({})",
                    config.batch_size_cap
                )
                .into(),
            );
            return Err(error);
        }
    }

    Ok(())
}

/// Paged KV-cache capacity of a replica.
#[derive(Debug, Clone, PartialEq, Builder, Validate, Serialize, Deserialize)]
#[builder(
    pattern = "owned",
    build_fn(private, name = "build_private", error = "ConfigError")
)]
#[validate(schema(function = "validate_allocator_config"))]
#[serde(default)]
pub struct BlockAllocatorConfig {
    #[validate(range(min = 1))]
    pub num_blocks: usize,

    /// Tokens per block.
    #[builder(default = "16")]
    #[validate(range(min = 1))]
    pub block_size: usize,

    /// Share of blocks new admissions must leave free.
    #[builder(default = "0.01")]
    pub watermark_blocks_fraction: f64,
}

impl Default for BlockAllocatorConfig {
    fn default() -> Self {
        Self {
            num_blocks: 2048,
            block_size: 16,
            watermark_blocks_fraction: 0.01,
        }
    }
}

impl BlockAllocatorConfigBuilder {
    pub fn build(self) -> Result<BlockAllocatorConfig, ConfigError> {
        let config = self.build_private()?;
        config.validate()?;
        Ok(config)
    }
}

impl BlockAllocatorConfig {
    pub fn builder() -> BlockAllocatorConfigBuilder {
        BlockAllocatorConfigBuilder::default()
    }

    pub fn watermark_blocks(&self) -> usize {
        (self.watermark_blocks_fraction * self.num_blocks as f64) as usize
    }
}

fn validate_allocator_config(config: &BlockAllocatorConfig) -> Result<(), ValidationError> {
    let fraction = config.watermark_blocks_fraction;
    if !(0.0..1.0).contains(&fraction) {
        let mut error = ValidationError::new("watermark_out_of_range");
        error.message =
            Some(format!("watermark_blocks_fraction must be in [0, 1), got {fraction}").into());
        return Err(error);
    }
    Ok(())
}

/// Everything needed to stand up one replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_replica_config"))]
pub struct ReplicaConfig {
    #[validate(nested)]
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[validate(nested)]
    #[serde(default)]
    pub allocator: BlockAllocatorConfig,

    /// Cost factors for simulated requests.
    #[validate(nested)]
    #[serde(default)]
    pub service_cost: ServiceCostFactors,

    /// Client assignment for generated workloads. None = single client 0.
    #[serde(default)]
    pub client_assignment: Option<ClientAssignmentConfig>,
}

fn validate_replica_config(config: &ReplicaConfig) -> Result<(), ValidationError> {
    match &config.client_assignment {
        Some(ClientAssignmentConfig::Binomial(binomial)) => {
            validate_activation_rate(binomial.activation_rate)
        }
        _ => Ok(()),
    }
}

impl ReplicaConfig {
    /// Create a Figment configuration with all sources merged.
    ///
    /// Configuration sources in priority order (lowest to highest):
    /// 1. Code defaults
    /// 2. System config file at /opt/dynamo/etc/fair_scheduler.toml
    /// 3. TOML file from DYN_FAIR_SCHEDULER_CONFIG_PATH
    /// 4. Environment variables (DYN_FAIR_SCHEDULER_* prefixed)
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(ReplicaConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // DYN_FAIR_SCHEDULER_SCHEDULER_BATCH_SIZE_CAP, ..._MAX_TOKENS_IN_BATCH, etc.
            .merge(
                Env::prefixed("DYN_FAIR_SCHEDULER_SCHEDULER_")
                    .map(|k| format!("scheduler.{}", k.as_str().to_lowercase()).into()),
            )
            // DYN_FAIR_SCHEDULER_ALLOCATOR_NUM_BLOCKS, ..._BLOCK_SIZE, etc.
            .merge(
                Env::prefixed("DYN_FAIR_SCHEDULER_ALLOCATOR_")
                    .map(|k| format!("allocator.{}", k.as_str().to_lowercase()).into()),
            )
            // DYN_FAIR_SCHEDULER_SERVICE_COST_PREFILL, ..._DECODE
            .merge(
                Env::prefixed("DYN_FAIR_SCHEDULER_SERVICE_COST_")
                    .map(|k| format!("service_cost.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with a JSON override on top of every other source.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fairness::DampingTable;

    const ENV_VARS: [&str; 5] = [
        "DYN_FAIR_SCHEDULER_CONFIG_PATH",
        "DYN_FAIR_SCHEDULER_SCHEDULER_BATCH_SIZE_CAP",
        "DYN_FAIR_SCHEDULER_SCHEDULER_MAX_TOKENS_IN_BATCH",
        "DYN_FAIR_SCHEDULER_ALLOCATOR_NUM_BLOCKS",
        "DYN_FAIR_SCHEDULER_SERVICE_COST_DECODE",
    ];

    fn builder() -> SchedulerConfigBuilder {
        SchedulerConfig::builder()
            .batch_size_cap(8)
            .max_tokens_in_batch(512)
    }

    #[test]
    fn test_builder_defaults() {
        let config = builder().build().unwrap();
        assert_eq!(config.num_pipeline_stages, 1);
        assert_eq!(config.admission, AdmissionPolicy::StopOnFirstInfeasible);
        assert_eq!(config.batching, BatchingMode::Whole);
        assert_eq!(config.fairness, FairnessKind::Vtc);
        assert_eq!(config.effective_micro_batch_size(), 8);
        assert_eq!(DampingTable::from_config(&config).get(ClientId(3)), 1.0);
    }

    #[test]
    fn test_micro_batch_derived_from_pipeline_stages() {
        let config = builder().num_pipeline_stages(3).build().unwrap();
        assert_eq!(config.effective_micro_batch_size(), 2);

        let config = builder()
            .batch_size_cap(1)
            .num_pipeline_stages(4)
            .build()
            .unwrap();
        assert_eq!(config.effective_micro_batch_size(), 1);
    }

    #[test]
    fn test_missing_required_field() {
        let err = SchedulerConfig::builder()
            .max_tokens_in_batch(512)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UninitializedField("batch_size_cap")));
    }

    #[test]
    fn test_zero_cap_rejected() {
        let err = builder().batch_size_cap(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_invalid_damping_rejected() {
        for damping in [0.0, -2.0, f64::NAN, f64::INFINITY] {
            assert!(builder().default_damping(damping).build().is_err());
            assert!(builder()
                .client_damping(vec![ClientDamping {
                    client_id: ClientId(1),
                    damping,
                }])
                .build()
                .is_err());
        }
    }

    #[test]
    fn test_duplicate_client_damping_rejected() {
        let entry = ClientDamping {
            client_id: ClientId(0),
            damping: 2.0,
        };
        assert!(builder().client_damping(vec![entry, entry]).build().is_err());
    }

    #[test]
    fn test_client_damping_lookup() {
        let config = builder()
            .client_damping(vec![ClientDamping {
                client_id: ClientId(0),
                damping: 2.0,
            }])
            .build()
            .unwrap();
        let damping = DampingTable::from_config(&config);
        assert_eq!(damping.get(ClientId(0)), 2.0);
        assert_eq!(damping.get(ClientId(1)), 1.0);
    }

    #[test]
    fn test_chunk_size_bounds() {
        assert!(builder()
            .batching(BatchingMode::Chunked { chunk_size: 0 })
            .build()
            .is_err());
        assert!(builder()
            .batching(BatchingMode::Chunked { chunk_size: 513 })
            .build()
            .is_err());
        assert!(builder()
            .batching(BatchingMode::Chunked { chunk_size: 512 })
            .build()
            .is_ok());
    }

    #[test]
    fn test_micro_batch_cannot_exceed_cap() {
        assert!(builder().max_micro_batch_size(Some(9)).build().is_err());
        assert!(builder().max_micro_batch_size(Some(0)).build().is_err());
    }

    #[test]
    fn test_allocator_watermark() {
        let config = BlockAllocatorConfig::builder()
            .num_blocks(250)
            .build()
            .unwrap();
        assert_eq!(config.block_size, 16);
        assert_eq!(config.watermark_blocks(), 2);

        assert!(BlockAllocatorConfig::builder()
            .num_blocks(10)
            .watermark_blocks_fraction(1.0)
            .build()
            .is_err());
    }

    #[test]
    fn test_figment_defaults() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let config = ReplicaConfig::from_env().unwrap();
            assert_eq!(config, ReplicaConfig::default());
        });
    }

    #[test]
    fn test_env_override() {
        temp_env::with_vars(
            vec![
                ("DYN_FAIR_SCHEDULER_CONFIG_PATH", None),
                ("DYN_FAIR_SCHEDULER_SCHEDULER_BATCH_SIZE_CAP", Some("32")),
                ("DYN_FAIR_SCHEDULER_ALLOCATOR_NUM_BLOCKS", Some("64")),
                ("DYN_FAIR_SCHEDULER_SERVICE_COST_DECODE", Some("4.0")),
            ],
            || {
                let config = ReplicaConfig::from_env().unwrap();
                assert_eq!(config.scheduler.batch_size_cap, 32);
                assert_eq!(config.allocator.num_blocks, 64);
                assert_eq!(config.service_cost.decode, 4.0);
            },
        );
    }

    #[test]
    fn test_invalid_env_value_fails_validation() {
        temp_env::with_vars(
            vec![
                ("DYN_FAIR_SCHEDULER_CONFIG_PATH", None),
                ("DYN_FAIR_SCHEDULER_SCHEDULER_BATCH_SIZE_CAP", Some("0")),
            ],
            || {
                let err = ReplicaConfig::from_env().unwrap_err();
                assert!(matches!(err, ConfigError::Validation(_)));
            },
        );
    }

    #[test]
    fn test_from_figment_with_json() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let json = r#"{
                "scheduler": {
                    "batch_size_cap": 4,
                    "max_tokens_in_batch": 256,
                    "admission": "skip_infeasible",
                    "batching": {"mode": "chunked", "chunk_size": 64},
                    "client_damping": [{"client_id": 0, "damping": 2.0}]
                },
                "client_assignment": {"type": "binomial", "activation_rate": 0.25, "seed": 7}
            }"#;
            let config = ReplicaConfig::from_figment_with_json(json).unwrap();

            assert_eq!(config.scheduler.batch_size_cap, 4);
            assert_eq!(config.scheduler.admission, AdmissionPolicy::SkipInfeasible);
            assert_eq!(
                config.scheduler.batching,
                BatchingMode::Chunked { chunk_size: 64 }
            );
            assert_eq!(
                DampingTable::from_config(&config.scheduler).get(ClientId(0)),
                2.0
            );
            assert!(matches!(
                config.client_assignment,
                Some(ClientAssignmentConfig::Binomial(_))
            ));
        });
    }

    #[test]
    fn test_json_overrides_env() {
        temp_env::with_vars(
            vec![
                ("DYN_FAIR_SCHEDULER_CONFIG_PATH", None),
                ("DYN_FAIR_SCHEDULER_SCHEDULER_BATCH_SIZE_CAP", Some("16")),
            ],
            || {
                let json = r#"{"scheduler": {"batch_size_cap": 2}}"#;
                let config = ReplicaConfig::from_figment_with_json(json).unwrap();
                assert_eq!(config.scheduler.batch_size_cap, 2);
            },
        );
    }

    #[test]
    fn test_invalid_activation_rate_rejected() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let json = r#"{"client_assignment": {"type": "binomial", "activation_rate": 1.5}}"#;
            let err = ReplicaConfig::from_figment_with_json(json).unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)));
        });
    }
}
