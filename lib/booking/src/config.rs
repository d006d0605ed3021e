// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Admission controller configuration.
//!
//! [`AdmissionConfig`] is a single immutable value object handed to the
//! controller at construction. It can be assembled in code through
//! [`AdmissionConfig::builder()`] or layered from files and the environment
//! through figment:
//!
//! 1. Code defaults
//! 2. TOML file from the `DYN_BOOKING_CONFIG_PATH` environment variable
//! 3. Environment variables (`DYN_BOOKING_*` prefixed)
//! 4. JSON overrides via [`AdmissionConfig::from_json`]
//!
//! ## JSON Example
//!
//! ```json
//! {
//!   "classes": [
//!     { "name": "short", "prefill_stage_count": 1, "decode_stage_count": 2, "arrival_rate": 2.0 },
//!     { "name": "long",  "prefill_stage_count": 1, "decode_stage_count": 4, "arrival_rate": 1.0 }
//!   ],
//!   "total_limit": 12,
//!   "gating_policy": "strict_cascade",
//!   "rounding_policy": "floor"
//! }
//! ```

use std::collections::HashSet;

use derive_builder::Builder;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    value::{Dict, Map},
    Figment, Metadata, Profile, Provider,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;

/// Environment variable naming an optional TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "DYN_BOOKING_CONFIG_PATH";

/// Prefix for environment variable overrides, e.g. `DYN_BOOKING_TOTAL_LIMIT`.
pub const ENV_PREFIX: &str = "DYN_BOOKING_";

/// A category of requests sharing a stage-count profile and an expected arrival rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RequestClass {
    #[validate(length(min = 1))]
    pub name: String,

    /// Number of prefill stages. Every class in a table shares this value.
    #[validate(range(min = 1))]
    pub prefill_stage_count: usize,

    /// Number of decode stages following the prefill.
    pub decode_stage_count: usize,

    /// Expected arrivals per unit time; only the ratios between classes matter.
    #[validate(range(min = 0.0))]
    pub arrival_rate: f64,
}

impl RequestClass {
    pub fn new(
        name: impl Into<String>,
        prefill_stage_count: usize,
        decode_stage_count: usize,
        arrival_rate: f64,
    ) -> Self {
        Self {
            name: name.into(),
            prefill_stage_count,
            decode_stage_count,
            arrival_rate,
        }
    }

    pub fn total_stage_count(&self) -> usize {
        self.prefill_stage_count + self.decode_stage_count
    }
}

/// How a fractional per-stage quota is turned into a whole number of requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    #[default]
    Floor,
    Ceil,
}

impl RoundingPolicy {
    /// Round a non-negative quota to an admission count.
    pub fn apply(self, value: f64) -> usize {
        let rounded = match self {
            RoundingPolicy::Floor => value.floor(),
            RoundingPolicy::Ceil => value.ceil(),
        };
        rounded.max(0.0) as usize
    }
}

/// Condition under which a segment may admit requests during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatingPolicy {
    /// A segment opens only when its start stage holds enough requests and every
    /// earlier segment opened this tick.
    #[default]
    StrictCascade,

    /// Every segment opens as soon as one class has enough requests waiting at
    /// stage 0 against its own booking limit.
    AnyClassReady,

    /// Each segment is judged on its own start stage; no cascade.
    IndependentSegments,
}

/// When the starvation guard force-drains a controller that has seen every
/// expected arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StarvationTrigger {
    /// Drain only when no segment is admissible.
    #[default]
    NoAdmissibleSegment,

    /// Drain as soon as the lead segment is blocked, even if a later segment
    /// could still admit.
    LeadSegmentBlocked,
}

/// Configuration for the admission controller.
///
/// Use [`AdmissionConfig::builder()`] to construct in code. `classes` must be
/// supplied; every other field has a default.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize, Validate)]
#[builder(
    pattern = "owned",
    build_fn(private, name = "build_inner", error = "ConfigError")
)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Class table. Must be non-empty with unique names.
    #[builder(default)]
    #[validate(length(min = 1), nested)]
    pub classes: Vec<RequestClass>,

    /// Booking budget split across all stages.
    #[builder(default = "256")]
    #[validate(range(min = 1))]
    pub total_limit: usize,

    /// Number of arrivals after which the controller stops expecting work.
    #[builder(default = "0")]
    pub total_expected_requests: usize,

    /// Tokens per KV block.
    #[builder(default = "16")]
    #[validate(range(min = 1))]
    pub block_size: usize,

    /// Total KV blocks owned by this controller.
    #[builder(default = "1024")]
    #[validate(range(min = 1))]
    pub num_blocks: usize,

    /// Fraction of `num_blocks` kept free when admitting brand-new requests.
    #[builder(default = "0.01")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub watermark_blocks_fraction: f64,

    #[builder(default)]
    pub gating_policy: GatingPolicy,

    #[builder(default)]
    pub rounding_policy: RoundingPolicy,

    #[builder(default)]
    pub starvation_trigger: StarvationTrigger,

    /// Recompute the plan from running-mean arrival rates as samples arrive.
    #[builder(default = "false")]
    pub rate_adaptation: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            classes: Vec::new(),
            total_limit: 256,
            total_expected_requests: 0,
            block_size: 16,
            num_blocks: 1024,
            watermark_blocks_fraction: 0.01,
            gating_policy: GatingPolicy::default(),
            rounding_policy: RoundingPolicy::default(),
            starvation_trigger: StarvationTrigger::default(),
            rate_adaptation: false,
        }
    }
}

impl AdmissionConfigBuilder {
    /// Append one class to the table.
    pub fn class(mut self, class: RequestClass) -> Self {
        self.classes.get_or_insert_with(Vec::new).push(class);
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<AdmissionConfig, ConfigError> {
        let config = self.build_inner()?;
        config.check()?;
        Ok(config)
    }
}

impl AdmissionConfig {
    pub fn builder() -> AdmissionConfigBuilder {
        AdmissionConfigBuilder::default()
    }

    /// Run field validation plus the cross-field rules.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        let mut seen = HashSet::with_capacity(self.classes.len());
        for class in &self.classes {
            if !seen.insert(class.name.as_str()) {
                return Err(ConfigError::DuplicateClass(class.name.clone()));
            }
            if !class.arrival_rate.is_finite() || class.arrival_rate < 0.0 {
                return Err(ConfigError::InvalidArrivalRate {
                    class: class.name.clone(),
                    rate: class.arrival_rate,
                });
            }
        }

        if let Some(first) = self.classes.first() {
            let expected = first.prefill_stage_count;
            if let Some(odd) = self
                .classes
                .iter()
                .find(|c| c.prefill_stage_count != expected)
            {
                return Err(ConfigError::MixedPrefillStageCounts {
                    class: odd.name.clone(),
                    expected,
                    found: odd.prefill_stage_count,
                });
            }
        }

        Ok(())
    }

    /// Blocks that must stay free when a brand-new request is admitted.
    pub fn watermark_blocks(&self) -> usize {
        (self.watermark_blocks_fraction * self.num_blocks as f64).floor() as usize
    }

    /// Look up a class by name.
    pub fn class(&self, name: &str) -> Option<&RequestClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(AdmissionConfig::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load configuration from the environment and the optional TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.check()?;
        Ok(config)
    }

    /// Load configuration with a JSON document merged at highest priority.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }
}

impl Provider for AdmissionConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("AdmissionConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

#[cfg(test)]
impl AdmissionConfig {
    /// Two-class table used throughout the unit tests: `short` (prefill 1,
    /// decode 2, rate 2) and `long` (prefill 1, decode 4, rate 1), budget 12.
    pub(crate) fn two_class_test_default() -> Self {
        Self::builder()
            .class(RequestClass::new("short", 1, 2, 2.0))
            .class(RequestClass::new("long", 1, 4, 1.0))
            .total_limit(12)
            .build()
            .expect("two_class_test_default should always succeed")
    }
}
