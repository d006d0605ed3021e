// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types for configuration, admission and block accounting.
//!
//! Only recoverable or reportable conditions live here. Broken invariants
//! (double free, unexpected token growth, unknown in-flight ids) panic at the
//! call site instead.

use thiserror::Error;
use validator::ValidationErrors;

use crate::request::RequestId;

/// Configuration rejected before any scheduling happens.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Uninitialized field: {0}")]
    UninitializedField(&'static str),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Request class '{0}' is defined more than once")]
    DuplicateClass(String),

    #[error(
        "All request classes must share one prefill stage count; '{class}' has {found}, expected {expected}"
    )]
    MixedPrefillStageCounts {
        class: String,
        expected: usize,
        found: usize,
    },

    #[error("Request class '{class}' has arrival rate {rate}; rates must be finite and non-negative")]
    InvalidArrivalRate { class: String, rate: f64 },

    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),
}

impl From<derive_builder::UninitializedFieldError> for ConfigError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        Self::UninitializedField(e.field_name())
    }
}

/// Non-fatal conditions reported by the admission entry points.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionError {
    /// The request names a class absent from the class table. It is counted as an
    /// anomaly and never queued.
    #[error("Request {request_id} references unknown class '{class}'")]
    UnknownClass { request_id: RequestId, class: String },

    /// The request needs more stages than its class plans for. It is counted as an
    /// anomaly and never queued.
    #[error(
        "Request {request_id} needs {required} stage(s) but class '{class}' plans for {planned}"
    )]
    StageCountExceedsClass {
        request_id: RequestId,
        class: String,
        required: usize,
        planned: usize,
    },

    /// An arrival-rate sample named a class absent from the class table.
    #[error("Arrival-rate sample references unknown class '{0}'")]
    UnknownSampleClass(String),

    #[error("Arrival-rate sample {sample} for class '{class}' must be finite and non-negative")]
    InvalidRateSample { class: String, sample: f64 },

    /// The controller already force-drained and accepts no more work.
    #[error("Controller has terminated; request {0} was dropped")]
    Terminated(RequestId),
}

/// Transient refusal from the resource ledger. The affected request simply stays
/// queued for a later tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Request {request_id} needs {required_blocks} block(s); {free_blocks} free with {reserve_blocks} held in reserve"
)]
pub struct InsufficientResources {
    pub request_id: RequestId,
    pub required_blocks: usize,
    pub free_blocks: usize,
    pub reserve_blocks: usize,
}
