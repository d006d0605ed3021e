// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Nested booking-limit admission control.
//!
//! This crate decides, once per scheduling tick, which queued requests advance to
//! their next stage under a global booking budget. Requests belong to classes that
//! share a prefill stage count but differ in decode length and arrival rate.
//!
//! # Architecture
//!
//! - **SegmentPlanner** ([`planner`]): partitions the stage space into segments at
//!   each distinct decode length and splits `total_limit` across them by
//!   `length × arrival weight`, yielding a per-stage quota.
//! - **ResourceLedger** ([`ledger`]): per-request KV block accounting with a
//!   watermark reserve for brand-new requests.
//! - **StageQueues / PreemptionQueue** ([`queues`]): pending requests keyed by
//!   current stage, plus the unfinished remainder of the last batch.
//! - **Gating** ([`policy`]): decides which segments may admit this tick.
//! - **RateAdapter** ([`rate`]): running-mean arrival rates that trigger a full
//!   re-plan.
//! - **AdmissionController** ([`controller`]): the per-tick protocol, the
//!   `Accepting → Draining → Terminated` phase machine and the starvation guard.
//!
//! ```text
//!  add_request ──► StageQueues ──► get_next_batch ──► Batch ──► (engine) ──► on_batch_end
//!                      ▲                │                                       │
//!                      │           SegmentPlan                        completed │ unfinished
//!                      │           ResourceLedger                        free ◄─┤
//!                      └──────────── PreemptionQueue ◄──────────────────────────┘
//! ```
//!
//! The controller is synchronous and single-threaded; hosts running it inside an
//! async runtime must serialize calls per instance.

pub mod config;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod planner;
pub mod policy;
pub mod queues;
pub mod rate;
pub mod request;

pub use config::{
    AdmissionConfig, AdmissionConfigBuilder, GatingPolicy, RequestClass, RoundingPolicy,
    StarvationTrigger,
};
pub use controller::{AdmissionController, ControllerStats, Phase};
pub use error::{AdmissionError, ConfigError, InsufficientResources};
pub use ledger::ResourceLedger;
pub use planner::{minimum_total_limit, ClassBookingLimit, Segment, SegmentPlan, SegmentPlanner};
pub use policy::{GateDecision, SegmentGate};
pub use queues::{PreemptionQueue, StageQueues};
pub use rate::{RateAdapter, RunningMean};
pub use request::{Batch, Request, RequestId};
