// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Nested booking-limit planning.
//!
//! The stage space `[0, prefill + max_decode)` is cut at every distinct decode
//! length. With sorted distinct decode counts `d1 < d2 < … < dk`:
//!
//! ```text
//! stage:  0 ............ p+d1-1 | p+d1 ..... p+d2-1 | ... | p+d(k-1) ... p+dk-1
//!         segment 0             | segment 1         |     | segment k-1
//!         all classes           | decode > d1       |     | decode > d(k-1)
//! ```
//!
//! Each segment is weighted by `length × Σ arrival_rate` over the classes still
//! active inside it, receives `total_limit × weight / total_weight` of the
//! budget, and spreads that evenly over its stages (at least one per stage).
//!
//! Planning is pure: [`SegmentPlanner::plan`] reads the class table and returns
//! a fresh [`SegmentPlan`] without touching any caller state.

use std::collections::BTreeSet;

use crate::config::{AdmissionConfig, RequestClass, RoundingPolicy};

/// A contiguous range of stages sharing one per-stage quota.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub start_stage: usize,
    /// Inclusive.
    pub end_stage: usize,
    pub per_stage_quota: usize,
    /// Share of `total_limit` assigned to the whole segment (fractional).
    pub segment_total_quota: f64,
    /// Sum of arrival rates over the classes that reach this segment.
    pub arrival_weight: f64,
}

impl Segment {
    /// Number of stages covered; always at least 1.
    pub fn stage_count(&self) -> usize {
        self.end_stage - self.start_stage + 1
    }

    pub fn weight(&self) -> f64 {
        self.stage_count() as f64 * self.arrival_weight
    }

    pub fn contains(&self, stage: usize) -> bool {
        (self.start_stage..=self.end_stage).contains(&stage)
    }

    /// Whole-request budget of the segment, used to cap new entries at its start.
    pub fn budget(&self) -> usize {
        self.segment_total_quota.floor() as usize
    }
}

/// Flat (non-nested) booking limit of a single class.
///
/// A class receives `total_limit × rate × stages / Σ(rate × stages)` and spreads
/// it over its own stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassBookingLimit {
    pub class: String,
    pub total_stage_count: usize,
    /// Share of `total_limit` assigned to the class (fractional).
    pub budget: f64,
    /// Requests of this class admitted per stage.
    pub stage_quota: usize,
}

impl ClassBookingLimit {
    /// Whole-request budget of the class.
    pub fn whole_budget(&self) -> usize {
        self.budget.floor() as usize
    }
}

/// Immutable output of one planning pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPlan {
    segments: Vec<Segment>,
    stage_quotas: Vec<usize>,
    class_limits: Vec<ClassBookingLimit>,
    total_limit: usize,
    rounding: RoundingPolicy,
}

impl SegmentPlan {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Flat `stage → per_stage_quota` lookup.
    pub fn stage_quotas(&self) -> &[usize] {
        &self.stage_quotas
    }

    /// Per-stage quota, or 0 for stages beyond the plan.
    pub fn quota(&self, stage: usize) -> usize {
        self.stage_quotas.get(stage).copied().unwrap_or(0)
    }

    pub fn max_stage_count(&self) -> usize {
        self.stage_quotas.len()
    }

    pub fn segment_of(&self, stage: usize) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(stage))
    }

    pub fn class_limits(&self) -> &[ClassBookingLimit] {
        &self.class_limits
    }

    pub fn class_limit(&self, class: &str) -> Option<&ClassBookingLimit> {
        self.class_limits.iter().find(|l| l.class == class)
    }

    pub fn total_limit(&self) -> usize {
        self.total_limit
    }

    pub fn rounding(&self) -> RoundingPolicy {
        self.rounding
    }
}

/// Turns a class table into a [`SegmentPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlanner {
    total_limit: usize,
    rounding: RoundingPolicy,
}

impl SegmentPlanner {
    pub fn new(total_limit: usize, rounding: RoundingPolicy) -> Self {
        Self {
            total_limit,
            rounding,
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(config.total_limit, config.rounding_policy)
    }

    /// Compute segments, per-stage quotas and per-class limits for `classes`.
    ///
    /// All classes are expected to share the prefill stage count of the first
    /// class; [`AdmissionConfig::check`] enforces this for configured tables.
    pub fn plan(&self, classes: &[RequestClass]) -> SegmentPlan {
        let segments = self.segments(classes);

        let mut stage_quotas = Vec::with_capacity(segments.last().map_or(0, |s| s.end_stage + 1));
        for segment in &segments {
            stage_quotas.resize(
                stage_quotas.len() + segment.stage_count(),
                segment.per_stage_quota,
            );
        }

        SegmentPlan {
            segments,
            stage_quotas,
            class_limits: self.class_limits(classes),
            total_limit: self.total_limit,
            rounding: self.rounding,
        }
    }

    fn segments(&self, classes: &[RequestClass]) -> Vec<Segment> {
        let Some(first) = classes.first() else {
            return Vec::new();
        };
        let prefill = first.prefill_stage_count;
        let decodes: Vec<usize> = classes
            .iter()
            .map(|c| c.decode_stage_count)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        // (length, arrival weight) per segment
        let mut shapes = Vec::with_capacity(decodes.len());
        shapes.push((
            prefill + decodes[0],
            classes.iter().map(|c| c.arrival_rate).sum::<f64>(),
        ));
        for pair in decodes.windows(2) {
            let (previous, current) = (pair[0], pair[1]);
            let arrival: f64 = classes
                .iter()
                .filter(|c| c.decode_stage_count > previous)
                .map(|c| c.arrival_rate)
                .sum();
            shapes.push((current - previous, arrival));
        }

        let total_weight: f64 = shapes
            .iter()
            .map(|&(len, arrival)| len as f64 * arrival)
            .sum();

        let mut segments = Vec::with_capacity(shapes.len());
        let mut next_stage = 0;
        for (len, arrival_weight) in shapes {
            if len == 0 {
                continue;
            }
            let weight = len as f64 * arrival_weight;
            let segment_total_quota = if total_weight > 0.0 {
                self.total_limit as f64 * weight / total_weight
            } else {
                0.0
            };
            let per_stage_quota = self
                .rounding
                .apply((segment_total_quota / len as f64).max(1.0));

            segments.push(Segment {
                start_stage: next_stage,
                end_stage: next_stage + len - 1,
                per_stage_quota,
                segment_total_quota,
                arrival_weight,
            });
            next_stage += len;
        }
        segments
    }

    fn class_limits(&self, classes: &[RequestClass]) -> Vec<ClassBookingLimit> {
        let total: f64 = classes
            .iter()
            .map(|c| c.arrival_rate * c.total_stage_count() as f64)
            .sum();

        classes
            .iter()
            .map(|class| {
                let stages = class.total_stage_count();
                let budget = if total > 0.0 {
                    self.total_limit as f64 * class.arrival_rate * stages as f64 / total
                } else {
                    0.0
                };
                let per_stage = if stages > 0 {
                    budget / stages as f64
                } else {
                    0.0
                };
                ClassBookingLimit {
                    class: class.name.clone(),
                    total_stage_count: stages,
                    budget,
                    stage_quota: self.rounding.apply(per_stage.max(1.0)),
                }
            })
            .collect()
    }
}

/// Smallest `total_limit` that lets every class run at the given per-stage quota
/// across all of its stages.
pub fn minimum_total_limit<'a>(
    quotas: impl IntoIterator<Item = (&'a RequestClass, usize)>,
) -> usize {
    quotas
        .into_iter()
        .map(|(class, per_stage)| per_stage * class.total_stage_count())
        .sum()
}
