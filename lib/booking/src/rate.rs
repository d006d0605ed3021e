// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Arrival-rate adaptation.
//!
//! Each class keeps a running mean of the samples reported for it. Once a class
//! has at least one sample, the mean replaces its configured rate and a complete
//! new [`SegmentPlan`] is built from the adjusted table. The caller swaps the new
//! plan in whole; a plan already handed out is never modified.

use std::collections::HashMap;

use crate::config::RequestClass;
use crate::error::AdmissionError;
use crate::planner::{SegmentPlan, SegmentPlanner};

/// Mean of every sample seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub fn push(&mut self, sample: f64) {
        self.sum += sample;
        self.count += 1;
    }

    /// `None` until the first sample.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Class table whose arrival rates follow reported samples.
#[derive(Debug, Clone)]
pub struct RateAdapter {
    planner: SegmentPlanner,
    classes: Vec<RequestClass>,
    history: HashMap<String, RunningMean>,
}

impl RateAdapter {
    pub fn new(planner: SegmentPlanner, classes: Vec<RequestClass>) -> Self {
        let history = classes
            .iter()
            .map(|c| (c.name.clone(), RunningMean::default()))
            .collect();
        Self {
            planner,
            classes,
            history,
        }
    }

    /// Class table with adapted rates.
    pub fn classes(&self) -> &[RequestClass] {
        &self.classes
    }

    /// Fold one sample into `class` and re-plan from the adjusted table.
    pub fn record(&mut self, class: &str, sample: f64) -> Result<SegmentPlan, AdmissionError> {
        if !sample.is_finite() || sample < 0.0 {
            return Err(AdmissionError::InvalidRateSample {
                class: class.to_string(),
                sample,
            });
        }

        let history = self
            .history
            .get_mut(class)
            .ok_or_else(|| AdmissionError::UnknownSampleClass(class.to_string()))?;
        history.push(sample);
        let mean = history.mean().unwrap_or(sample);

        if let Some(entry) = self.classes.iter_mut().find(|c| c.name == class) {
            entry.arrival_rate = mean;
        }

        Ok(self.plan())
    }

    /// Plan from the current table.
    pub fn plan(&self) -> SegmentPlan {
        self.planner.plan(&self.classes)
    }

    pub fn history(&self, class: &str) -> Option<&RunningMean> {
        self.history.get(class)
    }
}
