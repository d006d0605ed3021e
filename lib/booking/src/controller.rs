// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-tick admission under nested booking limits.
//!
//! # Tick protocol
//!
//! 1. Unfinished requests from the last batch rejoin the back of their stage group.
//! 2. The gating policy reads every segment against the pending queues.
//! 3. While draining, the starvation guard may release all queued work and
//!    terminate instead of admitting.
//! 4. Each admissible segment pops up to its per-stage quota from every stage it
//!    covers, oldest first. A ledger refusal puts the request back at the front
//!    of its group and closes that stage for the tick.
//!
//! # Phases
//!
//! ```text
//! Accepting ──(arrivals == total_expected_requests)──► Draining ──(guard fires)──► Terminated
//! ```
//!
//! `Terminated` is absorbing: no further batches, arrivals rejected, and
//! unfinished requests returned from the engine are released and discarded.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::{AdmissionConfig, RequestClass};
use crate::error::{AdmissionError, ConfigError};
use crate::ledger::ResourceLedger;
use crate::planner::{SegmentPlan, SegmentPlanner};
use crate::queues::{PreemptionQueue, StageQueues};
use crate::rate::RateAdapter;
use crate::request::{Batch, Request, RequestId};

/// Lifecycle phase of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Still expecting arrivals.
    Accepting,
    /// Every expected arrival has been seen; the starvation guard is armed.
    Draining,
    /// Force-drained. Absorbing.
    Terminated,
}

/// Counters maintained across the controller's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Requests passed to `add_request`, including rejected ones.
    pub arrivals: usize,
    /// Requests naming an unknown class or outlasting their class's stages.
    pub anomalies: usize,
    /// Accepted arrivals per class.
    pub class_arrivals: BTreeMap<String, usize>,
    /// Stage admissions handed out in batches.
    pub admitted_stages: usize,
    /// Admissions the ledger turned down.
    pub ledger_refusals: usize,
    pub completed: usize,
    /// Requests released without completing.
    pub drained: usize,
    pub ticks: usize,
    /// Ticks that produced no batch.
    pub empty_ticks: usize,
    /// Plans installed after construction.
    pub replans: usize,
}

impl ControllerStats {
    /// Stage admissions the accepted arrivals would need to run to completion.
    pub fn theoretical_throughput(&self, classes: &[RequestClass]) -> usize {
        classes
            .iter()
            .map(|c| self.class_arrivals.get(&c.name).copied().unwrap_or(0) * c.total_stage_count())
            .sum()
    }
}

/// Admission controller for one scheduling replica.
///
/// Not internally synchronized: `add_request`, `get_next_batch` and
/// `on_batch_end` must be called from one place at a time.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    plan: Arc<SegmentPlan>,
    rates: RateAdapter,
    ledger: ResourceLedger,
    pending: StageQueues,
    preempted: PreemptionQueue,
    in_flight: HashSet<RequestId>,
    live: HashSet<RequestId>,
    phase: Phase,
    stats: ControllerStats,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Result<Self, ConfigError> {
        config.check()?;

        let planner = SegmentPlanner::from_config(&config);
        let rates = RateAdapter::new(planner, config.classes.clone());
        let plan = Arc::new(rates.plan());
        let ledger = ResourceLedger::new(
            config.block_size,
            config.num_blocks,
            config.watermark_blocks(),
        );
        let phase = if config.total_expected_requests == 0 {
            Phase::Draining
        } else {
            Phase::Accepting
        };

        tracing::info!(
            classes = config.classes.len(),
            total_limit = config.total_limit,
            segments = plan.segments().len(),
            max_stage_count = plan.max_stage_count(),
            stage_quotas = ?plan.stage_quotas(),
            gating_policy = ?config.gating_policy,
            ?phase,
            "Segment plan computed"
        );

        Ok(Self {
            config,
            plan,
            rates,
            ledger,
            pending: StageQueues::new(),
            preempted: PreemptionQueue::new(),
            in_flight: HashSet::new(),
            live: HashSet::new(),
            phase,
            stats: ControllerStats::default(),
        })
    }

    /// Queue a new request at stage 0.
    ///
    /// Requests naming an unknown class, or needing more stages than their class
    /// plans for, are counted as arrivals and anomalies but never queued.
    ///
    /// # Panics
    /// Panics if a live request already uses the same id.
    pub fn add_request(&mut self, request: Request) -> Result<(), AdmissionError> {
        if self.phase == Phase::Terminated {
            tracing::warn!(request_id = request.id(), "Arrival after termination dropped");
            return Err(AdmissionError::Terminated(request.id()));
        }

        self.stats.arrivals += 1;
        if self.phase == Phase::Draining {
            tracing::warn!(
                request_id = request.id(),
                arrivals = self.stats.arrivals,
                expected = self.config.total_expected_requests,
                "Arrival beyond the expected total"
            );
        }

        let Some(class) = self.config.class(request.class()) else {
            self.stats.anomalies += 1;
            tracing::warn!(
                request_id = request.id(),
                class = request.class(),
                anomalies = self.stats.anomalies,
                "Request references unknown class; excluded from admission"
            );
            let err = AdmissionError::UnknownClass {
                request_id: request.id(),
                class: request.class().to_string(),
            };
            self.check_arrivals_complete();
            return Err(err);
        };

        let planned = class.total_stage_count();
        if request.stage_count() > planned {
            self.stats.anomalies += 1;
            tracing::warn!(
                request_id = request.id(),
                class = request.class(),
                required_stages = request.stage_count(),
                planned_stages = planned,
                anomalies = self.stats.anomalies,
                "Request outlasts its class's stage plan; excluded from admission"
            );
            let err = AdmissionError::StageCountExceedsClass {
                request_id: request.id(),
                class: request.class().to_string(),
                required: request.stage_count(),
                planned,
            };
            self.check_arrivals_complete();
            return Err(err);
        }

        assert!(
            self.live.insert(request.id()),
            "request {} added while another request with that id is live",
            request.id()
        );
        *self
            .stats
            .class_arrivals
            .entry(request.class().to_string())
            .or_default() += 1;

        if let Some(sample) = request.arrival_rate_sample() {
            if self.config.rate_adaptation {
                match self.rates.record(request.class(), sample) {
                    Ok(plan) => self.install_plan(plan),
                    Err(e) => tracing::warn!(
                        request_id = request.id(),
                        error = %e,
                        "Ignoring arrival-rate sample"
                    ),
                }
            }
        }

        self.pending.push_back(request);
        self.check_arrivals_complete();
        Ok(())
    }

    /// Run one admission tick.
    ///
    /// Returns `None` when nothing was admitted: either ordinary backpressure or,
    /// while draining, a starvation drain that terminates the controller.
    pub fn get_next_batch(&mut self) -> Option<Batch> {
        if self.phase == Phase::Terminated {
            return None;
        }
        self.stats.ticks += 1;

        self.preempted.merge_into(&mut self.pending);
        if self.pending.is_empty() {
            self.stats.empty_ticks += 1;
            tracing::trace!(in_flight = self.in_flight.len(), "Nothing pending");
            return None;
        }

        let plan = Arc::clone(&self.plan);
        let decision = self.config.gating_policy.evaluate(&plan, &self.pending);

        if self.phase == Phase::Draining && self.config.starvation_trigger.should_drain(&decision)
        {
            self.force_drain();
            return None;
        }

        if !decision.any_admissible() {
            self.stats.empty_ticks += 1;
            tracing::trace!(
                pending = self.pending.len(),
                lead_waiting = decision.gates().first().map_or(0, |g| g.waiting),
                lead_required = decision.gates().first().map_or(0, |g| g.required),
                "No segment admissible; waiting for arrivals"
            );
            return None;
        }

        let mut batch = Batch::default();
        for (segment, gate) in plan.segments().iter().zip(decision.gates()) {
            if !gate.admissible {
                continue;
            }
            for stage in segment.start_stage..=segment.end_stage {
                let quota = plan.quota(stage);
                let cap = if stage == segment.start_stage {
                    gate.start_cap(quota)
                } else {
                    quota
                };
                self.admit_from_stage(stage, cap, &mut batch);
            }
        }

        if batch.is_empty() {
            self.stats.empty_ticks += 1;
            tracing::debug!(
                pending = self.pending.len(),
                admissible_segments = decision.admissible_count(),
                "Admissible segments produced no admissions"
            );
            return None;
        }

        self.stats.admitted_stages += batch.len();
        tracing::debug!(
            batch_size = batch.len(),
            num_tokens = batch.total_num_tokens(),
            admissible_segments = decision.admissible_count(),
            pending = self.pending.len(),
            free_blocks = self.ledger.free_blocks(),
            "Batch admitted"
        );
        Some(batch)
    }

    /// Take back a batch after the engine ran it.
    ///
    /// Completed requests release their blocks. Unfinished requests wait in the
    /// preemption queue for the next tick, or are released and discarded once the
    /// controller has terminated.
    ///
    /// # Panics
    /// Panics if the batch holds a request that is not in flight.
    pub fn on_batch_end(&mut self, batch: Batch) {
        for request in batch.into_requests() {
            let id = request.id();
            assert!(
                self.in_flight.remove(&id),
                "request {id} returned from a batch but is not in flight"
            );

            if request.is_completed() {
                self.ledger.free(id);
                self.live.remove(&id);
                self.stats.completed += 1;
            } else if self.phase == Phase::Terminated {
                let released = if self.ledger.contains(id) {
                    self.ledger.free(id)
                } else {
                    0
                };
                self.live.remove(&id);
                self.stats.drained += 1;
                tracing::warn!(
                    request_id = id,
                    stage = request.current_stage(),
                    released_blocks = released,
                    "Unfinished request returned after termination; discarded"
                );
            } else {
                self.preempted.push(request);
            }
        }
    }

    /// Feed an external arrival-rate sample for `class`.
    ///
    /// Ignored unless rate adaptation is enabled. Otherwise the new plan replaces
    /// the old one before the next tick.
    pub fn report_arrival_rate(&mut self, class: &str, sample: f64) -> Result<(), AdmissionError> {
        if !self.config.rate_adaptation {
            tracing::debug!(class, sample, "Rate adaptation disabled; sample ignored");
            return Ok(());
        }
        let plan = self.rates.record(class, sample)?;
        self.install_plan(plan);
        Ok(())
    }

    /// True when nothing is pending or preempted.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.preempted.is_empty()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The plan the next tick will use.
    pub fn plan(&self) -> Arc<SegmentPlan> {
        Arc::clone(&self.plan)
    }

    /// Class table with any adapted arrival rates.
    pub fn classes(&self) -> &[RequestClass] {
        self.rates.classes()
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn pending(&self) -> &StageQueues {
        &self.pending
    }

    pub fn num_preempted(&self) -> usize {
        self.preempted.len()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Stage admissions needed to finish every accepted arrival.
    pub fn theoretical_throughput(&self) -> usize {
        self.stats.theoretical_throughput(&self.config.classes)
    }

    fn admit_from_stage(&mut self, stage: usize, cap: usize, batch: &mut Batch) -> usize {
        let mut admitted = 0;
        while admitted < cap {
            let Some(mut request) = self.pending.pop_front(stage) else {
                break;
            };
            match self.ledger.allocate(&request) {
                Ok(_) => {
                    request.advance_stage();
                    let num_tokens = request.next_num_tokens();
                    self.in_flight.insert(request.id());
                    batch.push(request, num_tokens);
                    admitted += 1;
                }
                Err(refusal) => {
                    self.stats.ledger_refusals += 1;
                    tracing::debug!(
                        stage,
                        request_id = refusal.request_id,
                        required_blocks = refusal.required_blocks,
                        free_blocks = refusal.free_blocks,
                        reserve_blocks = refusal.reserve_blocks,
                        "Ledger refused admission; request stays queued"
                    );
                    self.pending.push_front(request);
                    break;
                }
            }
        }
        admitted
    }

    fn install_plan(&mut self, plan: SegmentPlan) {
        self.plan = Arc::new(plan);
        self.stats.replans += 1;
        tracing::info!(
            replans = self.stats.replans,
            segments = self.plan.segments().len(),
            stage_quotas = ?self.plan.stage_quotas(),
            "Segment plan replaced"
        );
    }

    fn check_arrivals_complete(&mut self) {
        if self.phase == Phase::Accepting
            && self.stats.arrivals == self.config.total_expected_requests
        {
            self.phase = Phase::Draining;
            tracing::info!(
                arrivals = self.stats.arrivals,
                anomalies = self.stats.anomalies,
                class_arrivals = ?self.stats.class_arrivals,
                theoretical_throughput = self.theoretical_throughput(),
                "All expected requests arrived; draining"
            );
        }
    }

    fn force_drain(&mut self) {
        let mut drained = 0;
        let mut released_blocks = 0;
        for request in self.pending.drain().chain(self.preempted.drain()) {
            let id = request.id();
            if self.ledger.contains(id) {
                released_blocks += self.ledger.free(id);
            }
            self.live.remove(&id);
            drained += 1;
        }

        self.stats.drained += drained;
        self.phase = Phase::Terminated;
        tracing::info!(
            drained,
            released_blocks,
            in_flight = self.in_flight.len(),
            completed = self.stats.completed,
            "Starvation guard fired; pending work released and controller terminated"
        );
    }
}
