// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Segment gating.
//!
//! Every tick the controller snapshots which segments may admit. The snapshot is
//! taken once, before any request is popped, so admissions within a tick never
//! change the verdict for a later segment.
//!
//! For each segment the start stage must hold at least
//! `min(per_stage_quota(start), remaining)` requests, where `remaining` is the
//! segment's whole budget minus the requests already occupying its later stages.
//! How those per-segment readings combine depends on [`GatingPolicy`].

use crate::config::{GatingPolicy, StarvationTrigger};
use crate::planner::{Segment, SegmentPlan};
use crate::queues::StageQueues;

/// Gate reading for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentGate {
    pub start_stage: usize,
    /// Requests waiting at the start stage.
    pub waiting: usize,
    /// Segment budget left after subtracting requests at its later stages.
    pub remaining: usize,
    /// Start-stage requests needed for the segment to open on its own.
    pub required: usize,
    /// The segment's own start-stage condition holds.
    pub ready: bool,
    /// The segment admits this tick under the active policy.
    pub admissible: bool,
}

impl SegmentGate {
    /// Most requests the start stage may admit this tick.
    pub fn start_cap(&self, quota: usize) -> usize {
        quota.min(self.remaining)
    }
}

/// Per-tick verdict over every segment of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    gates: Vec<SegmentGate>,
}

impl GateDecision {
    pub fn gates(&self) -> &[SegmentGate] {
        &self.gates
    }

    pub fn is_admissible(&self, segment: usize) -> bool {
        self.gates.get(segment).is_some_and(|g| g.admissible)
    }

    pub fn any_admissible(&self) -> bool {
        self.gates.iter().any(|g| g.admissible)
    }

    pub fn admissible_count(&self) -> usize {
        self.gates.iter().filter(|g| g.admissible).count()
    }

    /// Whether segment 0 opened.
    pub fn lead_admissible(&self) -> bool {
        self.is_admissible(0)
    }
}

impl GatingPolicy {
    /// Read every segment's gate against the pending queues.
    pub fn evaluate(self, plan: &SegmentPlan, pending: &StageQueues) -> GateDecision {
        let mut gates: Vec<SegmentGate> = plan
            .segments()
            .iter()
            .map(|segment| read_gate(segment, pending))
            .collect();

        match self {
            GatingPolicy::StrictCascade => {
                let mut open = true;
                for gate in &mut gates {
                    open = open && gate.ready;
                    gate.admissible = open;
                }
            }
            GatingPolicy::IndependentSegments => {
                for gate in &mut gates {
                    gate.admissible = gate.ready;
                }
            }
            GatingPolicy::AnyClassReady => {
                let open = any_class_ready(plan, pending);
                for gate in &mut gates {
                    gate.admissible = open;
                }
            }
        }

        GateDecision { gates }
    }
}

impl StarvationTrigger {
    /// Whether a draining controller with this gate reading should force-drain.
    pub fn should_drain(self, decision: &GateDecision) -> bool {
        match self {
            StarvationTrigger::NoAdmissibleSegment => !decision.any_admissible(),
            StarvationTrigger::LeadSegmentBlocked => !decision.lead_admissible(),
        }
    }
}

fn read_gate(segment: &Segment, pending: &StageQueues) -> SegmentGate {
    let occupied = pending.count_in(segment.start_stage + 1..=segment.end_stage);
    let remaining = segment.budget().saturating_sub(occupied);
    let required = segment.per_stage_quota.min(remaining);
    let waiting = pending.len_at(segment.start_stage);

    SegmentGate {
        start_stage: segment.start_stage,
        waiting,
        remaining,
        required,
        ready: waiting >= required,
        admissible: false,
    }
}

/// Some class has enough stage-0 requests to fill its own booking limit, or
/// everything its remaining class budget allows. A class whose budget is fully
/// occupied by later stages counts as ready even with nothing waiting.
fn any_class_ready(plan: &SegmentPlan, pending: &StageQueues) -> bool {
    plan.class_limits().iter().any(|limit| {
        let waiting = pending.class_count_at(0, &limit.class);
        let in_progress = pending.class_count_in(1.., &limit.class);
        let threshold = limit
            .stage_quota
            .min(limit.whole_budget().saturating_sub(in_progress));
        waiting >= threshold
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RequestClass, RoundingPolicy};
    use crate::planner::SegmentPlanner;
    use crate::request::Request;

    // stages 0..=2 quota 3 (budget 9), stages 3..=4 quota 1 (budget 2)
    fn plan() -> SegmentPlan {
        SegmentPlanner::new(12, RoundingPolicy::Floor).plan(&[
            RequestClass::new("short", 1, 2, 2.0),
            RequestClass::new("long", 1, 4, 1.0),
        ])
    }

    fn pending(entries: &[(&str, usize)]) -> StageQueues {
        let mut queues = StageQueues::new();
        for (id, &(class, stage)) in entries.iter().enumerate() {
            let mut request = Request::new(id as u64, class, 4, 4);
            for _ in 0..stage {
                request.advance_stage();
            }
            queues.push_back(request);
        }
        queues
    }

    #[test]
    fn test_strict_cascade_blocks_everything_behind_lead() {
        let queues = pending(&[("short", 0), ("long", 3)]);
        let decision = GatingPolicy::StrictCascade.evaluate(&plan(), &queues);

        let gates = decision.gates();
        assert!(!gates[0].ready);
        assert_eq!(gates[0].required, 3);
        assert!(gates[1].ready);
        assert!(!decision.any_admissible());
    }

    #[test]
    fn test_strict_cascade_opens_in_order() {
        let queues = pending(&[("short", 0), ("short", 0), ("long", 0), ("long", 3)]);
        let decision = GatingPolicy::StrictCascade.evaluate(&plan(), &queues);

        assert!(decision.is_admissible(0));
        assert!(decision.is_admissible(1));
        assert_eq!(decision.admissible_count(), 2);
    }

    #[test]
    fn test_remaining_budget_lowers_requirement() {
        // eight requests already inside segment 0 leave one slot
        let mut entries = vec![("short", 1); 4];
        entries.extend([("short", 2); 4]);
        entries.push(("long", 0));
        let queues = pending(&entries);

        let decision = GatingPolicy::StrictCascade.evaluate(&plan(), &queues);
        let lead = decision.gates()[0];
        assert_eq!(lead.remaining, 1);
        assert_eq!(lead.required, 1);
        assert_eq!(lead.start_cap(3), 1);
        assert!(lead.admissible);
    }

    #[test]
    fn test_exhausted_budget_opens_with_zero_start_cap() {
        let queues = pending(&[("short", 1); 9]);
        let decision = GatingPolicy::StrictCascade.evaluate(&plan(), &queues);

        let lead = decision.gates()[0];
        assert_eq!(lead.remaining, 0);
        assert!(lead.admissible);
        assert_eq!(lead.start_cap(3), 0);
    }

    #[test]
    fn test_independent_segments_skip_cascade() {
        let queues = pending(&[("short", 0), ("long", 3)]);
        let decision = GatingPolicy::IndependentSegments.evaluate(&plan(), &queues);

        assert!(!decision.is_admissible(0));
        assert!(decision.is_admissible(1));
    }

    #[test]
    fn test_any_class_ready_opens_all_segments() {
        // short: stage quota 2, long: stage quota 1
        let queues = pending(&[("long", 0)]);
        let decision = GatingPolicy::AnyClassReady.evaluate(&plan(), &queues);
        assert!(decision.is_admissible(0));
        assert!(decision.is_admissible(1));

        let queues = pending(&[("short", 0), ("long", 3)]);
        let decision = GatingPolicy::AnyClassReady.evaluate(&plan(), &queues);
        assert!(!decision.any_admissible());
    }

    #[test]
    fn test_any_class_ready_with_exhausted_class_budget() {
        // short: whole budget 6, stage quota 2
        let mut entries = vec![("short", 1); 3];
        entries.extend([("short", 2); 3]);
        let decision = GatingPolicy::AnyClassReady.evaluate(&plan(), &pending(&entries));
        assert!(decision.lead_admissible());
        assert!(!StarvationTrigger::NoAdmissibleSegment.should_drain(&decision));

        // one slot left, so a single stage-0 short is needed
        entries.pop();
        let decision = GatingPolicy::AnyClassReady.evaluate(&plan(), &pending(&entries));
        assert!(!decision.any_admissible());
        entries.push(("short", 0));
        let decision = GatingPolicy::AnyClassReady.evaluate(&plan(), &pending(&entries));
        assert!(decision.any_admissible());
    }

    #[test]
    fn test_single_stage_segment_gate() {
        let plan = SegmentPlanner::new(12, RoundingPolicy::Floor).plan(&[
            RequestClass::new("p", 1, 2, 1.0),
            RequestClass::new("q", 1, 3, 1.0),
        ]);
        assert_eq!(plan.segments()[1].stage_count(), 1);

        let queues = pending(&[("q", 3)]);
        let decision = GatingPolicy::IndependentSegments.evaluate(&plan, &queues);
        assert!(decision.is_admissible(1));
        assert_eq!(decision.gates()[1].remaining, plan.segments()[1].budget());
    }

    #[test]
    fn test_starvation_triggers() {
        let queues = pending(&[("short", 0), ("long", 3)]);
        let independent = GatingPolicy::IndependentSegments.evaluate(&plan(), &queues);

        assert!(!StarvationTrigger::NoAdmissibleSegment.should_drain(&independent));
        assert!(StarvationTrigger::LeadSegmentBlocked.should_drain(&independent));

        let strict = GatingPolicy::StrictCascade.evaluate(&plan(), &queues);
        assert!(StarvationTrigger::NoAdmissibleSegment.should_drain(&strict));
    }
}
