// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pending and preempted request queues.

use std::collections::{BTreeMap, VecDeque};
use std::ops::RangeBounds;

use crate::request::Request;

/// Pending requests grouped by `current_stage`, FIFO within each stage.
///
/// Empty groups are dropped so iteration only visits occupied stages.
#[derive(Debug, Default)]
pub struct StageQueues {
    groups: BTreeMap<usize, VecDeque<Request>>,
    len: usize,
}

impl StageQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request to the back of its stage group.
    pub fn push_back(&mut self, request: Request) {
        self.groups
            .entry(request.current_stage())
            .or_default()
            .push_back(request);
        self.len += 1;
    }

    /// Put a request back at the front of its stage group.
    pub fn push_front(&mut self, request: Request) {
        self.groups
            .entry(request.current_stage())
            .or_default()
            .push_front(request);
        self.len += 1;
    }

    /// Pop the oldest request waiting at `stage`.
    pub fn pop_front(&mut self, stage: usize) -> Option<Request> {
        let group = self.groups.get_mut(&stage)?;
        let request = group.pop_front();
        if group.is_empty() {
            self.groups.remove(&stage);
        }
        if request.is_some() {
            self.len -= 1;
        }
        request
    }

    /// Requests waiting at `stage`.
    pub fn len_at(&self, stage: usize) -> usize {
        self.groups.get(&stage).map_or(0, VecDeque::len)
    }

    /// Requests waiting at any stage inside `stages`. An empty range counts 0.
    pub fn count_in(&self, stages: impl RangeBounds<usize>) -> usize {
        self.groups
            .iter()
            .filter(|(stage, _)| stages.contains(*stage))
            .map(|(_, group)| group.len())
            .sum()
    }

    /// Requests of `class` waiting at `stage`.
    pub fn class_count_at(&self, stage: usize, class: &str) -> usize {
        self.groups
            .get(&stage)
            .map_or(0, |group| group.iter().filter(|r| r.class() == class).count())
    }

    /// Requests of `class` waiting at any stage inside `stages`.
    pub fn class_count_in(&self, stages: impl RangeBounds<usize>, class: &str) -> usize {
        self.groups
            .iter()
            .filter(|(stage, _)| stages.contains(*stage))
            .flat_map(|(_, group)| group.iter())
            .filter(|r| r.class() == class)
            .count()
    }

    /// Occupied stages in ascending order.
    pub fn stages(&self) -> impl Iterator<Item = usize> + '_ {
        self.groups.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.groups.values().flat_map(VecDeque::iter)
    }

    /// Remove every request, lowest stage first.
    pub fn drain(&mut self) -> impl Iterator<Item = Request> {
        self.len = 0;
        std::mem::take(&mut self.groups)
            .into_values()
            .flat_map(VecDeque::into_iter)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Requests returned unfinished from the last batch, in batch order.
#[derive(Debug, Default)]
pub struct PreemptionQueue {
    requests: VecDeque<Request>,
}

impl PreemptionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: Request) {
        self.requests.push_back(request);
    }

    /// Move every preempted request to the back of its stage group in `pending`.
    pub fn merge_into(&mut self, pending: &mut StageQueues) -> usize {
        let merged = self.requests.len();
        for request in self.requests.drain(..) {
            pending.push_back(request);
        }
        merged
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Request> + '_ {
        self.requests.drain(..)
    }

    /// Preempted requests in batch order.
    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_stage(id: u64, class: &str, stage: usize) -> Request {
        let mut request = Request::new(id, class, 4, 4);
        for _ in 0..stage {
            request.advance_stage();
        }
        request
    }

    #[test]
    fn test_fifo_within_stage() {
        let mut queues = StageQueues::new();
        queues.push_back(at_stage(1, "a", 0));
        queues.push_back(at_stage(2, "a", 1));
        queues.push_back(at_stage(3, "b", 0));

        assert_eq!(queues.len(), 3);
        assert_eq!(queues.len_at(0), 2);
        assert_eq!(queues.pop_front(0).unwrap().id(), 1);
        assert_eq!(queues.pop_front(0).unwrap().id(), 3);
        assert!(queues.pop_front(0).is_none());
        assert_eq!(queues.stages().collect::<Vec<_>>(), vec![1]);
        assert_eq!(queues.len(), 1);
    }

    #[test]
    fn test_push_front_overtakes_group() {
        let mut queues = StageQueues::new();
        queues.push_back(at_stage(1, "a", 2));
        queues.push_front(at_stage(2, "a", 2));
        assert_eq!(queues.pop_front(2).unwrap().id(), 2);
    }

    #[test]
    fn test_range_and_class_counts() {
        let mut queues = StageQueues::new();
        queues.push_back(at_stage(1, "a", 0));
        queues.push_back(at_stage(2, "b", 1));
        queues.push_back(at_stage(3, "a", 2));
        queues.push_back(at_stage(4, "a", 4));

        assert_eq!(queues.count_in(1..=2), 2);
        assert_eq!(queues.count_in(1..), 3);
        assert_eq!(queues.count_in(3..=2), 0);
        assert_eq!(queues.class_count_at(0, "a"), 1);
        assert_eq!(queues.class_count_at(0, "b"), 0);
        assert_eq!(queues.class_count_in(1.., "a"), 2);
    }

    #[test]
    fn test_drain_empties_every_group() {
        let mut queues = StageQueues::new();
        queues.push_back(at_stage(1, "a", 3));
        queues.push_back(at_stage(2, "a", 0));

        let drained: Vec<_> = queues.drain().map(|r| r.id()).collect();
        assert_eq!(drained, vec![2, 1]);
        assert!(queues.is_empty());
        assert_eq!(queues.iter().count(), 0);
    }

    #[test]
    fn test_preempted_merge_lands_behind_waiting() {
        let mut pending = StageQueues::new();
        pending.push_back(at_stage(1, "a", 1));

        let mut preempted = PreemptionQueue::new();
        preempted.push(at_stage(2, "a", 1));
        preempted.push(at_stage(3, "b", 2));
        assert_eq!(
            preempted.iter().map(Request::id).collect::<Vec<_>>(),
            vec![2, 3]
        );

        assert_eq!(preempted.merge_into(&mut pending), 2);
        assert!(preempted.is_empty());
        assert_eq!(pending.pop_front(1).unwrap().id(), 1);
        assert_eq!(pending.pop_front(1).unwrap().id(), 2);
        assert_eq!(pending.pop_front(2).unwrap().id(), 3);
    }
}
