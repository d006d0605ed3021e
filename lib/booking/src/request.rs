// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request state and the batch handed to the execution engine.
//!
//! # Lifecycle
//!
//! ```text
//! [new] ──► pending(stage s) ──► in flight(stage s+1) ──► completed ──► freed
//!                 ▲                     │
//!                 └──── preempted ◄─────┘ (not completed)
//!
//! forced drain: pending / preempted ──► released and dropped
//! ```
//!
//! A request is owned by exactly one place at a time: the controller's queues,
//! a [`Batch`] in the engine's hands, or nothing once it has finished.

/// Identifier of a request, unique among live requests of one controller.
pub type RequestId = u64;

/// A unit of staged work.
///
/// `current_stage` starts at 0 and only the admission controller may advance
/// it, exactly one stage per admission.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    id: RequestId,
    class: String,
    current_stage: usize,
    prefill_token_count: usize,
    decode_token_count: usize,
    processed_token_count: usize,
    completed: bool,
    arrival_rate_sample: Option<f64>,
}

impl Request {
    /// Create a request at stage 0 with nothing processed.
    pub fn new(
        id: RequestId,
        class: impl Into<String>,
        prefill_token_count: usize,
        decode_token_count: usize,
    ) -> Self {
        Self {
            id,
            class: class.into(),
            current_stage: 0,
            prefill_token_count,
            decode_token_count,
            processed_token_count: 0,
            completed: false,
            arrival_rate_sample: None,
        }
    }

    /// Attach an externally observed arrival-rate sample for this request's class.
    pub fn with_arrival_rate_sample(mut self, sample: f64) -> Self {
        self.arrival_rate_sample = Some(sample);
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Name of the class this request belongs to.
    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn current_stage(&self) -> usize {
        self.current_stage
    }

    pub fn prefill_token_count(&self) -> usize {
        self.prefill_token_count
    }

    pub fn decode_token_count(&self) -> usize {
        self.decode_token_count
    }

    pub fn processed_token_count(&self) -> usize {
        self.processed_token_count
    }

    pub fn total_token_count(&self) -> usize {
        self.prefill_token_count + self.decode_token_count
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_prefill_complete(&self) -> bool {
        self.processed_token_count >= self.prefill_token_count
    }

    pub fn arrival_rate_sample(&self) -> Option<f64> {
        self.arrival_rate_sample
    }

    /// Stages needed to run to completion: one for the whole prompt, then one per
    /// decode token. Never less than one.
    pub fn stage_count(&self) -> usize {
        (usize::from(self.prefill_token_count > 0) + self.decode_token_count).max(1)
    }

    /// Number of tokens this request processes in its next stage: whatever is
    /// left of the prompt, or a single decode token.
    pub fn next_num_tokens(&self) -> usize {
        if self.is_prefill_complete() {
            1
        } else {
            self.prefill_token_count - self.processed_token_count
        }
    }

    /// Record that the engine executed one stage covering `num_tokens` tokens.
    ///
    /// The request completes once every prompt and decode token is processed.
    ///
    /// # Panics
    /// Panics if the request already completed.
    pub fn record_execution(&mut self, num_tokens: usize) {
        assert!(
            !self.completed,
            "request {} executed after completion",
            self.id
        );
        self.processed_token_count += num_tokens;
        if self.processed_token_count >= self.total_token_count() {
            self.completed = true;
        }
    }

    pub(crate) fn advance_stage(&mut self) {
        self.current_stage += 1;
    }
}

/// Requests admitted in one tick, each paired with the tokens it processes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Batch {
    requests: Vec<Request>,
    num_tokens: Vec<usize>,
}

impl Batch {
    pub(crate) fn push(&mut self, request: Request, num_tokens: usize) {
        self.requests.push(request);
        self.num_tokens.push(num_tokens);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn num_tokens(&self) -> &[usize] {
        &self.num_tokens
    }

    pub fn total_num_tokens(&self) -> usize {
        self.num_tokens.iter().sum()
    }

    pub fn request_ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.requests.iter().map(Request::id)
    }

    /// Execute every request in the batch for its scheduled token count.
    ///
    /// Stands in for the engine's forward pass in simulations and tests.
    pub fn execute(&mut self) {
        for (request, &tokens) in self.requests.iter_mut().zip(&self.num_tokens) {
            request.record_execution(tokens);
        }
    }

    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }
}
