// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block budget accounting for admitted requests.
//!
//! The ledger owns a fixed pool of `num_blocks` KV blocks of `block_size` tokens.
//! A brand-new request reserves enough blocks for its whole prompt and must leave
//! the watermark reserve untouched; a request that already holds blocks grows by
//! at most one block per admission as its decode tokens accumulate.

use std::collections::HashMap;

use crate::error::InsufficientResources;
use crate::request::{Request, RequestId};

/// Per-request block reservations against a fixed pool.
#[derive(Debug, Clone)]
pub struct ResourceLedger {
    block_size: usize,
    num_blocks: usize,
    watermark_blocks: usize,
    free_blocks: usize,
    allocations: HashMap<RequestId, usize>,
}

impl ResourceLedger {
    /// # Panics
    /// Panics if `block_size` is zero.
    pub fn new(block_size: usize, num_blocks: usize, watermark_blocks: usize) -> Self {
        assert!(block_size > 0, "block_size must be positive");
        Self {
            block_size,
            num_blocks,
            watermark_blocks,
            free_blocks: num_blocks,
            allocations: HashMap::new(),
        }
    }

    /// Reserve whatever `request` needs for its next stage.
    ///
    /// Returns the number of blocks newly reserved, which is 0 when the request's
    /// existing reservation already covers it.
    ///
    /// # Panics
    /// Panics if an existing request has grown by more than one token past its
    /// reservation since the last admission.
    pub fn allocate(&mut self, request: &Request) -> Result<usize, InsufficientResources> {
        let id = request.id();

        let Some(&held) = self.allocations.get(&id) else {
            let required = self.blocks_needed(request.prefill_token_count());
            if self.free_blocks < required + self.watermark_blocks {
                return Err(InsufficientResources {
                    request_id: id,
                    required_blocks: required,
                    free_blocks: self.free_blocks,
                    reserve_blocks: self.watermark_blocks,
                });
            }
            self.free_blocks -= required;
            self.allocations.insert(id, required);
            return Ok(required);
        };

        let tokens_required = request
            .processed_token_count()
            .saturating_sub(held * self.block_size);
        match tokens_required {
            0 => Ok(0),
            1 => {
                if self.free_blocks == 0 {
                    return Err(InsufficientResources {
                        request_id: id,
                        required_blocks: 1,
                        free_blocks: 0,
                        reserve_blocks: 0,
                    });
                }
                self.free_blocks -= 1;
                self.allocations.insert(id, held + 1);
                Ok(1)
            }
            n => panic!(
                "request {id} grew by {n} tokens past its {held}-block reservation; at most 1 per admission"
            ),
        }
    }

    /// Release every block held by `id` and return how many there were.
    ///
    /// # Panics
    /// Panics if `id` holds no reservation.
    pub fn free(&mut self, id: RequestId) -> usize {
        let Some(blocks) = self.allocations.remove(&id) else {
            panic!("request {id} freed without a reservation");
        };
        self.free_blocks += blocks;
        blocks
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.allocations.contains_key(&id)
    }

    /// Blocks currently reserved by `id`, if any.
    pub fn blocks_for(&self, id: RequestId) -> Option<usize> {
        self.allocations.get(&id).copied()
    }

    /// Number of requests holding a reservation.
    pub fn num_reservations(&self) -> usize {
        self.allocations.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn watermark_blocks(&self) -> usize {
        self.watermark_blocks
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    pub fn allocated_blocks(&self) -> usize {
        self.num_blocks - self.free_blocks
    }

    /// Fraction of the pool in use (0.0 to 1.0).
    pub fn usage(&self) -> f64 {
        if self.num_blocks == 0 {
            0.0
        } else {
            self.allocated_blocks() as f64 / self.num_blocks as f64
        }
    }

    /// Blocks needed to hold `num_tokens` tokens.
    pub fn blocks_needed(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    /// Whether a brand-new request with `prefill_tokens` prompt tokens fits
    /// above the watermark right now.
    pub fn can_allocate(&self, prefill_tokens: usize) -> bool {
        self.free_blocks >= self.blocks_needed(prefill_tokens) + self.watermark_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1)]
    #[case(16, 1)]
    #[case(17, 2)]
    #[case(64, 4)]
    #[case(0, 0)]
    fn test_new_request_reserves_prompt_blocks(#[case] prefill: usize, #[case] expected: usize) {
        let mut ledger = ResourceLedger::new(16, 100, 0);
        let request = Request::new(1, "short", prefill, 4);

        assert_eq!(ledger.allocate(&request).unwrap(), expected);
        assert_eq!(ledger.blocks_for(1), Some(expected));
        assert_eq!(ledger.free_blocks(), 100 - expected);
    }

    #[test]
    fn test_watermark_applies_to_new_requests() {
        let mut ledger = ResourceLedger::new(16, 10, 2);

        // 8 blocks leaves exactly the reserve
        ledger.allocate(&Request::new(1, "a", 128, 1)).unwrap();
        assert_eq!(ledger.free_blocks(), 2);

        let err = ledger.allocate(&Request::new(2, "a", 1, 1)).unwrap_err();
        assert_eq!(
            err,
            InsufficientResources {
                request_id: 2,
                required_blocks: 1,
                free_blocks: 2,
                reserve_blocks: 2,
            }
        );
        assert!(!ledger.contains(2));
        assert!(!ledger.can_allocate(1));
    }

    #[test]
    fn test_existing_request_grows_into_watermark() {
        let mut ledger = ResourceLedger::new(4, 3, 1);
        let mut request = Request::new(1, "a", 8, 4);
        assert_eq!(ledger.allocate(&request).unwrap(), 2);

        request.record_execution(8);
        assert_eq!(ledger.allocate(&request).unwrap(), 0);

        request.record_execution(1);
        assert_eq!(ledger.allocate(&request).unwrap(), 1);
        assert_eq!(ledger.free_blocks(), 0);
        assert_eq!(ledger.blocks_for(1), Some(3));
    }

    #[test]
    fn test_incremental_refused_when_pool_exhausted() {
        let mut ledger = ResourceLedger::new(4, 1, 0);
        let mut request = Request::new(1, "a", 4, 4);
        ledger.allocate(&request).unwrap();
        request.record_execution(5);

        let err = ledger.allocate(&request).unwrap_err();
        assert_eq!(err.required_blocks, 1);
        assert_eq!(err.free_blocks, 0);
        assert_eq!(ledger.blocks_for(1), Some(1));
    }

    #[test]
    #[should_panic(expected = "grew by 2 tokens")]
    fn test_incremental_delta_above_one_panics() {
        let mut ledger = ResourceLedger::new(4, 10, 0);
        let mut request = Request::new(1, "a", 4, 4);
        ledger.allocate(&request).unwrap();
        request.record_execution(6);
        let _ = ledger.allocate(&request);
    }

    #[test]
    fn test_free_returns_blocks() {
        let mut ledger = ResourceLedger::new(16, 10, 0);
        ledger.allocate(&Request::new(1, "a", 40, 1)).unwrap();
        assert_eq!(ledger.allocated_blocks(), 3);
        assert!((ledger.usage() - 0.3).abs() < 1e-9);

        assert_eq!(ledger.free(1), 3);
        assert_eq!(ledger.free_blocks(), 10);
        assert_eq!(ledger.num_reservations(), 0);
    }

    #[test]
    #[should_panic(expected = "freed without a reservation")]
    fn test_double_free_panics() {
        let mut ledger = ResourceLedger::new(16, 10, 0);
        ledger.allocate(&Request::new(1, "a", 4, 1)).unwrap();
        ledger.free(1);
        ledger.free(1);
    }
}
