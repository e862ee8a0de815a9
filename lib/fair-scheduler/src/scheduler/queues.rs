// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request queues for the scheduler.
//!
//! Queues hold request ids only; the scheduler owns the requests. Removal is
//! always by id, never by a position computed before the queue changed.

use std::collections::VecDeque;

use crate::request::RequestId;

/// Requests waiting for their first (or, after eviction, next) admission.
///
/// New requests are appended; evicted requests go to the front.
#[derive(Debug, Default)]
pub struct WaitingQueue {
    requests: VecDeque<RequestId>,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, request_id: RequestId) {
        debug_assert!(!self.contains(request_id));
        self.requests.push_back(request_id);
    }

    pub fn push_front(&mut self, request_id: RequestId) {
        debug_assert!(!self.contains(request_id));
        self.requests.push_front(request_id);
    }

    /// Remove a request by id. Returns false if it was not queued.
    pub fn remove(&mut self, request_id: RequestId) -> bool {
        match self.requests.iter().position(|id| *id == request_id) {
            Some(pos) => self.requests.remove(pos).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.requests.contains(&request_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.requests.iter().copied()
    }
}

/// Requests that ran before and keep their allocation between ticks.
#[derive(Debug, Default)]
pub struct PreemptedPool {
    requests: VecDeque<RequestId>,
}

impl PreemptedPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, request_id: RequestId) {
        debug_assert!(!self.contains(request_id));
        self.requests.push_back(request_id);
    }

    pub fn push_front(&mut self, request_id: RequestId) {
        debug_assert!(!self.contains(request_id));
        self.requests.push_front(request_id);
    }

    /// Most favored request, once the pool is sorted.
    pub fn pop_front(&mut self) -> Option<RequestId> {
        self.requests.pop_front()
    }

    /// Least favored request, once the pool is sorted.
    pub fn pop_back(&mut self) -> Option<RequestId> {
        self.requests.pop_back()
    }

    pub fn extend(&mut self, request_ids: impl IntoIterator<Item = RequestId>) {
        self.requests.extend(request_ids);
    }

    pub fn sort_by_key<K: Ord>(&mut self, f: impl FnMut(&RequestId) -> K) {
        self.requests.make_contiguous().sort_by_cached_key(f);
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.requests.contains(&request_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.requests.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_queue_remove_by_id() {
        let mut queue = WaitingQueue::new();
        queue.push_back(RequestId(1));
        queue.push_back(RequestId(2));
        queue.push_front(RequestId(3));

        assert_eq!(queue.iter().collect::<Vec<_>>(), [3, 1, 2].map(RequestId));
        assert!(queue.remove(RequestId(1)));
        assert!(!queue.remove(RequestId(1)));
        assert_eq!(queue.iter().collect::<Vec<_>>(), [3, 2].map(RequestId));
    }

    #[test]
    fn test_preempted_pool_sort_and_pop() {
        let mut pool = PreemptedPool::new();
        pool.extend([5, 1, 3].map(RequestId));
        pool.sort_by_key(|id| id.0);

        assert_eq!(pool.pop_front(), Some(RequestId(1)));
        assert_eq!(pool.pop_back(), Some(RequestId(5)));
        assert_eq!(pool.len(), 1);
    }
}
