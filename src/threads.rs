use std::collections::HashSet;

use crate::embed::{cosine, l2_normalize};

/// A detected topic thread: the message indices it owns, in order, plus the
/// running topic embedding. Threads never share an index, but a thread's
/// indices need not be contiguous once reattachment has happened.
#[derive(Debug, Clone)]
pub struct Thread {
    pub indices: Vec<usize>,
    topic: Vec<f32>,
}

impl Thread {
    fn new(index: usize, vector: &[f32]) -> Self {
        Self {
            indices: vec![index],
            topic: vector.to_vec(),
        }
    }

    /// Exponential moving average with α = 2/(n+1), re-normalized.
    fn absorb(&mut self, index: usize, vector: &[f32]) {
        self.indices.push(index);
        let n = self.indices.len() as f32;
        let alpha = 2.0 / (n + 1.0);
        for (t, v) in self.topic.iter_mut().zip(vector) {
            *t = (1.0 - alpha) * *t + alpha * v;
        }
        l2_normalize(&mut self.topic);
    }

    fn last_index(&self) -> usize {
        *self.indices.last().expect("thread never empty")
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Groups adjacent messages into topic threads by embedding similarity.
pub struct ThreadDetector {
    similarity_threshold: f32,
    /// How many recent threads are candidates for reattachment.
    window_size: usize,
    /// Maximum distance for merging a degenerate thread into a neighbor.
    max_gap: usize,
}

/// Reattachment needs this much distance from the older thread's tail, so
/// two interleaved topics do not flicker between threads every message.
const MIN_REATTACH_GAP: usize = 3;
/// Threads shorter than this get merged into an adjacent thread.
const MIN_THREAD_LEN: usize = 2;

impl ThreadDetector {
    pub fn new(similarity_threshold: f32, window_size: usize, max_gap: usize) -> Self {
        Self {
            similarity_threshold,
            window_size: window_size.max(1),
            max_gap,
        }
    }

    /// Assign each message vector to a thread.
    pub fn detect(&self, vectors: &[Vec<f32>]) -> Vec<Thread> {
        let mut threads: Vec<Thread> = Vec::new();
        // The thread that absorbed the previous message.
        let mut active = 0usize;

        for (i, vector) in vectors.iter().enumerate() {
            if threads.is_empty() {
                threads.push(Thread::new(i, vector));
                active = 0;
                continue;
            }

            if cosine(&threads[active].topic, vector) >= self.similarity_threshold {
                threads[active].absorb(i, vector);
                continue;
            }

            // Try the recent other threads before opening a new one. The
            // gap rule keeps two interleaved topics from flickering.
            let window_start = threads.len().saturating_sub(self.window_size);
            let mut reattached = false;
            for t in (window_start..threads.len()).rev() {
                if t == active {
                    continue;
                }
                let gap_ok = i.saturating_sub(threads[t].last_index()) >= MIN_REATTACH_GAP;
                if gap_ok && cosine(&threads[t].topic, vector) >= self.similarity_threshold {
                    threads[t].absorb(i, vector);
                    active = t;
                    reattached = true;
                    break;
                }
            }
            if !reattached {
                threads.push(Thread::new(i, vector));
                active = threads.len() - 1;
            }
        }

        self.merge_short(threads)
    }

    /// Fold degenerate threads into an adjacent thread when the positional
    /// distance is small enough.
    fn merge_short(&self, threads: Vec<Thread>) -> Vec<Thread> {
        if threads.len() <= 1 {
            return threads;
        }
        let mut merged: Vec<Thread> = Vec::with_capacity(threads.len());
        for thread in threads {
            if thread.len() >= MIN_THREAD_LEN {
                merged.push(thread);
                continue;
            }
            let lone = thread.indices[0];
            let near_previous = merged
                .last()
                .map(|prev| lone.saturating_sub(prev.last_index()) <= self.max_gap)
                .unwrap_or(false);
            if near_previous {
                let prev = merged.last_mut().expect("checked non-empty");
                let vector = thread.topic.clone();
                prev.absorb(lone, &vector);
            } else {
                merged.push(thread);
            }
        }
        merged
    }

    /// Expand a selection for coherence: for each selected index, pull in
    /// up to `before` earlier and `after` later messages of its thread.
    pub fn expand_selection(
        &self,
        threads: &[Thread],
        selected: &HashSet<usize>,
        before: usize,
        after: usize,
    ) -> HashSet<usize> {
        let mut out = selected.clone();
        for thread in threads {
            for (pos, idx) in thread.indices.iter().enumerate() {
                if !selected.contains(idx) {
                    continue;
                }
                let lo = pos.saturating_sub(before);
                let hi = (pos + after).min(thread.indices.len() - 1);
                for neighbor in &thread.indices[lo..=hi] {
                    out.insert(*neighbor);
                }
            }
        }
        out
    }
}
