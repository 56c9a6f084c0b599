//! Streaming sentinel counter
//!
//! Output arrives in arbitrary chunks and a sentinel may straddle two of
//! them. The matcher keeps its KMP state between calls so every byte is
//! examined exactly once.

#[derive(Debug, Clone)]
pub struct SentinelMatcher {
    pattern: Vec<u8>,
    failure: Vec<usize>,
    matched: usize,
    count: usize,
}

fn build_failure(pattern: &[u8]) -> Vec<usize> {
    let mut failure = vec![0usize; pattern.len()];
    let mut length = 0usize;
    let mut index = 1usize;

    while index < pattern.len() {
        if pattern[index] == pattern[length] {
            length += 1;
            failure[index] = length;
            index += 1;
        } else if length != 0 {
            length = failure[length - 1];
        } else {
            index += 1;
        }
    }

    failure
}

impl SentinelMatcher {
    pub fn new(sentinel: &str) -> Self {
        let pattern = sentinel.as_bytes().to_vec();
        let failure = build_failure(&pattern);
        Self {
            pattern,
            failure,
            matched: 0,
            count: 0,
        }
    }

    /// Feed the next chunk, returning the total number of occurrences so far
    pub fn feed(&mut self, chunk: &[u8]) -> usize {
        if self.pattern.is_empty() {
            return self.count;
        }
        for &byte in chunk {
            while self.matched > 0 && byte != self.pattern[self.matched] {
                self.matched = self.failure[self.matched - 1];
            }
            if byte == self.pattern[self.matched] {
                self.matched += 1;
            }
            if self.matched == self.pattern.len() {
                self.count += 1;
                self.matched = self.failure[self.matched - 1];
            }
        }
        self.count
    }

    pub fn count(&self) -> usize {
        self.count
    }
}
