// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

//! Retry policy with method-based classification.
//!
//! # Overview
//!
//! Requests are classified into two scopes by their HTTP method:
//!
//! - **Read**: `GET`, `HEAD`, `OPTIONS`. Replaying them cannot change server
//!   state, so server-side failures are worth another attempt.
//! - **Mutation**: everything else. The server may already have applied the
//!   change when it answered with an error, so only failures that prove the
//!   request never got an answer are retried.
//!
//! # Error Classification
//!
//! | Failure | Read | Mutation |
//! |---------|------|----------|
//! | `Network`, `Timeout` | retry | retry |
//! | 408, 429 | retry | retry |
//! | other 5xx | retry | terminal |
//! | other 4xx | terminal | terminal |
//! | `Canceled`, `Validation`, everything else | terminal | terminal |
//!
//! # Backoff
//!
//! Attempt `n` (zero based) that fails with a retryable error waits
//! `retry_delay × 2^n` before the next send, and at most `max_retries`
//! retries are made. A timeout counts against the same ceiling as any other
//! network failure.
//!
//! # Examples
//!
//! ```rust
//! use courier_client::{Error, Method, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(100));
//! assert_eq!(policy.delay_for(2), Duration::from_millis(400));
//! assert!(policy.should_retry(&Error::Timeout, &Method::POST, 0));
//! assert!(!policy.should_retry(&Error::HttpStatus(404), &Method::GET, 0));
//! assert!(!policy.should_retry(&Error::Timeout, &Method::GET, 3));
//! ```

use crate::{Error, transport::is_read_only};
use reqwest::Method;
use std::time::Duration;

/// Retry scope derived from the request method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryScope {
    /// Side-effect free requests.
    Read,
    /// Requests that may change server state.
    Mutation,
}

/// Classifies a method to determine which retry rules apply.
pub fn classify_method(method: &Method) -> RetryScope {
    if is_read_only(method) {
        RetryScope::Read
    } else {
        RetryScope::Mutation
    }
}

/// Returns true when `error` may succeed if the request is sent again.
pub fn is_retryable(error: &Error, method: &Method) -> bool {
    match error {
        Error::Network(_) | Error::Timeout => true,
        Error::HttpStatus(408 | 429) => true,
        Error::HttpStatus(500..=599) => classify_method(method) == RetryScope::Read,
        _ => false,
    }
}

/// Bounded exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    retry_delay: Duration,
    retry_on_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            retry_delay,
            retry_on_error: true,
        }
    }

    /// A policy that surfaces the first failure.
    pub fn disabled() -> Self {
        RetryPolicy {
            retry_on_error: false,
            ..RetryPolicy::default()
        }
    }

    pub fn with_retry_on_error(mut self, retry_on_error: bool) -> Self {
        self.retry_on_error = retry_on_error;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn retry_on_error(&self) -> bool {
        self.retry_on_error
    }

    /// Delay before retry number `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Decides whether attempt `attempt` (zero based) failing with `error`
    /// gets another send.
    pub fn should_retry(&self, error: &Error, method: &Method, attempt: u32) -> bool {
        self.retry_on_error && attempt < self.max_retries && is_retryable(error, method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_method() {
        assert_eq!(classify_method(&Method::GET), RetryScope::Read);
        assert_eq!(classify_method(&Method::HEAD), RetryScope::Read);
        assert_eq!(classify_method(&Method::OPTIONS), RetryScope::Read);
        assert_eq!(classify_method(&Method::POST), RetryScope::Mutation);
        assert_eq!(classify_method(&Method::PUT), RetryScope::Mutation);
        assert_eq!(classify_method(&Method::DELETE), RetryScope::Mutation);
        assert_eq!(classify_method(&Method::PATCH), RetryScope::Mutation);
    }

    #[test]
    fn test_retryable_reads() {
        let get = Method::GET;
        assert!(is_retryable(&Error::Network("reset".into()), &get));
        assert!(is_retryable(&Error::Timeout, &get));
        assert!(is_retryable(&Error::HttpStatus(500), &get));
        assert!(is_retryable(&Error::HttpStatus(503), &get));
        assert!(is_retryable(&Error::HttpStatus(429), &get));
        assert!(!is_retryable(&Error::HttpStatus(404), &get));
        assert!(!is_retryable(&Error::HttpStatus(401), &get));
        assert!(!is_retryable(&Error::Canceled, &get));
        assert!(!is_retryable(&Error::Validation("bad".into()), &get));
    }

    #[test]
    fn test_retryable_mutations() {
        let post = Method::POST;
        assert!(is_retryable(&Error::Network("refused".into()), &post));
        assert!(is_retryable(&Error::Timeout, &post));
        assert!(is_retryable(&Error::HttpStatus(408), &post));
        assert!(!is_retryable(&Error::HttpStatus(500), &post));
        assert!(!is_retryable(&Error::HttpStatus(422), &post));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        let delays: Vec<_> = (0..4).map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
        // saturates instead of overflowing
        assert!(policy.delay_for(64) >= policy.delay_for(31));
    }

    #[test]
    fn test_ceiling_and_switch() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        assert!(policy.should_retry(&Error::Timeout, &Method::GET, 0));
        assert!(policy.should_retry(&Error::Timeout, &Method::GET, 1));
        assert!(!policy.should_retry(&Error::Timeout, &Method::GET, 2));

        let off = policy.clone().with_retry_on_error(false);
        assert!(!off.should_retry(&Error::Timeout, &Method::GET, 0));
        assert!(!RetryPolicy::disabled().retry_on_error());
    }
}
