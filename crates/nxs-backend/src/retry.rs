//! Backoff policy shared by HTTP requests and realtime reconnects.
//!
//! Delays double from `initial_backoff` up to `max_backoff`. A server
//! `Retry-After` (seconds or HTTP date) replaces the computed delay when
//! `respect_retry_after` is set.

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Statuses worth another attempt. Anything else fails at once.
    pub retry_on_status: Vec<u16>,
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            retry_on_status: vec![408, 425, 429, 502, 503, 504],
            respect_retry_after: true,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Default::default()
        }
    }

    /// Policy for the realtime socket: unlimited attempts, 1s doubling to 30s.
    #[must_use]
    pub fn reconnect() -> Self {
        Self {
            max_retries: None,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            retry_on_status: Vec::new(),
            respect_retry_after: false,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    #[must_use]
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    #[must_use]
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    #[must_use]
    pub fn with_retry_on_status(mut self, status: u16) -> Self {
        if !self.retries_status(status) {
            self.retry_on_status.push(status);
        }
        self
    }

    #[must_use]
    pub fn with_respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    pub fn retries_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    DontRetry,
}

/// Attempt counter and next delay for one request or connection.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempts: u32,
    pub current_backoff: Duration,
    config: RetryConfig,
}

impl RetryState {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            attempts: 0,
            current_backoff: config.initial_backoff,
            config,
        }
    }

    /// After a connection or transport failure.
    pub fn should_retry_error(&mut self) -> RetryDecision {
        self.next(None)
    }

    /// After a response with an error status.
    pub fn should_retry_status(
        &mut self,
        status: u16,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !self.config.retries_status(status) {
            return RetryDecision::DontRetry;
        }
        self.next(retry_after)
    }

    fn next(&mut self, retry_after: Option<Duration>) -> RetryDecision {
        self.attempts += 1;
        if self.config.max_retries.is_some_and(|max| self.attempts > max) {
            return RetryDecision::DontRetry;
        }

        let computed = self.current_backoff;
        self.current_backoff = computed.saturating_mul(2).min(self.config.max_backoff);
        match retry_after {
            Some(wait) if self.config.respect_retry_after => RetryDecision::Retry(wait),
            _ => RetryDecision::Retry(computed),
        }
    }

    /// Start over, e.g. once a reconnect succeeded.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_backoff = self.config.initial_backoff;
    }
}

/// Parse a `Retry-After` header: delay seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    parse_retry_after_at(value, Utc::now())
}

fn parse_retry_after_at(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_gives_three_retries() {
        let mut state = RetryState::new(RetryConfig::default());
        for _ in 0..3 {
            assert!(matches!(state.should_retry_error(), RetryDecision::Retry(_)));
        }
        assert_eq!(state.should_retry_error(), RetryDecision::DontRetry);
        assert_eq!(state.attempts, 4);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut state = RetryState::new(RetryConfig::reconnect());
        let waits: Vec<Duration> = (0..7)
            .map(|_| match state.should_retry_error() {
                RetryDecision::Retry(wait) => wait,
                RetryDecision::DontRetry => Duration::ZERO,
            })
            .collect();
        let secs: Vec<u64> = waits.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, [1, 2, 4, 8, 16, 30, 30]);

        state.reset();
        assert_eq!(state.attempts, 0);
        assert_eq!(state.current_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_only_listed_statuses_retry() {
        let mut state = RetryState::new(RetryConfig::default());
        assert_eq!(state.should_retry_status(404, None), RetryDecision::DontRetry);
        assert_eq!(
            state.should_retry_status(429, Some(Duration::from_secs(7))),
            RetryDecision::Retry(Duration::from_secs(7))
        );

        let strict = RetryConfig::default().with_respect_retry_after(false);
        let mut state = RetryState::new(strict);
        assert_eq!(
            state.should_retry_status(503, Some(Duration::from_secs(60))),
            RetryDecision::Retry(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_no_retry() {
        let mut state = RetryState::new(RetryConfig::no_retry());
        assert_eq!(state.should_retry_status(503, None), RetryDecision::DontRetry);
    }

    #[test]
    fn test_parse_retry_after_forms() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 50).unwrap();
        assert_eq!(parse_retry_after_at(" 12 ", now), Some(Duration::from_secs(12)));
        assert_eq!(
            parse_retry_after_at("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            parse_retry_after_at("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after_at("soon", now), None);
    }
}
