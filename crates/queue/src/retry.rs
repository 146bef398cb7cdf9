use certify::CertifyError;
use std::time::Duration;

/// Failure classification the policy keys off. `Rejected` covers the
/// authority's explicit REJECTED response, which is not an error at the
/// transport level but is terminal for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    ServerTransient,
    ClientInvalid,
    AuthExpired,
    Rejected,
}

impl ErrorClass {
    pub fn classify(err: &CertifyError) -> Self {
        match err {
            CertifyError::Network(_) => ErrorClass::Network,
            CertifyError::ServerTransient { .. } => ErrorClass::ServerTransient,
            CertifyError::ClientInvalid { .. } => ErrorClass::ClientInvalid,
            CertifyError::AuthExpired => ErrorClass::AuthExpired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryImmediate,
    RetryAfter(Duration),
    Abandon,
}

/// Pure retry decision table.
///
/// The engine owns the one-refresh-per-pass rule for expired credentials:
/// it downgrades a repeated `AuthExpired` to `ClientInvalid` before asking
/// the policy again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    ceiling: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            ceiling: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, ceiling: u32) -> Self {
        Self {
            base_delay,
            ceiling,
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Decide what to do after a failed attempt. `attempts` is the number
    /// of attempts completed before the failing one.
    ///
    /// The `RetryAfter` delay is informational within a pass: the engine
    /// never sleeps mid-pass, backoff is realized by leaving the record for
    /// a later scheduled pass.
    pub fn decide(&self, attempts: u32, error: ErrorClass) -> RetryDecision {
        match error {
            ErrorClass::Rejected | ErrorClass::ClientInvalid => RetryDecision::Abandon,
            ErrorClass::AuthExpired => RetryDecision::RetryImmediate,
            ErrorClass::Network | ErrorClass::ServerTransient => {
                if attempts >= self.ceiling {
                    RetryDecision::Abandon
                } else {
                    RetryDecision::RetryAfter(self.backoff_delay(attempts))
                }
            }
        }
    }

    fn backoff_delay(&self, attempts: u32) -> Duration {
        // exponent capped so the shift cannot overflow
        self.base_delay.saturating_mul(1u32 << attempts.min(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_abandon_regardless_of_attempt_count() {
        let policy = RetryPolicy::default();
        for attempts in [0, 1, 2, 10] {
            assert_eq!(
                policy.decide(attempts, ErrorClass::Rejected),
                RetryDecision::Abandon
            );
            assert_eq!(
                policy.decide(attempts, ErrorClass::ClientInvalid),
                RetryDecision::Abandon
            );
        }
    }

    #[test]
    fn transient_failures_back_off_exponentially() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 3);
        assert_eq!(
            policy.decide(0, ErrorClass::Network),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(1, ErrorClass::ServerTransient),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(2, ErrorClass::Network),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
    }

    #[test]
    fn transient_failures_abandon_at_ceiling() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 3);
        assert_eq!(
            policy.decide(3, ErrorClass::Network),
            RetryDecision::Abandon
        );
        assert_eq!(
            policy.decide(7, ErrorClass::ServerTransient),
            RetryDecision::Abandon
        );
    }

    #[test]
    fn expired_auth_retries_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(0, ErrorClass::AuthExpired),
            RetryDecision::RetryImmediate
        );
    }

    #[test]
    fn classification_covers_client_errors() {
        assert_eq!(
            ErrorClass::classify(&CertifyError::Network("timeout".into())),
            ErrorClass::Network
        );
        assert_eq!(
            ErrorClass::classify(&CertifyError::ServerTransient {
                status: 503,
                message: String::new()
            }),
            ErrorClass::ServerTransient
        );
        assert_eq!(
            ErrorClass::classify(&CertifyError::ClientInvalid {
                status: 422,
                message: String::new()
            }),
            ErrorClass::ClientInvalid
        );
        assert_eq!(
            ErrorClass::classify(&CertifyError::AuthExpired),
            ErrorClass::AuthExpired
        );
    }
}
