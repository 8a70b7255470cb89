use std::time::Duration;

/// Delay schedule for re-requesting peaks that were not ready yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub initial: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            factor: 2,
            max_delay: Duration::from_secs(1),
            max_attempts: 8,
        }
    }
}

impl RetryBackoff {
    /// The successive waits between attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let backoff = *self;
        let mut next = backoff.initial.min(backoff.max_delay);
        (0..backoff.max_attempts).map(move |_| {
            let delay = next;
            next = next
                .checked_mul(backoff.factor.max(1))
                .unwrap_or(backoff.max_delay)
                .min(backoff.max_delay);
            delay
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_to_the_cap() {
        let backoff = RetryBackoff {
            initial: Duration::from_millis(100),
            factor: 3,
            max_delay: Duration::from_millis(500),
            max_attempts: 4,
        };
        let delays: Vec<u64> = backoff.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 300, 500, 500]);
    }

    #[test]
    fn zero_attempts_means_no_retry() {
        let backoff = RetryBackoff {
            max_attempts: 0,
            ..RetryBackoff::default()
        };
        assert_eq!(backoff.delays().count(), 0);
    }
}
