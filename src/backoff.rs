// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff between allocation attempts.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AllocatorError;
use crate::Result;

/// Backoff state for one retry sequence. Each [`Exponential::wait`] sleeps
/// `min * factor^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Exponential {
    min: Duration,
    max: Duration,
    factor: f64,
    attempt: u32,
}

impl Exponential {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Exponential {
            min,
            max,
            factor,
            attempt: 0,
        }
    }

    fn next_delay(&self) -> Duration {
        let secs = self.min.as_secs_f64() * self.factor.powi(self.attempt as i32);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Sleep for the next interval or return `Cancelled` if the token fires
    /// first.
    pub async fn wait(&mut self, token: &CancellationToken) -> Result<()> {
        let delay = self.next_delay();
        self.attempt += 1;
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                Err(AllocatorError::Cancelled("waiting to retry".into()).into())
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_saturate() {
        let mut boff = Exponential::new(
            Duration::from_millis(20),
            Duration::from_millis(100),
            2.0,
        );
        assert_eq!(boff.next_delay(), Duration::from_millis(20));
        boff.attempt = 1;
        assert_eq!(boff.next_delay(), Duration::from_millis(40));
        boff.attempt = 10;
        assert_eq!(boff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_advances_with_virtual_time() {
        let mut boff = Exponential::new(Duration::from_millis(20), Duration::from_secs(5), 2.0);
        let token = CancellationToken::new();
        boff.wait(&token).await.unwrap();
        boff.wait(&token).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_token_aborts_wait() {
        let mut boff = Exponential::new(Duration::from_secs(60), Duration::from_secs(60), 2.0);
        let token = CancellationToken::new();
        token.cancel();
        let err = boff.wait(&token).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AllocatorError>(),
            Some(AllocatorError::Cancelled(_))
        ));
    }
}
