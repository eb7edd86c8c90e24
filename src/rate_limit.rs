use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{sync::Mutex, time::Instant};

#[derive(Debug, Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max_requests: max_requests.max(1),
            window,
        }
    }

    /// Records a request for `key`, or returns how many seconds until it may retry.
    pub async fn check(&self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        let window = self.window;
        windows.retain(|_, hits| hits.back().is_some_and(|last| now.duration_since(*last) < window));

        let hits = windows.entry(key.to_string()).or_default();
        while hits
            .front()
            .is_some_and(|first| now.duration_since(*first) >= self.window)
        {
            hits.pop_front();
        }

        if hits.len() >= self.max_requests {
            let retry_after = hits
                .front()
                .map(|first| self.window.saturating_sub(now.duration_since(*first)))
                .unwrap_or(self.window);
            return Err(retry_after.as_secs().max(1));
        }

        hits.push_back(now);
        Ok(())
    }

    pub async fn tracked_clients(&self) -> usize {
        self.windows.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn limits_each_key_independently() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("1.1.1.1").await.is_ok());
        assert!(limiter.check("1.1.1.1").await.is_ok());
        assert_eq!(limiter.check("1.1.1.1").await, Err(60));
        assert!(limiter.check("2.2.2.2").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_forward() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("ip").await.is_ok());

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(limiter.check("ip").await, Err(15));

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(limiter.check("ip").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clients_are_forgotten() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        assert!(limiter.check("1.1.1.1").await.is_ok());
        assert!(limiter.check("2.2.2.2").await.is_ok());
        assert_eq!(limiter.tracked_clients().await, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("3.3.3.3").await.is_ok());
        assert_eq!(limiter.tracked_clients().await, 1);
    }
}
