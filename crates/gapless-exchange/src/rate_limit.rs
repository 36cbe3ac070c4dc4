//! 공유 REST 레이트 리미터.
//!
//! Token Bucket 알고리즘. 모든 파이프라인이 하나의 `Arc<RateLimiter>`를 공유합니다.
//! 서버가 `Retry-After`를 보내면 해당 시간 동안 모든 호출이 대기합니다.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug)]
struct TokenBucket {
    /// 현재 토큰 수
    tokens: f64,
    /// 마지막 리필 시간
    last_refill: Instant,
    /// 버킷 용량
    max_tokens: f64,
    /// 초당 리필 토큰 수
    refill_rate: f64,
    /// 서버 지시로 일시정지된 시각까지
    paused_until: Option<Instant>,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// 토큰을 소비하거나, 다음 시도까지 기다릴 시간을 반환합니다.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(until) = self.paused_until {
            if now < until {
                return Err(until - now);
            }
            self.paused_until = None;
        }

        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let secs = (1.0 - self.tokens) / self.refill_rate;
            Err(Duration::from_secs_f64(secs))
        }
    }
}

/// 분당 요청 한도를 강제하는 레이트 리미터.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// 분당 요청 수와 버스트 허용량으로 생성합니다.
    pub fn new(requests_per_minute: u32, burst_size: u32) -> Self {
        let refill_rate = requests_per_minute.max(1) as f64 / 60.0;
        let max_tokens = refill_rate.max(1.0) + burst_size as f64;
        Self {
            bucket: Mutex::new(TokenBucket {
                tokens: max_tokens,
                last_refill: Instant::now(),
                max_tokens,
                refill_rate,
                paused_until: None,
            }),
        }
    }

    /// 분당 요청 수만으로 생성합니다. 버스트는 한도의 10%입니다.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute, requests_per_minute / 10)
    }

    /// 토큰 하나를 얻을 때까지 대기합니다.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.try_acquire(Instant::now())
            };
            match wait {
                Ok(()) => return,
                Err(delay) => {
                    debug!(wait_ms = delay.as_millis() as u64, "레이트 리미터 대기");
                    sleep(delay).await;
                }
            }
        }
    }

    /// 모든 호출을 `duration` 동안 멈춥니다. 기존 정지 시각보다 늦을 때만 연장합니다.
    pub async fn pause_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut bucket = self.bucket.lock().await;
        bucket.paused_until = Some(match bucket.paused_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        // 초당 1회, 버스트 없음 → 용량 1
        let limiter = RateLimiter::new(60, 0);
        let start = Instant::now();

        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(1_990));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_all_callers() {
        let limiter = RateLimiter::new(6_000, 100);
        limiter.pause_for(Duration::from_secs(5)).await;
        let start = Instant::now();

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_pause_does_not_shrink_existing() {
        let limiter = RateLimiter::new(6_000, 100);
        limiter.pause_for(Duration::from_secs(10)).await;
        limiter.pause_for(Duration::from_secs(1)).await;
        let start = Instant::now();

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }
}
