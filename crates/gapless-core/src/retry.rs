//! 재시도 정책.
//!
//! 지터가 포함된 지수 백오프로 비동기 작업을 재시도합니다.
//! 재시도 가능 여부는 호출자가 에러 타입별로 판단합니다.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// 지수 백오프 재시도 정책.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 최대 시도 횟수 (첫 시도 포함)
    pub max_attempts: usize,
    /// 기본 지연 (밀리초)
    pub base_delay_ms: u64,
    /// 최대 지연 (밀리초)
    pub max_delay_ms: u64,
    /// 지터 비율 (0.0 ~ 1.0)
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let base_delay_ms = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// 네트워크 호출용 기본값.
    pub fn default_network() -> Self {
        Self::new(5, 250, 5_000, 0.25)
    }

    /// 저장소 배치 쓰기용 기본값.
    pub fn default_storage() -> Self {
        Self::new(3, 200, 2_000, 0.2)
    }

    /// 설정값을 다시 검증한 정책을 반환합니다.
    pub fn normalized(&self) -> Self {
        Self::new(
            self.max_attempts,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_pct,
        )
    }

    /// `attempt`번째 실패(0부터) 이후의 대기 시간.
    pub fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let jittered = if self.jitter_pct > 0.0 {
            let spread = (delay as f64 * self.jitter_pct) as i64;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            delay.saturating_add_signed(delta)
        } else {
            delay
        };
        Duration::from_millis(jittered)
    }

    /// 모든 에러를 재시도합니다.
    pub async fn retry_async<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_async_when(op, |_| true).await
    }

    /// `should_retry`가 참인 에러만 재시도합니다. 나머지는 즉시 반환합니다.
    pub async fn retry_async_when<F, Fut, T, E, P>(&self, mut op: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !should_retry(&err) {
                        return Err(err);
                    }
                    sleep(self.next_delay(attempt - 1)).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_network()
    }
}
