//! 다중 시리즈 동시 실행.
//!
//! 시리즈마다 하나의 tokio 태스크를 띄우고 세마포어로 동시 실행 수를 제한합니다.
//! 기본은 부분 성공 정책이며, 엄격 모드에서는 첫 실패가 나머지 작업을 모두 취소합니다.
//! 거래소 차단처럼 치명적인 실패는 정책과 관계없이 배치 전체를 중단시킵니다.

use crate::error::{DataError, Result, UnitFailure};
use futures::FutureExt;
use gapless_core::{OrchestratorConfig, SeriesId};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 일부 단위가 실패했을 때의 처리 방식.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// 성공한 결과와 실패 보고서를 함께 반환
    #[default]
    PartialSuccess,
    /// 첫 실패 시 나머지를 취소하고 에러 반환
    Strict,
}

/// 배치 실행 결과.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// 성공한 단위 (입력 순서)
    pub succeeded: Vec<(SeriesId, T)>,
    /// 실패한 단위 (입력 순서)
    pub failures: Vec<UnitFailure>,
    pub elapsed: Duration,
}

impl<T> BatchOutcome<T> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 동시 실행 오케스트레이터.
#[derive(Debug, Clone)]
pub struct ConcurrencyOrchestrator {
    max_concurrency: usize,
    policy: FailurePolicy,
}

impl ConcurrencyOrchestrator {
    pub fn new(max_concurrency: usize, policy: FailurePolicy) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            policy,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let policy = if config.strict {
            FailurePolicy::Strict
        } else {
            FailurePolicy::PartialSuccess
        };
        Self::new(config.max_concurrency, policy)
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// 각 시리즈에 대해 `task`를 실행합니다.
    ///
    /// `task`는 시리즈와 해당 단위의 취소 토큰을 받습니다. 토큰은 `cancel`의 자식이므로
    /// 호출자의 취소와 엄격 모드의 취소가 모두 전달됩니다. 차단이나 스키마 불일치로
    /// 중단되면 정책과 관계없이 `PartialPipelineFailure`를 반환하고, 시작하지 못한 단위는
    /// 취소로 보고됩니다.
    pub async fn run<T, F, Fut>(
        &self,
        units: Vec<SeriesId>,
        cancel: &CancellationToken,
        task: F,
    ) -> Result<BatchOutcome<T>>
    where
        T: Send + 'static,
        F: Fn(SeriesId, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let total = units.len();
        let batch_cancel = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let task = Arc::new(task);
        let strict = self.policy == FailurePolicy::Strict;
        let mut set = JoinSet::new();
        let mut pending: Vec<Option<SeriesId>> = Vec::with_capacity(total);

        for (index, series) in units.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let batch = batch_cancel.clone();
            let token = batch_cancel.child_token();
            let task = task.clone();
            pending.push(Some(series.clone()));

            set.spawn(async move {
                let result = tokio::select! {
                    _ = token.cancelled() => Err(DataError::Cancelled),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => {
                            if token.is_cancelled() {
                                Err(DataError::Cancelled)
                            } else {
                                let result = run_guarded(task(series.clone(), token.clone())).await;
                                // 대기 중인 단위가 퍼밋을 받기 전에 배치를 멈춘다
                                if let Err(err) = &result {
                                    if err.is_fatal() || (strict && !err.is_cancelled()) {
                                        batch.cancel();
                                    }
                                }
                                drop(permit);
                                result
                            }
                        }
                        Err(_) => Err(DataError::Cancelled),
                    },
                };
                (index, series, result)
            });
        }

        let mut succeeded = Vec::new();
        let mut failures: Vec<(usize, UnitFailure)> = Vec::new();
        let mut aborted = false;
        let mut fatal = false;

        while let Some(joined) = set.join_next().await {
            let (index, series, result) = match joined {
                Ok(done) => done,
                // 배치 중단으로 abort된 태스크
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    error!(error = %e, "파이프라인 태스크 조인 실패");
                    continue;
                }
            };

            if let Some(slot) = pending.get_mut(index) {
                *slot = None;
            }

            match result {
                Ok(value) => succeeded.push((index, series, value)),
                Err(err) => {
                    if aborted && err.is_cancelled() {
                        if fatal {
                            failures.push((index, UnitFailure { series, error: err }));
                        }
                        continue;
                    }

                    let is_fatal = err.is_fatal();
                    if is_fatal {
                        error!(series = %series, error = %err, "치명적 실패, 배치 중단");
                    } else {
                        warn!(series = %series, error = %err, "파이프라인 실패");
                    }
                    failures.push((index, UnitFailure { series, error: err }));

                    fatal |= is_fatal;
                    if (is_fatal || strict) && !aborted {
                        aborted = true;
                        batch_cancel.cancel();
                        set.abort_all();
                    }
                }
            }
        }

        // 치명적 실패로 중단된 경우 끝나지 못한 단위도 취소로 보고한다
        if fatal {
            for (index, series) in pending.into_iter().enumerate() {
                if let Some(series) = series {
                    failures.push((index, UnitFailure { series, error: DataError::Cancelled }));
                }
            }
        }

        succeeded.sort_by_key(|(index, _, _)| *index);
        failures.sort_by_key(|(index, _)| *index);
        let succeeded: Vec<(SeriesId, T)> = succeeded
            .into_iter()
            .map(|(_, series, value)| (series, value))
            .collect();
        let failures: Vec<UnitFailure> = failures.into_iter().map(|(_, f)| f).collect();
        let elapsed = started.elapsed();

        info!(
            total = total,
            succeeded = succeeded.len(),
            failed = failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "배치 실행 완료"
        );

        if fatal || (strict && !failures.is_empty()) {
            return Err(DataError::PartialPipelineFailure {
                succeeded: succeeded.len(),
                failures,
            });
        }

        Ok(BatchOutcome {
            succeeded,
            failures,
            elapsed,
        })
    }
}

/// 태스크 패닉을 에러로 변환합니다.
async fn run_guarded<T, Fut>(fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "알 수 없는 패닉".to_string());
            Err(DataError::TaskFailed(message))
        }
    }
}
