//! 설정 관리.
//!
//! 모든 컴포넌트는 전역 상태 대신 `GaplessConfig` 값을 명시적으로 전달받습니다.
//! TOML 파일과 `GAPLESS__SECTION__KEY` 환경 변수에서 로드합니다.

use crate::error::{CoreError, CoreResult};
use crate::logging::{LogConfig, LogFormat};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 전체 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GaplessConfig {
    /// 업스트림 거래소 설정
    pub exchange: ExchangeConfig,
    /// 페치 라우팅 설정
    pub fetch: FetchConfig,
    /// 재시도 정책
    pub retry: RetryConfig,
    /// 적재 설정
    pub ingest: IngestConfig,
    /// 동시 실행 설정
    pub orchestrator: OrchestratorConfig,
    /// 저장소 설정
    pub storage: StorageConfig,
    /// 로깅 설정
    pub logging: LoggingConfig,
}

/// 업스트림 거래소 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// 현물 REST 기본 URL
    pub spot_rest_url: String,
    /// USD-M 선물 REST 기본 URL
    pub futures_rest_url: String,
    /// 대량 아카이브 CDN 기본 URL
    pub archive_base_url: String,
    /// 네트워크 호출당 타임아웃 (초)
    pub request_timeout_secs: u64,
    /// 분당 요청 한도 (공유 레이트 리미터)
    pub requests_per_minute: u32,
    /// 현물 페이지당 최대 행 수
    pub spot_page_limit: u32,
    /// 선물 페이지당 최대 행 수
    pub futures_page_limit: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            spot_rest_url: "https://api.binance.com".to_string(),
            futures_rest_url: "https://fapi.binance.com".to_string(),
            archive_base_url: "https://data.binance.vision".to_string(),
            request_timeout_secs: 30,
            requests_per_minute: 1200,
            spot_page_limit: 1000,
            futures_page_limit: 1500,
        }
    }
}

/// 페치 라우팅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    /// 아카이브 게시 지연 허용치 (시간). 이보다 최근 구간은 REST로 가져옵니다.
    pub archive_lag_hours: u32,
    /// 아카이브 경로를 사용할 최소 캔들 수
    pub bulk_min_candles: u64,
    /// 요청 청크당 최대 캔들 수
    pub max_chunk_candles: u64,
    /// `.CHECKSUM` 사이드카 검증 여부
    pub verify_checksums: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            archive_lag_hours: 48,
            bulk_min_candles: 1000,
            max_chunk_candles: 50_000,
            verify_checksums: true,
        }
    }
}

impl FetchConfig {
    pub fn archive_lag(&self) -> chrono::Duration {
        chrono::Duration::hours(self.archive_lag_hours as i64)
    }
}

/// 재시도 정책 묶음.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 네트워크 호출 (페이지/아카이브 단위)
    pub network: RetryPolicy,
    /// 저장소 배치 쓰기
    pub storage: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            network: RetryPolicy::default_network(),
            storage: RetryPolicy::default_storage(),
        }
    }
}

/// 적재 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestConfig {
    /// 저장소 벌크 INSERT 한 번에 보낼 최대 행 수
    pub insert_chunk_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            insert_chunk_size: 500,
        }
    }
}

/// 동시 실행 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// 동시에 실행할 최대 파이프라인 수
    pub max_concurrency: usize,
    /// 첫 실패 시 전체 취소 여부
    pub strict: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            strict: false,
        }
    }
}

/// 저장소 백엔드.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// 프로세스 내 메모리
    #[default]
    Memory,
    /// PostgreSQL
    Postgres,
}

/// 같은 식별자의 물리 행이 여러 개일 때 보이는 행을 고르는 규칙.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// 가장 나중에 적재된 행
    #[default]
    LatestIngested,
    /// 버전 값이 가장 큰 행
    HighestVersion,
}

/// 저장소 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// PostgreSQL 연결 문자열
    pub database_url: Option<String>,
    /// 최대 연결 수
    pub max_connections: u32,
    /// 병합 규칙
    pub merge_policy: MergePolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: None,
            max_connections: 10,
            merge_policy: MergePolicy::LatestIngested,
        }
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// `init_logging`에 전달할 설정으로 변환합니다.
    pub fn to_log_config(&self) -> LogConfig {
        let format = self.format.parse().unwrap_or(LogFormat::Pretty);
        LogConfig::new(self.level.clone()).with_format(format)
    }
}

impl GaplessConfig {
    /// 파일(선택)과 환경 변수에서 설정을 로드합니다.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("GAPLESS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// TOML 문자열에서 설정을 로드합니다.
    pub fn from_toml_str(toml: &str) -> CoreResult<Self> {
        let loaded: Self = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// 값 범위를 검증합니다.
    pub fn validate(&self) -> CoreResult<()> {
        if self.orchestrator.max_concurrency == 0 {
            return Err(CoreError::Config(
                "orchestrator.max_concurrency는 1 이상이어야 합니다".to_string(),
            ));
        }
        if self.exchange.requests_per_minute == 0 {
            return Err(CoreError::Config(
                "exchange.requests_per_minute는 1 이상이어야 합니다".to_string(),
            ));
        }
        if self.fetch.max_chunk_candles == 0 {
            return Err(CoreError::Config(
                "fetch.max_chunk_candles는 1 이상이어야 합니다".to_string(),
            ));
        }
        if self.exchange.spot_page_limit == 0 || self.exchange.futures_page_limit == 0 {
            return Err(CoreError::Config(
                "페이지 한도는 1 이상이어야 합니다".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Postgres && self.storage.database_url.is_none() {
            return Err(CoreError::Config(
                "postgres 백엔드에는 storage.database_url이 필요합니다".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GaplessConfig::default();
        assert_eq!(config.orchestrator.max_concurrency, 4);
        assert_eq!(config.fetch.archive_lag(), chrono::Duration::days(2));
        assert_eq!(config.exchange.spot_page_limit, 1000);
        assert_eq!(config.storage.merge_policy, MergePolicy::LatestIngested);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = GaplessConfig::from_toml_str(
            r#"
            [fetch]
            archive_lag_hours = 72

            [orchestrator]
            strict = true

            [storage]
            merge_policy = "highest_version"

            [retry.network]
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.fetch.archive_lag_hours, 72);
        assert_eq!(config.fetch.bulk_min_candles, 1000);
        assert!(config.orchestrator.strict);
        assert_eq!(config.orchestrator.max_concurrency, 4);
        assert_eq!(config.storage.merge_policy, MergePolicy::HighestVersion);
        assert_eq!(config.retry.network.max_attempts, 2);
        assert_eq!(config.retry.network.base_delay_ms, 250);
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let result = GaplessConfig::from_toml_str("[orchestrator]\nmax_concurrency = 0\n");
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_postgres_requires_url() {
        let result = GaplessConfig::from_toml_str("[storage]\nbackend = \"postgres\"\n");
        assert!(result.is_err());
    }
}
