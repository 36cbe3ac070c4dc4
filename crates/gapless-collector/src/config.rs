//! 환경변수 기반 설정 모듈.
//!
//! 파이프라인 설정(`GaplessConfig`)은 TOML 파일과 `GAPLESS__*` 환경변수에서,
//! 수집 대상과 데몬 주기는 `.env` / 환경변수에서 읽습니다.

use crate::error::{CollectorError, Result};
use chrono::Duration as ChronoDuration;
use gapless_core::{GaplessConfig, InstrumentType, SeriesId, StorageBackend, Timeframe};
use std::path::Path;
use std::time::Duration;

/// Collector 전체 설정
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// 파이프라인 설정
    pub gapless: GaplessConfig,
    /// 수집 대상 설정
    pub collect: CollectTargetConfig,
    /// 데몬 모드 설정
    pub daemon: DaemonConfig,
}

/// 수집 대상 설정
#[derive(Debug, Clone)]
pub struct CollectTargetConfig {
    /// 수집할 심볼 (대문자)
    pub symbols: Vec<String>,
    /// 수집할 타임프레임
    pub timeframes: Vec<Timeframe>,
    pub instrument: InstrumentType,
    /// 현재 시각 기준 수집 기간 (일)
    pub lookback_days: i64,
}

/// 데몬 모드 설정
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// 수집 주기 (분 단위)
    pub interval_minutes: u64,
}

impl CollectorConfig {
    /// 설정 파일(선택)과 환경변수에서 설정 로드
    pub fn from_env(config_path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();
        let gapless = GaplessConfig::load(config_path)?;
        Self::from_lookup(gapless, |key| std::env::var(key).ok())
    }

    /// 주어진 조회 함수로 수집 설정을 채웁니다.
    pub fn from_lookup<F>(mut gapless: GaplessConfig, get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = get("DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            gapless.storage.backend = StorageBackend::Postgres;
            gapless.storage.database_url = Some(url);
        }

        let symbols = parse_symbols(&get("COLLECTOR_SYMBOLS").unwrap_or_else(|| "BTCUSDT,ETHUSDT".into()));
        if symbols.is_empty() {
            return Err(CollectorError::Config(
                "COLLECTOR_SYMBOLS에 수집할 심볼이 없습니다".to_string(),
            ));
        }

        let timeframes =
            parse_timeframes(&get("COLLECTOR_TIMEFRAMES").unwrap_or_else(|| "1h".into()))?;
        let instrument: InstrumentType = get("COLLECTOR_INSTRUMENT")
            .unwrap_or_else(|| "spot".into())
            .parse()?;

        let lookback_days: i64 = parse_or(get("COLLECTOR_LOOKBACK_DAYS"), 7);
        if lookback_days <= 0 {
            return Err(CollectorError::Config(
                "COLLECTOR_LOOKBACK_DAYS는 1 이상이어야 합니다".to_string(),
            ));
        }

        Ok(Self {
            gapless,
            collect: CollectTargetConfig {
                symbols,
                timeframes,
                instrument,
                lookback_days,
            },
            daemon: DaemonConfig {
                interval_minutes: parse_or(get("DAEMON_INTERVAL_MINUTES"), 60).max(1),
            },
        })
    }
}

impl CollectTargetConfig {
    /// 심볼 × 타임프레임 조합의 시리즈 목록
    pub fn series(&self) -> Vec<SeriesId> {
        self.symbols
            .iter()
            .flat_map(|symbol| {
                self.timeframes
                    .iter()
                    .map(move |tf| SeriesId::new(symbol.clone(), *tf, self.instrument))
            })
            .collect()
    }

    pub fn lookback(&self) -> ChronoDuration {
        ChronoDuration::days(self.lookback_days)
    }
}

impl DaemonConfig {
    /// 수집 주기를 Duration으로 반환
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

/// 쉼표로 구분된 심볼 목록 파싱
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut symbols: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    symbols.dedup();
    symbols
}

fn parse_timeframes(raw: &str) -> Result<Vec<Timeframe>> {
    let timeframes = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Timeframe>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if timeframes.is_empty() {
        return Err(CollectorError::Config(
            "COLLECTOR_TIMEFRAMES에 타임프레임이 없습니다".to_string(),
        ));
    }
    Ok(timeframes)
}

/// 값을 파싱 (없거나 실패 시 기본값 사용)
fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
