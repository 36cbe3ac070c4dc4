//! `gapless` 수집기 CLI.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use gapless_collector::{modules, CollectorConfig};
use gapless_core::{init_logging, InstrumentType, SeriesId, TimeRange, Timeframe};
use gapless_data::{open_store, spawn_compactor, ConsistentQueryLayer, FailurePolicy};
use gapless_exchange::DualSourceFetcher;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "gapless")]
#[command(about = "Gap-free OHLCV candle collector", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 설정 파일 경로 (TOML)
    #[arg(long, global = true, env = "GAPLESS_CONFIG")]
    config: Option<PathBuf>,

    /// 로그 레벨 (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Args, Clone)]
struct SeriesArgs {
    /// 심볼 (예: BTCUSDT)
    #[arg(long)]
    symbol: String,

    /// 타임프레임 (1m, 3m, ... 1h, 1d, 1w)
    #[arg(long, default_value = "1h")]
    timeframe: Timeframe,

    /// 상품 유형 (spot, futures)
    #[arg(long, default_value = "spot")]
    instrument: InstrumentType,
}

impl SeriesArgs {
    fn series(&self) -> SeriesId {
        SeriesId::new(self.symbol.to_uppercase(), self.timeframe, self.instrument)
    }
}

#[derive(Args, Clone)]
struct RangeArgs {
    /// 시작 시각 (RFC 3339, 포함)
    #[arg(long)]
    start: DateTime<Utc>,

    /// 종료 시각 (RFC 3339, 제외)
    #[arg(long)]
    end: DateTime<Utc>,
}

impl RangeArgs {
    fn range(&self) -> anyhow::Result<TimeRange> {
        Ok(TimeRange::new(self.start, self.end)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// 저장소를 변경하지 않고 갭만 감지 (JSON Lines 출력)
    Detect {
        #[command(flatten)]
        series: SeriesArgs,
        #[command(flatten)]
        range: RangeArgs,
    },

    /// 범위의 갭을 채우고 결과 보고서 출력
    Fill {
        #[command(flatten)]
        series: SeriesArgs,
        #[command(flatten)]
        range: RangeArgs,
    },

    /// 갭을 채운 뒤 캔들 조회 (JSON Lines 출력)
    Query {
        #[command(flatten)]
        series: SeriesArgs,

        /// 시작 시각 (RFC 3339)
        #[arg(long, requires = "end", conflicts_with = "latest")]
        start: Option<DateTime<Utc>>,

        /// 종료 시각 (RFC 3339)
        #[arg(long, requires = "start")]
        end: Option<DateTime<Utc>>,

        /// 최신 N개 캔들
        #[arg(long, required_unless_present = "start")]
        latest: Option<usize>,
    },

    /// 설정된 심볼 전체 수집
    Collect {
        /// 특정 심볼만 수집 (쉼표로 구분, 예: "BTCUSDT,ETHUSDT")
        #[arg(long)]
        symbols: Option<String>,

        /// 첫 실패 시 전체 중단
        #[arg(long)]
        strict: bool,
    },

    /// 데몬 모드: 주기적 수집과 백그라운드 병합 정리
    Daemon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 설정 로드
    let mut config =
        CollectorConfig::from_env(cli.config.as_deref()).context("설정 로드 실패")?;

    // 로깅 초기화
    let mut log_config = config.gapless.logging.to_log_config().override_from_env();
    if let Some(level) = cli.log_level.clone() {
        log_config.level = level;
    }
    init_logging(log_config)?;

    tracing::info!("Gapless Collector 시작");
    tracing::debug!(
        backend = ?config.gapless.storage.backend,
        symbols = config.collect.symbols.len(),
        "설정 로드 완료"
    );

    // 파이프라인 구성
    let store = open_store(&config.gapless).await?;
    let source = Arc::new(DualSourceFetcher::from_config(&config.gapless)?);
    let mut layer = ConsistentQueryLayer::new(&config.gapless, store.clone(), source);

    // 명령 실행
    match cli.command {
        Commands::Detect { series, range } => {
            let gaps = layer.detect_gaps(&series.series(), &range.range()?).await?;
            let mut out = std::io::stdout().lock();
            modules::write_json_lines(&mut out, &gaps)?;
        }
        Commands::Fill { series, range } => {
            let report = layer.fill_gaps(&series.series(), &range.range()?).await?;
            let mut out = std::io::stdout().lock();
            modules::write_json_lines(&mut out, &[report])?;
        }
        Commands::Query {
            series,
            start,
            end,
            latest,
        } => {
            let id = series.series();
            let candles = match (start, end, latest) {
                (Some(start), Some(end), _) => {
                    layer.query_range(&id, &TimeRange::new(start, end)?).await?
                }
                (_, _, Some(n)) => layer.query_latest(&id, n).await?,
                _ => anyhow::bail!("--start/--end 또는 --latest 중 하나가 필요합니다"),
            };
            let mut out = std::io::stdout().lock();
            let written = modules::write_json_lines(&mut out, &candles)?;
            tracing::info!(series = %id, rows = written, "조회 완료");
        }
        Commands::Collect { symbols, strict } => {
            if let Some(symbols) = symbols {
                config.collect.symbols = gapless_collector::config::parse_symbols(&symbols);
            }
            if strict {
                let orchestrator = layer.orchestrator().clone().with_policy(FailurePolicy::Strict);
                layer = layer.with_orchestrator(orchestrator);
            }

            let cancel = shutdown_token();
            let range = modules::collection_range(config.collect.lookback(), Utc::now())?;
            let stats =
                modules::collect_series(&layer, &config.collect.series(), &range, &cancel).await?;
            stats.log_summary("캔들 수집");
        }
        Commands::Daemon => {
            tracing::info!(
                "=== 데몬 모드 시작 (주기: {}분) ===",
                config.daemon.interval_minutes
            );

            let shutdown = shutdown_token();
            let compactor =
                spawn_compactor(store.clone(), config.daemon.interval(), shutdown.clone());
            let mut interval = tokio::time::interval(config.daemon.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("종료 신호 수신, 데몬 종료 중...");
                        break;
                    }
                    _ = interval.tick() => {
                        tracing::info!("=== 수집 주기 시작 ===");

                        match modules::run_cycle(&layer, &config, Utc::now(), &shutdown).await {
                            Ok(stats) => stats.log_summary("주기 수집"),
                            Err(e) => tracing::error!("수집 주기 실패: {}", e),
                        }

                        tracing::info!(
                            "=== 수집 주기 완료, 다음 실행: {}분 후 ===",
                            config.daemon.interval_minutes
                        );
                    }
                }
            }

            if let Err(e) = compactor.await {
                tracing::error!("백그라운드 압축 태스크 종료 실패: {}", e);
            }
        }
    }

    tracing::info!(store = store.name(), "Gapless Collector 종료");
    Ok(())
}

/// Ctrl-C 수신 시 취소되는 토큰
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C 수신, 진행 중인 작업 취소");
            trigger.cancel();
        }
    });
    token
}
