//! Gapless 캔들 수집기.
//!
//! 이 crate는 파이프라인을 실행하는 `gapless` 바이너리를 제공합니다:
//! - 갭 감지 / 채우기 / 조회 (단일 시리즈)
//! - 여러 시리즈 동시 수집 (부분 성공 또는 엄격 모드)
//! - 데몬 모드: 주기적 수집과 병합 정리

pub mod config;
pub mod error;
pub mod modules;
pub mod stats;

pub use config::CollectorConfig;
pub use error::{CollectorError, Result};
pub use stats::CollectionStats;
