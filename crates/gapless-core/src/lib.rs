//! # Gapless Core
//!
//! 캔들 수집 파이프라인 전반에서 사용하는 핵심 타입을 제공합니다:
//! - 타임프레임, 상품 유형, 시리즈 식별자, 시간 범위
//! - 캔들 / 원시 캔들 / 갭 도메인 모델
//! - 결정적 버전 해시 (VersionHasher)
//! - 재시도 정책
//! - 설정 관리
//! - 로깅 인프라

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod retry;
pub mod types;
pub mod version;

pub use config::*;
pub use domain::*;
pub use error::*;
pub use logging::*;
pub use retry::RetryPolicy;
pub use types::*;
pub use version::{candle_version, VersionInput};
