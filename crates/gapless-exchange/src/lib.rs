//! 업스트림 캔들 소스.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - Binance 공개 데이터 아카이브 클라이언트 (zip/CSV, 체크섬 검증)
//! - Binance REST 클라이언트 (페이지네이션, 429/418 처리, 펀딩비 이력)
//! - 모든 파이프라인이 공유하는 Token Bucket 레이트 리미터
//! - `DualSourceFetcher`: 아카이브 지연 기준 경로 선택과 청크 분할
//! - `FetchError` 분류 체계

pub mod binance;
pub mod error;
pub mod fetcher;
pub mod rate_limit;

pub use binance::{ArchivePeriod, BinanceArchiveClient, BinanceRestClient, FundingEvent};
pub use error::FetchError;
pub use fetcher::{
    CandleSource, DualSourceFetcher, FailedRange, FetchPlanner, FetchRequest, FetchResult,
    FetchRoute,
};
pub use rate_limit::RateLimiter;
