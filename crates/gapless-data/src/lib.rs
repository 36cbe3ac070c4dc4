//! 캔들 저장, 갭 감지, 적재 및 일관성 쿼리.
//!
//! 이 crate는 다음을 제공합니다:
//! - `CandleStore`: 메모리 / PostgreSQL 저장소 (읽기 시점 병합)
//! - `GapDetector`: 저장된 시각과 기대 시각 비교
//! - `IngestionEngine`: 버전 계산 후 배치 적재
//! - `ConsistentQueryLayer`: 갭을 채운 뒤 읽는 지연 자동 적재 쿼리
//! - `ConcurrencyOrchestrator`: 다중 시리즈 동시 실행과 부분 실패 격리

pub mod error;
pub mod gap;
pub mod ingest;
pub mod orchestrator;
pub mod query;
pub mod storage;

pub use error::{DataError, Result, UnfilledRange, UnitFailure};
pub use gap::GapDetector;
pub use ingest::{IngestReport, IngestionEngine};
pub use orchestrator::{BatchOutcome, ConcurrencyOrchestrator, FailurePolicy};
pub use query::{Clock, ConsistentQueryLayer, FillReport, MultiSymbolResult};
pub use storage::{
    open_store, spawn_compactor, CandleStore, MemoryCandleStore, PgCandleStore, ReadMode,
};
