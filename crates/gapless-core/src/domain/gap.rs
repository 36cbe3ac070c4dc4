//! 갭(누락 구간) 모델.

use crate::types::{TimeRange, Timeframe};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 갭의 위치.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    /// 첫 저장 행 이전
    Leading,
    /// 저장 행 사이
    Interior,
    /// 마지막 저장 행 이후
    Trailing,
    /// 범위 내 저장 행 없음
    Full,
}

/// 누락 구간. `range_start`, `range_end` 모두 포함이며 타임프레임 경계에 정렬됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub missing_count: u64,
    pub kind: GapKind,
}

impl Gap {
    /// 포함 경계로 갭을 생성합니다. 길이가 0 이하이면 `None`.
    pub fn between(
        first_missing: DateTime<Utc>,
        last_missing: DateTime<Utc>,
        timeframe: Timeframe,
        kind: GapKind,
    ) -> Option<Self> {
        if last_missing < first_missing {
            return None;
        }
        let span = last_missing.timestamp_millis() - first_missing.timestamp_millis();
        let missing_count = (span / timeframe.interval_ms() + 1) as u64;
        Some(Self {
            range_start: first_missing,
            range_end: last_missing,
            missing_count,
            kind,
        })
    }

    /// 페처에 전달할 반개구간 `[range_start, range_end + interval)`.
    pub fn fetch_range(&self, timeframe: Timeframe) -> TimeRange {
        TimeRange {
            start: self.range_start,
            end: self.range_end + timeframe.chrono_duration(),
        }
    }

    /// 갭의 일부가 아카이브 미게시 구간(`now - lag` 이후)에 걸치는지 여부.
    pub fn overlaps_archive_lag(&self, now: DateTime<Utc>, lag: Duration) -> bool {
        self.range_end >= now - lag
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} ~ {} ({}개)",
            self.kind,
            self.range_start.to_rfc3339(),
            self.range_end.to_rfc3339(),
            self.missing_count
        )
    }
}
