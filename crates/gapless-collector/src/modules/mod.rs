//! 수집 명령 모듈.

pub mod collect;
pub mod output;

pub use collect::{collect_series, collection_range, run_cycle};
pub use output::write_json_lines;
