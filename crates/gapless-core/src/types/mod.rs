//! 수집 파이프라인 전반에서 사용되는 공통 타입.

mod instrument;
mod range;
mod timeframe;

pub use instrument::*;
pub use range::*;
pub use timeframe::*;
