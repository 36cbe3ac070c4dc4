//! JSON Lines 출력.

use crate::Result;
use serde::Serialize;
use std::io::Write;

/// 항목마다 한 줄의 JSON을 씁니다. 쓴 줄 수를 반환합니다.
pub fn write_json_lines<W, T>(writer: &mut W, items: &[T]) -> Result<usize>
where
    W: Write,
    T: Serialize,
{
    for item in items {
        serde_json::to_writer(&mut *writer, item)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(items.len())
}
