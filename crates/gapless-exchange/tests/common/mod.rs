//! 통합 테스트 공용 헬퍼.

#![allow(dead_code)]

use gapless_core::{GaplessConfig, RetryPolicy};
use std::io::{Cursor, Write};

pub const T0: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z
pub const HOUR: i64 = 3_600_000;

/// 모든 URL이 mockito 서버를 가리키는 설정.
pub fn config_for(server_url: &str) -> GaplessConfig {
    let mut config = GaplessConfig::default();
    config.exchange.spot_rest_url = server_url.to_string();
    config.exchange.futures_rest_url = server_url.to_string();
    config.exchange.archive_base_url = server_url.to_string();
    config.exchange.request_timeout_secs = 5;
    config.exchange.requests_per_minute = 60_000;
    config.retry.network = RetryPolicy::new(3, 1, 2, 0.0);
    config.fetch.verify_checksums = false;
    config
}

/// REST kline 배열 한 행.
pub fn kline_json(open_ms: i64, close: &str) -> String {
    format!(
        r#"[{},"100.0","110.0","90.0","{}","12.5",{},"1250.0",42,"6.0","600.0","0"]"#,
        open_ms,
        close,
        open_ms + HOUR - 1
    )
}

pub fn klines_body(opens: &[i64]) -> String {
    let rows: Vec<String> = opens.iter().map(|ms| kline_json(*ms, "105.0")).collect();
    format!("[{}]", rows.join(","))
}

/// 아카이브 CSV (헤더 없음, 12열).
pub fn archive_csv(opens: &[i64], close: &str) -> String {
    opens
        .iter()
        .map(|ms| {
            format!(
                "{},100.0,110.0,90.0,{},12.5,{},1250.0,42,6.0,600.0,0\n",
                ms,
                close,
                ms + HOUR - 1
            )
        })
        .collect()
}

/// CSV 한 개를 담은 zip.
pub fn zip_bytes(name: &str, csv: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    writer.start_file(name, options).unwrap();
    writer.write_all(csv.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

pub fn hours(from: i64, count: i64) -> Vec<i64> {
    (0..count).map(|i| from + i * HOUR).collect()
}
