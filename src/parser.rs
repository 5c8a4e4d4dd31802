// ===============================
// src/parser.rs
// ===============================
//
// Parser access log format "combined" (nginx/apache default):
//
//   203.0.113.9 - - [10/Oct/2023:13:55:36 +0000] "GET /x HTTP/1.1" 200 512 "-" "UA/1.0"
//
// - host, ident, user, [timestamp], "request", status, size, "referrer", "user agent"
// - ident, user, size diabaikan.
// - Timestamp dinormalisasi ke UTC.
// - Field "-" atau kosong => None.
//
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use thiserror::Error;

use crate::domain::AccessRecord;

const DATE_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

// Quoted fields allow backslash escapes (nginx writes \x22 / \" inside user agents).
static LOG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r#"^\s*"#,
        r#"(?P<host>\S+)\s+"#,
        r#"(?P<ident>\S+)\s+"#,
        r#"(?P<user>\S+)\s+"#,
        r#"\[(?P<timestamp>[^\]]+)\]\s+"#,
        r#""(?P<request>(?:[^"\\]|\\.)*)"\s+"#,
        r#"(?P<status>\d{3})\s+"#,
        r#"(?P<size>\S+)\s+"#,
        r#""(?P<referrer>(?:[^"\\]|\\.)*)"\s+"#,
        r#""(?P<user_agent>(?:[^"\\]|\\.)*)"\s*$"#,
    ))
    .expect("log line regex is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line does not match the access log grammar")]
    Grammar,
    #[error("origin `{0}` is not an IP address")]
    Address(String),
    #[error("bad timestamp `{0}`")]
    Timestamp(String),
    #[error("bad status `{0}`")]
    Status(String),
}

fn present(v: &str) -> Option<String> {
    let v = v.trim();
    if v.is_empty() || v == "-" {
        None
    } else {
        Some(v.to_string())
    }
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_str(raw, DATE_FORMAT)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ParseError::Timestamp(raw.to_string()))
}

/// Parse satu baris log -> (alamat, AccessRecord). Tidak pernah menghasilkan record setengah jadi.
pub fn parse_line(line: &str) -> Result<(IpAddr, AccessRecord), ParseError> {
    let caps = LOG_LINE.captures(line).ok_or(ParseError::Grammar)?;

    let host = &caps["host"];
    let address: IpAddr = host
        .parse()
        .map_err(|_| ParseError::Address(host.to_string()))?;
    let timestamp = parse_timestamp(&caps["timestamp"])?;
    let status = caps["status"]
        .parse::<u16>()
        .map_err(|_| ParseError::Status(caps["status"].to_string()))?;

    let record = AccessRecord {
        timestamp,
        request: present(&caps["request"]).unwrap_or_default(),
        status,
        referrer: present(&caps["referrer"]),
        user_agent: present(&caps["user_agent"]).unwrap_or_default(),
    };
    Ok((address, record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LINE: &str =
        r#"203.0.113.9 - - [10/Oct/2023:13:55:36 +0000] "GET /x HTTP/1.1" 200 512 "-" "UA/1.0""#;

    #[test]
    fn parses_combined_line() {
        let (addr, rec) = parse_line(LINE).unwrap();
        assert_eq!(addr, "203.0.113.9".parse::<IpAddr>().unwrap());
        assert_eq!(rec.timestamp, Utc.with_ymd_and_hms(2023, 10, 10, 13, 55, 36).unwrap());
        assert_eq!(rec.request, "GET /x HTTP/1.1");
        assert_eq!(rec.status, 200);
        assert_eq!(rec.referrer, None);
        assert_eq!(rec.user_agent, "UA/1.0");
    }

    #[test]
    fn rejects_unterminated_user_agent() {
        let line =
            r#"203.0.113.9 - - [10/Oct/2023:13:55:36 +0000] "GET /x HTTP/1.1" 200 512 "-" "UA/1.0"#;
        assert_eq!(parse_line(line), Err(ParseError::Grammar));
    }

    #[test]
    fn normalizes_offset_to_utc() {
        let line = r#"198.51.100.7 - alice [10/Oct/2023:15:55:36 +0200] "POST /login HTTP/2.0" 302 0 "https://example.org/" "curl/8.0""#;
        let (_, rec) = parse_line(line).unwrap();
        assert_eq!(rec.timestamp, Utc.with_ymd_and_hms(2023, 10, 10, 13, 55, 36).unwrap());
        assert_eq!(rec.status, 302);
        assert_eq!(rec.referrer.as_deref(), Some("https://example.org/"));
    }

    #[test]
    fn keeps_escaped_quotes_and_ipv6() {
        let line = r#"2001:db8::1 - - [01/Jan/2024:00:00:01 +0000] "GET / HTTP/1.1" 404 10 "" "Mozilla \"x\"""#;
        let (addr, rec) = parse_line(line).unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(rec.referrer, None);
        assert_eq!(rec.user_agent, r#"Mozilla \"x\""#);
    }

    #[test]
    fn rejects_non_ip_origin_and_bad_timestamp() {
        let host = LINE.replacen("203.0.113.9", "example.org", 1);
        assert_eq!(parse_line(&host), Err(ParseError::Address("example.org".into())));

        let ts = LINE.replacen("10/Oct/2023", "10/Foo/2023", 1);
        assert!(matches!(parse_line(&ts), Err(ParseError::Timestamp(_))));

        assert_eq!(parse_line(""), Err(ParseError::Grammar));
    }
}
