//! Apache common/combined log format parser
//!
//! Used by the geoserver extractor to pull workspace usage out of nginx
//! access logs (which use the same format).

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

// "%h %l %u %t \"%r\" %>s %b \"%{Referer}i\" \"%{User-agent}i\""
static COMBINED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?P<h>[^ ]*) (?P<l>[^ ]*) (?P<u>[^ ]*) \[(?P<t>[^\]]*)\] "(?P<r>[^"]*)" (?P<s>[^ ]*) (?P<b>[^ ]*) "(?P<referer>[^"]*)" "(?P<agent>[^"]*)""#,
    )
    .expect("valid regex")
});
static COMMON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?P<h>[^ ]*) (?P<l>[^ ]*) (?P<u>[^ ]*) \[(?P<t>[^\]]*)\] "(?P<r>[^"]*)" (?P<s>[^ ]*) (?P<b>[^ ]*)"#,
    )
    .expect("valid regex")
});

/// One access log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClfRecord {
    pub remote_host: String,
    pub ident: String,
    pub user: String,
    /// First line of the request: `GET /some/path HTTP/1.1`
    pub request: String,
    pub status: String,
    pub bytes: String,
    pub referer: String,
    pub user_agent: String,
    pub time: Option<NaiveDateTime>,
    pub timezone: String,
}

impl ClfRecord {
    /// Parse one log line; combined format first, common format as
    /// fallback. Returns None for lines in neither format.
    pub fn parse(line: &str) -> Option<Self> {
        let (captures, has_referer) = match COMBINED.captures(line) {
            Some(captures) => (captures, true),
            None => (COMMON.captures(line)?, false),
        };

        let t = &captures["t"];
        // '15/Nov/2018:06:25:14 +0100'
        let time = t
            .get(0..20)
            .and_then(|stamp| NaiveDateTime::parse_from_str(stamp, "%d/%b/%Y:%H:%M:%S").ok());
        let timezone = t.get(21..26).unwrap_or("").to_string();

        Some(ClfRecord {
            remote_host: captures["h"].to_string(),
            ident: captures["l"].to_string(),
            user: captures["u"].to_string(),
            request: captures["r"].to_string(),
            status: captures["s"].to_string(),
            bytes: captures["b"].to_string(),
            referer: if has_referer {
                captures["referer"].to_string()
            } else {
                String::new()
            },
            user_agent: if has_referer {
                captures["agent"].to_string()
            } else {
                String::new()
            },
            time,
            timezone,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const COMBINED_LINE: &str = r#"10.100.110.89 - - [15/Nov/2018:06:25:14 +0100] "GET /geoserver/klimaatatlas/wms?service=WMS&request=GetMap HTTP/1.1" 200 1796 "https://wpn.klimaatatlas.net/" "Mozilla/5.0""#;

    #[test]
    fn test_parse_combined() {
        let record = ClfRecord::parse(COMBINED_LINE).unwrap();
        assert_eq!(record.remote_host, "10.100.110.89");
        assert_eq!(record.status, "200");
        assert_eq!(record.bytes, "1796");
        assert_eq!(record.referer, "https://wpn.klimaatatlas.net/");
        assert_eq!(record.user_agent, "Mozilla/5.0");
        assert!(record.request.starts_with("GET /geoserver/"));
    }

    #[test]
    fn test_parse_timestamp() {
        let record = ClfRecord::parse(COMBINED_LINE).unwrap();
        let time = record.time.unwrap();
        assert_eq!(time.year(), 2018);
        assert_eq!(time.month(), 11);
        assert_eq!(time.day(), 15);
        assert_eq!(time.hour(), 6);
        assert_eq!(record.timezone, "+0100");
    }

    #[test]
    fn test_parse_common_format() {
        let line = r#"127.0.0.1 - frank [10/Oct/2000:13:55:36 -0700] "GET /apache_pb.gif HTTP/1.0" 200 2326"#;
        let record = ClfRecord::parse(line).unwrap();
        assert_eq!(record.user, "frank");
        assert_eq!(record.referer, "");
        assert_eq!(record.user_agent, "");
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(ClfRecord::parse("not a log line"), None);
        assert_eq!(ClfRecord::parse(""), None);
    }
}
