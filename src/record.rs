use std::borrow::Cow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Fields up to and including the trace id; everything after is optional and
/// depends on the log format version the load balancer writes.
pub const MIN_FIELDS: usize = 18;

const TYPE: usize = 0;
const TIME: usize = 1;
const ELB: usize = 2;
const CLIENT: usize = 3;
const TARGET: usize = 4;
const REQUEST_TIME: usize = 5;
const TARGET_TIME: usize = 6;
const RESPONSE_TIME: usize = 7;
const ELB_STATUS: usize = 8;
const TARGET_STATUS: usize = 9;
const RECEIVED_BYTES: usize = 10;
const SENT_BYTES: usize = 11;
const REQUEST: usize = 12;
const USER_AGENT: usize = 13;
const SSL_CIPHER: usize = 14;
const SSL_PROTOCOL: usize = 15;
const TARGET_GROUP: usize = 16;
const TRACE_ID: usize = 17;
const DOMAIN_NAME: usize = 18;
const ACTIONS_EXECUTED: usize = 22;
const REDIRECT_URL: usize = 23;
const ERROR_REASON: usize = 24;
const CLASSIFICATION: usize = 27;
const CLASSIFICATION_REASON: usize = 28;
const CONN_TRACE_ID: usize = 29;

/// Why a line was rejected. Lines are never fatal; the reason only feeds counters.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MalformedReason {
    #[error("only {0} fields")]
    TooFewFields(usize),
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("stray quote")]
    StrayQuote,
    #[error("bad timestamp")]
    BadTimestamp,
    #[error("bad {0} address")]
    BadAddress(&'static str),
    #[error("bad {0}")]
    BadNumber(&'static str),
    #[error("bad request line")]
    BadRequestLine,
}

/// One ALB access log entry. Optional fields were `-` (or `-1` for timings) in the source line.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogRecord {
    pub kind: String,
    pub time: DateTime<Utc>,
    pub elb: String,
    pub client_ip: String,
    pub client_port: u16,
    pub target_ip: Option<String>,
    pub target_port: Option<u16>,
    pub request_processing_time: Option<f64>,
    pub target_processing_time: Option<f64>,
    pub response_processing_time: Option<f64>,
    pub elb_status: Option<u16>,
    pub target_status: Option<u16>,
    pub received_bytes: Option<u64>,
    pub sent_bytes: Option<u64>,
    pub method: Option<String>,
    pub url: String,
    pub protocol: Option<String>,
    pub user_agent: Option<String>,
    pub ssl_cipher: Option<String>,
    pub ssl_protocol: Option<String>,
    pub target_group_arn: Option<String>,
    pub trace_id: Option<String>,
    pub domain_name: Option<String>,
    pub actions_executed: Option<String>,
    pub redirect_url: Option<String>,
    pub error_reason: Option<String>,
    pub classification: Option<String>,
    pub classification_reason: Option<String>,
    pub conn_trace_id: Option<String>,
}

impl LogRecord {
    /// Sum of the measured processing times; unmeasured components count as zero.
    pub fn total_time(&self) -> f64 {
        [self.request_processing_time, self.target_processing_time, self.response_processing_time]
            .iter()
            .map(|t| t.unwrap_or(0.0).max(0.0))
            .sum()
    }

    pub fn has_timing(&self) -> bool {
        self.request_processing_time.is_some() || self.target_processing_time.is_some() || self.response_processing_time.is_some()
    }
}

/// Splits a line on whitespace, keeping `"quoted tokens"` whole. `""` inside quotes is a literal quote.
pub fn tokenize(line: &str) -> Result<Vec<Cow<'_, str>>, MalformedReason> {
    let b = line.as_bytes();
    let mut out: Vec<Cow<'_, str>> = Vec::with_capacity(32);
    let mut i = 0;
    while i < b.len() {
        if b[i].is_ascii_whitespace() { i += 1; continue; }
        if b[i] == b'"' {
            let start = i + 1;
            let mut j = start;
            let mut seg = start;
            let mut unescaped: Option<String> = None;
            loop {
                match b.get(j) {
                    None => return Err(MalformedReason::UnterminatedQuote),
                    Some(b'"') if b.get(j + 1) == Some(&b'"') => {
                        let buf = unescaped.get_or_insert_with(String::new);
                        buf.push_str(&line[seg..j]);
                        buf.push('"');
                        j += 2;
                        seg = j;
                    }
                    Some(b'"') => break,
                    Some(_) => j += 1,
                }
            }
            if let Some(c) = b.get(j + 1) && !c.is_ascii_whitespace() { return Err(MalformedReason::StrayQuote); }
            let tok = match unescaped {
                Some(mut buf) => { buf.push_str(&line[seg..j]); Cow::Owned(buf) }
                None => Cow::Borrowed(&line[start..j]),
            };
            out.push(tok);
            i = j + 1;
        } else {
            let start = i;
            while i < b.len() && !b[i].is_ascii_whitespace() {
                if b[i] == b'"' { return Err(MalformedReason::StrayQuote); }
                i += 1;
            }
            out.push(Cow::Borrowed(&line[start..i]));
        }
    }
    Ok(out)
}

fn absent(tok: &str) -> bool { tok == "-" }

fn opt_text(tok: Option<&Cow<'_, str>>) -> Option<String> {
    match tok { Some(t) if !absent(t) && !t.is_empty() => Some(t.to_string()), _ => None }
}

fn parse_endpoint(tok: &str, field: &'static str) -> Result<Option<(String, u16)>, MalformedReason> {
    if absent(tok) { return Ok(None); }
    let (ip, port) = tok.rsplit_once(':').ok_or(MalformedReason::BadAddress(field))?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    if ip.is_empty() { return Err(MalformedReason::BadAddress(field)); }
    let port = port.parse::<u16>().map_err(|_| MalformedReason::BadAddress(field))?;
    Ok(Some((ip.to_string(), port)))
}

/// `-1` is how the load balancer says "not measured".
fn parse_duration(tok: &str, field: &'static str) -> Result<Option<f64>, MalformedReason> {
    if absent(tok) { return Ok(None); }
    let v = tok.parse::<f64>().map_err(|_| MalformedReason::BadNumber(field))?;
    if !v.is_finite() { return Err(MalformedReason::BadNumber(field)); }
    Ok(if v < 0.0 { None } else { Some(v) })
}

fn parse_opt<T: std::str::FromStr>(tok: &str, field: &'static str) -> Result<Option<T>, MalformedReason> {
    if absent(tok) { return Ok(None); }
    tok.parse::<T>().map(Some).map_err(|_| MalformedReason::BadNumber(field))
}

pub fn parse_line(line: &str) -> Result<LogRecord, MalformedReason> {
    let t = tokenize(line.trim_end_matches(['\r', '\n']))?;
    if t.len() < MIN_FIELDS { return Err(MalformedReason::TooFewFields(t.len())); }
    let time = DateTime::parse_from_rfc3339(&t[TIME]).map_err(|_| MalformedReason::BadTimestamp)?.with_timezone(&Utc);
    let (client_ip, client_port) = parse_endpoint(&t[CLIENT], "client")?.ok_or(MalformedReason::BadAddress("client"))?;
    let target = parse_endpoint(&t[TARGET], "target")?;
    let request: Vec<&str> = t[REQUEST].split_whitespace().collect();
    let [method, url, protocol] = request.as_slice() else { return Err(MalformedReason::BadRequestLine) };
    Ok(LogRecord {
        kind: t[TYPE].to_string(),
        time,
        elb: t[ELB].to_string(),
        client_ip,
        client_port,
        target_ip: target.as_ref().map(|(ip, _)| ip.clone()),
        target_port: target.map(|(_, p)| p),
        request_processing_time: parse_duration(&t[REQUEST_TIME], "request_processing_time")?,
        target_processing_time: parse_duration(&t[TARGET_TIME], "target_processing_time")?,
        response_processing_time: parse_duration(&t[RESPONSE_TIME], "response_processing_time")?,
        elb_status: parse_opt(&t[ELB_STATUS], "elb_status_code")?,
        target_status: parse_opt(&t[TARGET_STATUS], "target_status_code")?,
        received_bytes: parse_opt(&t[RECEIVED_BYTES], "received_bytes")?,
        sent_bytes: parse_opt(&t[SENT_BYTES], "sent_bytes")?,
        method: Some(method.to_string()).filter(|m| !absent(m)),
        url: url.to_string(),
        protocol: Some(protocol.to_string()).filter(|p| !absent(p)),
        user_agent: opt_text(t.get(USER_AGENT)),
        ssl_cipher: opt_text(t.get(SSL_CIPHER)),
        ssl_protocol: opt_text(t.get(SSL_PROTOCOL)),
        target_group_arn: opt_text(t.get(TARGET_GROUP)),
        trace_id: opt_text(t.get(TRACE_ID)),
        domain_name: opt_text(t.get(DOMAIN_NAME)),
        actions_executed: opt_text(t.get(ACTIONS_EXECUTED)),
        redirect_url: opt_text(t.get(REDIRECT_URL)),
        error_reason: opt_text(t.get(ERROR_REASON)),
        classification: opt_text(t.get(CLASSIFICATION)),
        classification_reason: opt_text(t.get(CLASSIFICATION_REASON)),
        conn_trace_id: opt_text(t.get(CONN_TRACE_ID)),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::fixture::LineSpec;

    const AWS_DOC_LINE: &str = r#"http 2018-07-02T22:23:00.186641Z app/my-loadbalancer/50dc6c495c0c9188 192.168.131.39:2817 10.0.0.1:80 0.000 0.001 0.000 200 200 34 366 "GET http://www.example.com:80/ HTTP/1.1" "curl/7.46.0" - - arn:aws:elasticloadbalancing:us-east-2:123456789012:targetgroup/my-targets/73e2d6bc24d8a067 "Root=1-58337262-36d228ad5d99923122bbe354" "-" "-" 0 2018-07-02T22:22:48.364000Z "forward" "-" "-" "10.0.0.1:80" "200" "-" "-" TID_1234abcd5678ef90"#;

    #[test]
    fn parses_documented_http_entry() {
        let r = parse_line(AWS_DOC_LINE).unwrap();
        assert_eq!(r.kind, "http");
        assert_eq!(r.client_ip, "192.168.131.39");
        assert_eq!(r.client_port, 2817);
        assert_eq!(r.target_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(r.target_port, Some(80));
        assert_eq!(r.elb_status, Some(200));
        assert_eq!(r.target_status, Some(200));
        assert_eq!(r.received_bytes, Some(34));
        assert_eq!(r.sent_bytes, Some(366));
        assert_eq!(r.method.as_deref(), Some("GET"));
        assert_eq!(r.url, "http://www.example.com:80/");
        assert_eq!(r.protocol.as_deref(), Some("HTTP/1.1"));
        assert_eq!(r.user_agent.as_deref(), Some("curl/7.46.0"));
        assert_eq!(r.ssl_cipher, None);
        assert_eq!(r.trace_id.as_deref(), Some("Root=1-58337262-36d228ad5d99923122bbe354"));
        assert_eq!(r.actions_executed.as_deref(), Some("forward"));
        assert_eq!(r.redirect_url, None);
        assert_eq!(r.conn_trace_id.as_deref(), Some("TID_1234abcd5678ef90"));
        assert!((r.total_time() - 0.001).abs() < 1e-9);
    }

    #[test]
    fn minimal_legacy_entry_is_accepted() {
        let line = AWS_DOC_LINE.split(" \"-\" \"-\" 0 ").next().unwrap();
        let r = parse_line(line).unwrap();
        assert_eq!(r.domain_name, None);
        assert_eq!(r.conn_trace_id, None);
    }

    #[test]
    fn quoted_tokens_keep_spaces_and_unescape_doubled_quotes() {
        let t = tokenize(r#"a "b c" "say ""hi""" "" d"#).unwrap();
        assert_eq!(t, vec!["a", "b c", "say \"hi\"", "", "d"]);
    }

    #[test]
    fn tokenizer_rejects_broken_quoting() {
        assert_eq!(tokenize(r#"a "b c"#), Err(MalformedReason::UnterminatedQuote));
        assert_eq!(tokenize(r#"a "b"c d"#), Err(MalformedReason::StrayQuote));
        assert_eq!(tokenize(r#"a b"c"#), Err(MalformedReason::StrayQuote));
    }

    #[test]
    fn unmeasured_times_count_as_zero() {
        let line = LineSpec::default().times("-1", "-1", "-1").status("504", "-").render();
        let r = parse_line(&line).unwrap();
        assert_eq!(r.target_processing_time, None);
        assert_eq!(r.target_status, None);
        assert!(!r.has_timing());
        assert_eq!(r.total_time(), 0.0);
        let partial = parse_line(&LineSpec::default().times("0.5", "-1", "0.25").render()).unwrap();
        assert!(partial.has_timing());
        assert!((partial.total_time() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn method_replaced_by_unterminated_quote_is_malformed() {
        let good = LineSpec::default().render();
        let bad = good.replacen("\"GET ", "\"\" ", 1);
        assert!(parse_line(&good).is_ok());
        assert!(parse_line(&bad).is_err());
        let lone = good.replacen("\"GET ", "\"\"\" ", 1).replacen(" HTTP/1.1\"", " HTTP/1.1", 1);
        assert!(parse_line(&lone).is_err());
    }

    #[test]
    fn short_and_garbled_lines_are_malformed() {
        assert_eq!(parse_line("http 2018-07-02T22:23:00.186641Z app/x"), Err(MalformedReason::TooFewFields(3)));
        let bad_time = LineSpec::default().at("yesterday").render();
        assert_eq!(parse_line(&bad_time), Err(MalformedReason::BadTimestamp));
        let bad_status = LineSpec::default().status("OK", "200").render();
        assert_eq!(parse_line(&bad_status), Err(MalformedReason::BadNumber("elb_status_code")));
        let bad_time_field = LineSpec::default().times("fast", "0", "0").render();
        assert_eq!(parse_line(&bad_time_field), Err(MalformedReason::BadNumber("request_processing_time")));
        let no_port = LineSpec::default().render().replace("10.0.0.1:52311", "10.0.0.1");
        assert_eq!(parse_line(&no_port), Err(MalformedReason::BadAddress("client")));
        let two_part = LineSpec::default().render().replace("\"GET https://shop.example.com:443/api/items HTTP/1.1\"", "\"GET /\"");
        assert_eq!(parse_line(&two_part), Err(MalformedReason::BadRequestLine));
    }

    #[test]
    fn redirect_and_absent_agent() {
        let r = parse_line(&LineSpec::default().status("301", "-").redirect("https://new.example.com/").agent("-").render()).unwrap();
        assert_eq!(r.redirect_url.as_deref(), Some("https://new.example.com/"));
        assert_eq!(r.user_agent, None);
    }

    #[test]
    fn bracketed_ipv6_client() {
        let r = parse_line(&LineSpec::default().client("[2001:db8::1]").render()).unwrap();
        assert_eq!(r.client_ip, "2001:db8::1");
        assert_eq!(r.client_port, 52311);
    }
}
