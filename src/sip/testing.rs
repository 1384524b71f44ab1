use super::SipMessage;
use chrono::{DateTime, TimeZone, Utc};

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_584_176_168 + secs, 0).unwrap()
}

/// Build a raw SIP request with the usual dialog headers.
pub fn request(
    method: &str,
    call_id: &str,
    cseq: u32,
    from: &str,
    to: &str,
    extra_headers: &[(&str, &str)],
) -> String {
    let mut msg = format!(
        "{method} sip:{to} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.135.0.12:5060;branch=z9hG4bKhye0bem20x.nx8hnt\r\n\
         Max-Forwards: 70\r\n\
         From: \"Calling User\" <sip:{from}>;tag=m3l2hbp\r\n\
         To: <sip:{to}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n"
    );
    for (name, value) in extra_headers {
        msg.push_str(&format!("{}: {}\r\n", name, value));
    }
    msg.push_str("Content-Length: 0\r\n\r\n");
    msg
}

pub fn message(
    method: &str,
    call_id: &str,
    cseq: u32,
    from: &str,
    to: &str,
    extra_headers: &[(&str, &str)],
    at: DateTime<Utc>,
) -> SipMessage {
    let raw = request(method, call_id, cseq, from, to, extra_headers);
    SipMessage::parse(raw.as_bytes(), at).expect("valid SIP request")
}

/// Same dialog as [`request`] written with compact header names and bare LF
/// line endings, without the closing empty line.
pub fn compact_request(
    method: &str,
    call_id: &str,
    cseq: u32,
    from: &str,
    to: &str,
) -> String {
    format!(
        "{method} sip:{to} SIP/2.0\n\
         v: SIP/2.0/UDP 10.135.0.12:5060;branch=z9hG4bKhye0bem20x.nx8hnt\n\
         f: \"Calling User\" <sip:{from}>;tag=m3l2hbp\n\
         t: <sip:{to}>\n\
         i: {call_id}\n\
         CSeq: {cseq} {method}\n\
         l: 0\n"
    )
}
