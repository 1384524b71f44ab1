use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rsip::prelude::{HeadersExt, UntypedHeader};

#[cfg(test)]
pub(crate) mod testing;

pub const HEADER_P_ASSERTED_IDENTITY: &str = "P-Asserted-Identity";

static URI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(sips?|tel):([^\s>,]+)").expect("valid uri regex"));

/// The user and host parts of a SIP/TEL URI found in a header value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SipUri {
    pub user: String,
    pub host: String,
}

impl SipUri {
    /// Extract the URI from a name-addr or addr-spec header value, e.g.
    /// `"Alice" <sip:151@10.0.0.1:5060>;tag=abc`.
    pub fn parse(value: &str) -> Option<Self> {
        let inner = match (value.find('<'), value.rfind('>')) {
            (Some(start), Some(end)) if start < end => &value[start + 1..end],
            _ => value,
        };
        let caps = URI_RE.captures(inner)?;
        let scheme = caps[1].to_ascii_lowercase();
        let rest = caps.get(2)?.as_str();

        if scheme == "tel" {
            let user = rest.split(';').next().unwrap_or_default();
            return Some(Self {
                user: user.to_string(),
                host: String::new(),
            });
        }

        let (userinfo, hostport) = match rest.split_once('@') {
            Some((userinfo, hostport)) => (userinfo, hostport),
            None => ("", rest),
        };
        let user = userinfo
            .split(|c: char| c == ':' || c == ';')
            .next()
            .unwrap_or_default();
        let host = if hostport.starts_with('[') {
            match hostport.find(']') {
                Some(end) => &hostport[..=end],
                None => hostport,
            }
        } else {
            hostport
                .split(|c: char| c == ':' || c == ';' || c == '?')
                .next()
                .unwrap_or_default()
        };
        if host.is_empty() {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            host: host.to_string(),
        })
    }

    pub fn host_in(&self, domains: &[String]) -> bool {
        domains.iter().any(|d| d.eq_ignore_ascii_case(&self.host))
    }
}

/// A decoded SIP message as seen by the correlator.
#[derive(Debug, Clone)]
pub struct SipMessage {
    /// Request method; responses carry none.
    pub method: Option<rsip::Method>,
    pub call_id: String,
    pub cseq: String,
    pub from: SipUri,
    pub to: SipUri,
    pub headers: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

impl SipMessage {
    pub fn parse(payload: &[u8], timestamp: DateTime<Utc>) -> Result<Self> {
        let text = normalize(&String::from_utf8_lossy(payload));
        let msg = rsip::SipMessage::try_from(text.as_str()).map_err(|e| anyhow!("{}", e))?;

        let call_id = msg
            .call_id_header()
            .map_err(|e| anyhow!("missing Call-ID: {}", e))?
            .value()
            .trim()
            .to_string();
        if call_id.is_empty() {
            return Err(anyhow!("empty Call-ID"));
        }
        let cseq = msg
            .cseq_header()
            .map(|c| c.value().trim().to_string())
            .unwrap_or_default();
        let from = msg
            .from_header()
            .ok()
            .and_then(|h| SipUri::parse(h.value()))
            .unwrap_or_default();
        let to = msg
            .to_header()
            .ok()
            .and_then(|h| SipUri::parse(h.value()))
            .unwrap_or_default();

        let (method, headers) = match &msg {
            rsip::SipMessage::Request(req) => (Some(req.method.clone()), &req.headers),
            rsip::SipMessage::Response(resp) => (None, &resp.headers),
        };
        let headers = headers
            .iter()
            .filter_map(|header| {
                let line = header.to_string();
                line.split_once(':')
                    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Ok(Self {
            method,
            call_id,
            cseq,
            from,
            to,
            headers,
            timestamp,
        })
    }

    /// The sequence number part of the CSeq header.
    pub fn cseq_number(&self) -> &str {
        self.cseq.split_whitespace().next().unwrap_or_default()
    }

    /// Values of every occurrence of `name`, in message order.
    /// `name` may be given in its compact form.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let name = canonical_header_name(name);
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = canonical_header_name(name);
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn p_asserted_identity(&self) -> Option<SipUri> {
        self.header_values(HEADER_P_ASSERTED_IDENTITY)
            .into_iter()
            .flat_map(split_list)
            .find_map(SipUri::parse)
    }

    pub fn source(&self) -> String {
        format!("sip:{}@{}", self.from.user, self.from.host)
    }

    pub fn destination(&self) -> String {
        format!("sip:{}@{}", self.to.user, self.to.host)
    }
}

/// Compact header names (RFC 3261 section 7.3.3 plus registered extensions).
const COMPACT_HEADERS: &[(&str, &str)] = &[
    ("a", "Accept-Contact"),
    ("b", "Referred-By"),
    ("c", "Content-Type"),
    ("d", "Request-Disposition"),
    ("e", "Content-Encoding"),
    ("f", "From"),
    ("i", "Call-ID"),
    ("j", "Reject-Contact"),
    ("k", "Supported"),
    ("l", "Content-Length"),
    ("m", "Contact"),
    ("n", "Identity-Info"),
    ("o", "Event"),
    ("r", "Refer-To"),
    ("s", "Subject"),
    ("t", "To"),
    ("u", "Allow-Events"),
    ("v", "Via"),
    ("x", "Session-Expires"),
    ("y", "Identity"),
];

/// Full header name for a compact one, e.g. `i` -> `Call-ID`. Other names are
/// returned trimmed.
pub fn canonical_header_name(name: &str) -> &str {
    let name = name.trim();
    if name.len() == 1 {
        if let Some((_, full)) = COMPACT_HEADERS
            .iter()
            .find(|(compact, _)| compact.eq_ignore_ascii_case(name))
        {
            return full;
        }
    }
    name
}

/// Rewrites the message into the shape the SIP grammar expects: CRLF line
/// endings, full header names, and a header block closed by an empty line.
/// Captures frequently carry the header block only, without the trailing
/// empty line.
fn normalize(text: &str) -> String {
    let text = if text.contains("\r\n") {
        text.to_string()
    } else {
        text.replace('\n', "\r\n")
    };
    let (head, body) = match text.find("\r\n\r\n") {
        Some(idx) => (&text[..idx], &text[idx + 4..]),
        None => (text.trim_end_matches(|c: char| c == '\r' || c == '\n'), ""),
    };

    let mut out = String::with_capacity(text.len() + 4);
    for (idx, line) in head.split("\r\n").enumerate() {
        if idx > 0 {
            out.push_str("\r\n");
            let folded = line.starts_with(|c: char| c == ' ' || c == '\t');
            if let Some((name, value)) = line.split_once(':').filter(|_| !folded) {
                let full = canonical_header_name(name);
                if full != name.trim() {
                    out.push_str(full);
                    out.push(':');
                    out.push_str(value);
                    continue;
                }
            }
        }
        out.push_str(line);
    }
    out.push_str("\r\n\r\n");
    out.push_str(body);
    out
}

/// Split a comma separated header value, ignoring commas inside `<...>` and
/// quoted strings.
pub fn split_list(value: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (idx, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                entries.push(value[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    entries.push(value[start..].trim());
    entries.retain(|e| !e.is_empty());
    entries
}
