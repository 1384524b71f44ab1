use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Call state persisted between the INVITE and the BYE/CANCEL of a dialog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Call {
    pub tenant: String,
    pub transaction_tag: String,
    pub account_tag: String,
    pub destination_account_tag: String,
    pub source: String,
    pub destination: String,
    pub cseq: String,
    // stored records written by older agents use this key for the INVITE time
    #[serde(rename = "timestamp_begin", with = "zero_time")]
    pub timestamp_invite: Option<DateTime<Utc>>,
    #[serde(with = "zero_time")]
    pub timestamp_ack: Option<DateTime<Utc>>,
    #[serde(with = "zero_time")]
    pub timestamp_bye: Option<DateTime<Utc>>,
}

impl Call {
    pub fn has_identity(&self) -> bool {
        !self.account_tag.is_empty() || !self.destination_account_tag.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeginTransaction {
    pub request: BeginTransactionRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeginTransactionRequest {
    pub tenant: String,
    pub transaction_tag: String,
    pub account_tag: String,
    pub destination_account_tag: String,
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub product_tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub timestamp_begin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndTransaction {
    pub request: EndTransactionRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndTransactionRequest {
    pub tenant: String,
    pub transaction_tag: String,
    pub account_tag: String,
    pub destination_account_tag: String,
    pub timestamp_end: String,
}

/// `YYYY-MM-DDTHH:MM:SSZ`
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Unset instants travel as `0001-01-01T00:00:00Z` so records stay readable by
/// consumers that expect a timestamp in every field.
mod zero_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub const ZERO: &str = "0001-01-01T00:00:00Z";

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_str(ZERO),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<String>::deserialize(deserializer)?;
        match value.as_deref().map(str::trim) {
            None | Some("") | Some(ZERO) => Ok(None),
            Some(value) => DateTime::parse_from_rfc3339(value)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(de::Error::custom),
        }
    }
}
