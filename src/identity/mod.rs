use crate::config::IdentityConfig;
use crate::sip::{split_list, SipMessage, SipUri};
use anyhow::{anyhow, Result};
use regex::Regex;


/// Billing identities attached to a SIP message before correlation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub account_tag: String,
    pub destination_account_tag: String,
}

impl ResolvedIdentity {
    pub fn new(account_tag: impl Into<String>, destination_account_tag: impl Into<String>) -> Self {
        Self {
            account_tag: account_tag.into(),
            destination_account_tag: destination_account_tag.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.account_tag.is_empty() && self.destination_account_tag.is_empty()
    }
}

/// Resolves the caller/callee account tags of a message.
///
/// Caller precedence: history header (indexed from the last occurrence),
/// custom caller header, P-Asserted-Identity (subject to the local domain
/// filter), From user on a local domain. Callee precedence: custom callee
/// header, To user on a local domain. The optional extraction regex then
/// rewrites each non-empty tag with its first capture group.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    caller_header: Option<String>,
    callee_header: Option<String>,
    history_header: Option<String>,
    history_index: usize,
    local_domains: Vec<String>,
    tag_regex: Option<Regex>,
}

impl IdentityResolver {
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        let tag_regex = match non_empty(config.account_tag_match_regexp.as_deref()) {
            Some(pattern) => Some(
                Regex::new(pattern)
                    .map_err(|e| anyhow!("invalid account_tag_match_regexp '{}': {}", pattern, e))?,
            ),
            None => None,
        };
        Ok(Self {
            caller_header: non_empty(config.sip_header_caller.as_deref()).map(str::to_string),
            callee_header: non_empty(config.sip_header_callee.as_deref()).map(str::to_string),
            history_header: non_empty(config.sip_header_history_info.as_deref())
                .map(str::to_string),
            history_index: config.sip_header_history_info_index,
            local_domains: config
                .sip_local_domains
                .iter()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect(),
            tag_regex,
        })
    }

    pub fn resolve(&self, msg: &SipMessage) -> ResolvedIdentity {
        let mut identity = ResolvedIdentity {
            account_tag: self.resolve_caller(msg),
            destination_account_tag: self.resolve_callee(msg),
        };
        if let Some(re) = &self.tag_regex {
            if !identity.is_empty() {
                identity.account_tag = extract(re, identity.account_tag);
                identity.destination_account_tag = extract(re, identity.destination_account_tag);
            }
        }
        identity
    }

    fn resolve_caller(&self, msg: &SipMessage) -> String {
        if let Some(user) = self.history_user(msg) {
            return user;
        }
        if let Some(value) = self.custom_header(msg, self.caller_header.as_deref()) {
            return value;
        }
        if let Some(pai) = msg.p_asserted_identity() {
            if self.local_domains.is_empty() || pai.host_in(&self.local_domains) {
                if !pai.user.is_empty() {
                    return pai.user;
                }
            }
        }
        if !self.local_domains.is_empty() && msg.from.host_in(&self.local_domains) {
            return msg.from.user.clone();
        }
        String::new()
    }

    fn resolve_callee(&self, msg: &SipMessage) -> String {
        if let Some(value) = self.custom_header(msg, self.callee_header.as_deref()) {
            return value;
        }
        if !self.local_domains.is_empty() && msg.to.host_in(&self.local_domains) {
            return msg.to.user.clone();
        }
        String::new()
    }

    fn custom_header(&self, msg: &SipMessage, name: Option<&str>) -> Option<String> {
        let value = msg.header(name?)?;
        (!value.is_empty()).then(|| value.to_string())
    }

    /// User part of the history entry `history_index` positions before the
    /// last one. Entries without a parseable URI do not count.
    fn history_user(&self, msg: &SipMessage) -> Option<String> {
        let name = self.history_header.as_deref()?;
        let users: Vec<String> = msg
            .header_values(name)
            .into_iter()
            .flat_map(split_list)
            .filter_map(SipUri::parse)
            .map(|uri| uri.user)
            .collect();
        let idx = users
            .len()
            .checked_sub(self.history_index)?
            .checked_sub(1)?;
        users.into_iter().nth(idx).filter(|user| !user.is_empty())
    }
}

fn extract(re: &Regex, tag: String) -> String {
    if tag.is_empty() {
        return tag;
    }
    match re.captures(&tag).and_then(|caps| caps.get(1)) {
        Some(group) => group.as_str().to_string(),
        None => tag,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
