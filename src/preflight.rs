use crate::config::{Config, StateManagerConfig};
use crate::identity::IdentityResolver;
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::net::{TcpListener, UdpSocket};

#[derive(Debug, Serialize)]
pub struct PreflightIssue {
    pub field: String,
    pub message: String,
}

#[derive(Debug)]
pub struct PreflightError {
    pub issues: Vec<PreflightIssue>,
}

impl PreflightError {
    pub fn new(issues: Vec<PreflightIssue>) -> Self {
        Self { issues }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SocketKind {
    Tcp,
    Udp,
}

struct BindTarget {
    field: String,
    addr: SocketAddr,
    kind: SocketKind,
}

/// Checks a configuration before the agent starts: listeners, identity
/// settings, state manager and message bus settings.
pub async fn validate_start(config: &Config) -> Result<(), PreflightError> {
    let mut issues = Vec::new();

    let (targets, mut parse_issues) = bind_targets(config);
    issues.append(&mut parse_issues);
    issues.append(&mut check_bind_targets(targets).await);
    issues.append(&mut check_settings(config));

    if issues.is_empty() {
        Ok(())
    } else {
        Err(PreflightError::new(issues))
    }
}

fn check_settings(config: &Config) -> Vec<PreflightIssue> {
    let mut issues = Vec::new();

    if let Err(err) = IdentityResolver::new(&config.identity) {
        issues.push(PreflightIssue {
            field: "identity.account_tag_match_regexp".to_string(),
            message: err.to_string(),
        });
    }

    if let StateManagerConfig::Redis { address, .. } = &config.state_manager {
        if address.trim().is_empty() {
            issues.push(PreflightIssue {
                field: "state_manager.address".to_string(),
                message: "Redis state manager requires an address".to_string(),
            });
        }
    }

    let uri = config.messagebus_uri.trim();
    if !(uri.starts_with("amqp://") || uri.starts_with("amqps://")) {
        issues.push(PreflightIssue {
            field: "messagebus_uri".to_string(),
            message: format!("Invalid messagebus_uri `{}` (expected amqp:// or amqps://)", uri),
        });
    }

    issues
}

async fn check_bind_targets(targets: Vec<BindTarget>) -> Vec<PreflightIssue> {
    let mut issues = Vec::new();
    let mut tested = HashSet::new();

    for target in targets {
        if !tested.insert((target.kind, target.addr)) {
            continue;
        }

        let result = match target.kind {
            SocketKind::Tcp => TcpListener::bind(target.addr).await.map(drop),
            SocketKind::Udp => UdpSocket::bind(target.addr).await.map(drop),
        };

        if let Err(err) = result {
            issues.push(PreflightIssue {
                field: target.field,
                message: format!("Address {} is unavailable ({})", target.addr, err),
            });
        }
    }

    issues
}

fn bind_targets(config: &Config) -> (Vec<BindTarget>, Vec<PreflightIssue>) {
    let mut targets = Vec::new();
    let mut issues = Vec::new();

    let listeners = [
        ("listen_udp", config.udp_addr(), SocketKind::Udp),
        ("listen_tcp", config.tcp_addr(), SocketKind::Tcp),
    ];
    if listeners.iter().all(|(_, value, _)| value.is_none()) {
        issues.push(PreflightIssue {
            field: "listen_udp".to_string(),
            message: "At least one of listen_udp or listen_tcp must be set".to_string(),
        });
    }

    for (field, value, kind) in listeners {
        let Some(value) = value else {
            continue;
        };
        match value_as_socket_addr(field, value) {
            Ok(addr) => targets.push(BindTarget {
                field: field.to_string(),
                addr,
                kind,
            }),
            Err(issue) => issues.push(issue),
        }
    }

    (targets, issues)
}

fn value_as_socket_addr(field: &str, value: &str) -> Result<SocketAddr, PreflightIssue> {
    value.parse::<SocketAddr>().map_err(|err| PreflightIssue {
        field: field.to_string(),
        message: format!("Invalid {} `{}` ({})", field, value, err),
    })
}
