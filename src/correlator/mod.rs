use crate::config::Config;
use crate::identity::ResolvedIdentity;
use crate::metrics;
use crate::publisher::{TransactionPublisher, QUEUE_BEGIN_TRANSACTION, QUEUE_END_TRANSACTION};
use crate::sip::SipMessage;
use crate::state::{StateStore, StateStoreExt};
use rsip::Method;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod model;
pub use model::{
    format_timestamp, BeginTransaction, BeginTransactionRequest, Call, EndTransaction,
    EndTransactionRequest,
};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub tenant: String,
    pub product_tag: String,
    pub tags: Vec<String>,
    pub invite_ttl_secs: u64,
    pub call_ttl_secs: u64,
}

impl From<&Config> for CorrelatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            tenant: config.tenant.clone(),
            product_tag: config.product_tag.clone(),
            tags: config.transaction_tags.clone(),
            invite_ttl_secs: config.invite_ttl_secs,
            call_ttl_secs: config.call_ttl_secs,
        }
    }
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// What a single message did to the call state.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelatorOutcome {
    /// Not a tracked method, a response, or an INVITE without identity.
    Ignored,
    /// INVITE stored, waiting for its ACK.
    Pending,
    /// ACK for a call with no usable record.
    Untracked,
    /// ACK that does not start the call: CSeq mismatch, already active, or
    /// no identity on the record.
    Duplicate,
    Began(BeginTransaction),
    Ended(EndTransaction),
}

#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("state store {operation} failed for call {call_id}: {source}")]
    Store {
        operation: &'static str,
        call_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("unable to publish {routing_key}: {source}; body: {body}")]
    Publish {
        routing_key: &'static str,
        body: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("unable to encode {routing_key}: {source}")]
    Encode {
        routing_key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Call state machine: INVITE stores a pending record, the matching ACK
/// promotes it and emits `begin_transaction`, BYE/CANCEL remove it and emit
/// `end_transaction`.
///
/// There is no per-call lock. Retransmissions and races between packets of
/// the same call are absorbed by the CSeq check and by `timestamp_ack` being
/// written at most once.
pub struct CallCorrelator {
    config: CorrelatorConfig,
    store: Arc<dyn StateStore>,
    publisher: Arc<dyn TransactionPublisher>,
}

impl CallCorrelator {
    pub fn new(
        config: CorrelatorConfig,
        store: Arc<dyn StateStore>,
        publisher: Arc<dyn TransactionPublisher>,
    ) -> Self {
        Self {
            config,
            store,
            publisher,
        }
    }

    pub async fn process(
        &self,
        msg: &SipMessage,
        identity: &ResolvedIdentity,
    ) -> Result<CorrelatorOutcome, CorrelatorError> {
        match &msg.method {
            Some(Method::Invite) => self.handle_invite(msg, identity).await,
            Some(Method::Ack) => self.handle_ack(msg).await,
            Some(Method::Bye) | Some(Method::Cancel) => self.handle_termination(msg).await,
            _ => Ok(CorrelatorOutcome::Ignored),
        }
    }

    async fn handle_invite(
        &self,
        msg: &SipMessage,
        identity: &ResolvedIdentity,
    ) -> Result<CorrelatorOutcome, CorrelatorError> {
        if identity.is_empty() {
            debug!(call_id = %msg.call_id, "INVITE without billing identity, not tracked");
            return Ok(CorrelatorOutcome::Ignored);
        }
        let call = Call {
            tenant: self.config.tenant.clone(),
            transaction_tag: msg.call_id.clone(),
            account_tag: identity.account_tag.clone(),
            destination_account_tag: identity.destination_account_tag.clone(),
            source: msg.source(),
            destination: msg.destination(),
            cseq: msg.cseq_number().to_string(),
            timestamp_invite: Some(msg.timestamp),
            timestamp_ack: None,
            timestamp_bye: None,
        };
        self.store
            .set(&msg.call_id, &call, self.config.invite_ttl_secs)
            .await
            .map_err(|e| store_error("set", &msg.call_id, e))?;
        debug!(
            call_id = %msg.call_id,
            account_tag = %call.account_tag,
            destination_account_tag = %call.destination_account_tag,
            "call pending ACK"
        );
        Ok(CorrelatorOutcome::Pending)
    }

    async fn handle_ack(&self, msg: &SipMessage) -> Result<CorrelatorOutcome, CorrelatorError> {
        let mut call: Call = self
            .store
            .get(&msg.call_id)
            .await
            .map_err(|e| store_error("get", &msg.call_id, e))?;
        if call.cseq.is_empty() {
            debug!(call_id = %msg.call_id, "ACK for an unknown call");
            return Ok(CorrelatorOutcome::Untracked);
        }
        if call.cseq != msg.cseq_number() || call.timestamp_ack.is_some() || !call.has_identity() {
            debug!(
                call_id = %msg.call_id,
                cseq = %msg.cseq_number(),
                stored_cseq = %call.cseq,
                "ACK does not start the call"
            );
            return Ok(CorrelatorOutcome::Duplicate);
        }

        call.timestamp_ack = Some(msg.timestamp);
        self.store
            .set(&call.transaction_tag, &call, self.config.call_ttl_secs)
            .await
            .map_err(|e| store_error("set", &msg.call_id, e))?;

        let event = BeginTransaction {
            request: BeginTransactionRequest {
                tenant: call.tenant,
                transaction_tag: call.transaction_tag,
                account_tag: call.account_tag,
                destination_account_tag: call.destination_account_tag,
                source: call.source,
                destination: call.destination,
                product_tag: self.config.product_tag.clone(),
                tags: self.config.tags.clone(),
                timestamp_begin: format_timestamp(&msg.timestamp),
            },
        };
        self.emit(QUEUE_BEGIN_TRANSACTION, &event).await?;
        info!(call_id = %msg.call_id, "begin transaction");
        metrics::correlator::transaction("begin");
        Ok(CorrelatorOutcome::Began(event))
    }

    async fn handle_termination(
        &self,
        msg: &SipMessage,
    ) -> Result<CorrelatorOutcome, CorrelatorError> {
        let call: Call = match self.store.get(&msg.call_id).await {
            Ok(call) => call,
            Err(e) => {
                warn!(call_id = %msg.call_id, "unable to read call state, ending without identity: {}", e);
                metrics::correlator::store_error("get");
                Call::default()
            }
        };
        if let Err(e) = self.store.delete(&msg.call_id).await {
            error!(call_id = %msg.call_id, "unable to delete call state: {}", e);
            metrics::correlator::store_error("delete");
        }

        let event = EndTransaction {
            request: EndTransactionRequest {
                tenant: self.config.tenant.clone(),
                transaction_tag: msg.call_id.clone(),
                account_tag: call.account_tag,
                destination_account_tag: call.destination_account_tag,
                timestamp_end: format_timestamp(&msg.timestamp),
            },
        };
        self.emit(QUEUE_END_TRANSACTION, &event).await?;
        info!(call_id = %msg.call_id, "end transaction");
        metrics::correlator::transaction("end");
        Ok(CorrelatorOutcome::Ended(event))
    }

    async fn emit<T: Serialize>(
        &self,
        routing_key: &'static str,
        event: &T,
    ) -> Result<(), CorrelatorError> {
        let body = serde_json::to_vec(event).map_err(|source| CorrelatorError::Encode {
            routing_key,
            source,
        })?;
        if let Err(source) = self.publisher.publish(routing_key, body.clone()).await {
            metrics::correlator::publish_error(routing_key);
            return Err(CorrelatorError::Publish {
                routing_key,
                body: String::from_utf8_lossy(&body).into_owned(),
                source,
            });
        }
        Ok(())
    }
}

fn store_error(operation: &'static str, call_id: &str, source: anyhow::Error) -> CorrelatorError {
    metrics::correlator::store_error(operation);
    CorrelatorError::Store {
        operation,
        call_id: call_id.to_string(),
        source,
    }
}
