use super::*;
use crate::config::IdentityConfig;
use crate::identity::IdentityResolver;
use crate::sip::testing::{compact_request, message, ts};
use crate::state::memory::MemoryStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::TimeZone;
use chrono::Utc;
use mockall::mock;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;

const CALL_ID: &str = "ud04chatv9q@10.135.0.1";
const FROM: &str = "151@10.135.0.1:5060";
const TO: &str = "001234567890@10.135.0.1:5060;user=phone";

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(String, Value)>>,
}

impl RecordingPublisher {
    fn events(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransactionPublisher for RecordingPublisher {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let body: Value = serde_json::from_slice(&body)?;
        self.published
            .lock()
            .unwrap()
            .push((routing_key.to_string(), body));
        Ok(())
    }
}

mock! {
    pub Publisher {}

    #[async_trait]
    impl TransactionPublisher for Publisher {
        async fn connect(&self) -> Result<()>;
        async fn close(&self) -> Result<()>;
        async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<()>;
    }
}

/// Store whose reads and writes can be switched to fail.
#[derive(Default)]
struct FailingStore {
    fail_get: bool,
    fail_set: bool,
    fail_delete: bool,
}

#[async_trait]
impl StateStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn set_raw(&self, _key: &str, _value: String, _ttl_secs: u64) -> Result<()> {
        if self.fail_set {
            return Err(anyhow!("connection reset"));
        }
        Ok(())
    }

    async fn get_raw(&self, _key: &str) -> Result<Option<String>> {
        if self.fail_get {
            return Err(anyhow!("connection reset"));
        }
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        if self.fail_delete {
            return Err(anyhow!("connection reset"));
        }
        Ok(())
    }
}

struct Harness {
    correlator: CallCorrelator,
    store: Arc<MemoryStore>,
    publisher: Arc<RecordingPublisher>,
}

fn harness_with(config: CorrelatorConfig) -> Harness {
    let store = Arc::new(MemoryStore::new(Duration::from_secs(30)));
    let publisher = Arc::new(RecordingPublisher::default());
    let correlator = CallCorrelator::new(config, store.clone(), publisher.clone());
    Harness {
        correlator,
        store,
        publisher,
    }
}

fn harness() -> Harness {
    harness_with(CorrelatorConfig::default())
}

fn sip(method: &str, cseq: u32, secs: i64) -> SipMessage {
    message(method, CALL_ID, cseq, FROM, TO, &[], ts(secs))
}

fn billed() -> ResolvedIdentity {
    ResolvedIdentity::new("151", "001234567890")
}

#[tokio::test]
async fn test_invite_ack_bye_flow() {
    let h = harness();
    let resolver = IdentityResolver::new(&IdentityConfig {
        sip_local_domains: vec!["10.135.0.1".to_string()],
        ..Default::default()
    })
    .unwrap();

    let invite = sip("INVITE", 10691, 0);
    let outcome = h
        .correlator
        .process(&invite, &resolver.resolve(&invite))
        .await
        .unwrap();
    assert_eq!(outcome, CorrelatorOutcome::Pending);

    let ack = sip("ACK", 10691, 0);
    let outcome = h
        .correlator
        .process(&ack, &resolver.resolve(&ack))
        .await
        .unwrap();
    assert!(matches!(outcome, CorrelatorOutcome::Began(_)));

    let bye = sip("BYE", 10692, 1);
    let outcome = h
        .correlator
        .process(&bye, &resolver.resolve(&bye))
        .await
        .unwrap();
    assert!(matches!(outcome, CorrelatorOutcome::Ended(_)));

    let events = h.publisher.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, "begin_transaction");
    assert_eq!(
        events[0].1,
        json!({
            "request": {
                "tenant": "default",
                "transaction_tag": CALL_ID,
                "account_tag": "151",
                "destination_account_tag": "001234567890",
                "source": "sip:151@10.135.0.1",
                "destination": "sip:001234567890@10.135.0.1",
                "timestamp_begin": "2020-03-14T08:56:08Z"
            }
        })
    );
    assert_eq!(events[1].0, "end_transaction");
    assert_eq!(
        events[1].1,
        json!({
            "request": {
                "tenant": "default",
                "transaction_tag": CALL_ID,
                "account_tag": "151",
                "destination_account_tag": "001234567890",
                "timestamp_end": "2020-03-14T08:56:09Z"
            }
        })
    );
    assert_eq!(h.store.len().await, 0);
}

#[tokio::test]
async fn test_compact_header_flow() {
    let h = harness();
    let resolver = IdentityResolver::new(&IdentityConfig {
        sip_local_domains: vec!["10.135.0.1".to_string()],
        ..Default::default()
    })
    .unwrap();
    let compact = |method: &str, cseq: u32, secs: i64| {
        let raw = compact_request(method, CALL_ID, cseq, FROM, TO);
        SipMessage::parse(raw.as_bytes(), ts(secs)).unwrap()
    };

    let invite = compact("INVITE", 10691, 0);
    let outcome = h
        .correlator
        .process(&invite, &resolver.resolve(&invite))
        .await
        .unwrap();
    assert_eq!(outcome, CorrelatorOutcome::Pending);

    let ack = compact("ACK", 10691, 0);
    let outcome = h
        .correlator
        .process(&ack, &resolver.resolve(&ack))
        .await
        .unwrap();
    assert!(matches!(outcome, CorrelatorOutcome::Began(_)));

    let bye = compact("BYE", 10692, 1);
    let outcome = h
        .correlator
        .process(&bye, &resolver.resolve(&bye))
        .await
        .unwrap();
    assert!(matches!(outcome, CorrelatorOutcome::Ended(_)));

    let events = h.publisher.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, "begin_transaction");
    assert_eq!(events[0].1["request"]["transaction_tag"], CALL_ID);
    assert_eq!(events[0].1["request"]["account_tag"], "151");
    assert_eq!(
        events[0].1["request"]["destination_account_tag"],
        "001234567890"
    );
    assert_eq!(events[1].0, "end_transaction");
    assert_eq!(
        events[1].1["request"]["timestamp_end"],
        "2020-03-14T08:56:09Z"
    );
    assert_eq!(h.store.len().await, 0);
}

#[tokio::test]
async fn test_invite_without_identity_then_ack() {
    let h = harness();
    let outcome = h
        .correlator
        .process(&sip("INVITE", 1, 0), &ResolvedIdentity::default())
        .await
        .unwrap();
    assert_eq!(outcome, CorrelatorOutcome::Ignored);
    assert_eq!(h.store.len().await, 0);

    let outcome = h
        .correlator
        .process(&sip("ACK", 1, 0), &ResolvedIdentity::default())
        .await
        .unwrap();
    assert_eq!(outcome, CorrelatorOutcome::Untracked);
    assert!(h.publisher.events().is_empty());
}

#[tokio::test]
async fn test_ack_for_unknown_call() {
    let h = harness();
    let outcome = h
        .correlator
        .process(&sip("ACK", 1, 0), &billed())
        .await
        .unwrap();
    assert_eq!(outcome, CorrelatorOutcome::Untracked);
    assert!(h.publisher.events().is_empty());
}

#[tokio::test]
async fn test_invite_stores_pending_record() {
    let h = harness();
    h.correlator
        .process(&sip("INVITE", 7, 0), &billed())
        .await
        .unwrap();

    let call: Call = h.store.get(CALL_ID).await.unwrap();
    assert_eq!(
        call,
        Call {
            tenant: "default".to_string(),
            transaction_tag: CALL_ID.to_string(),
            account_tag: "151".to_string(),
            destination_account_tag: "001234567890".to_string(),
            source: "sip:151@10.135.0.1".to_string(),
            destination: "sip:001234567890@10.135.0.1".to_string(),
            cseq: "7".to_string(),
            timestamp_invite: Some(ts(0)),
            timestamp_ack: None,
            timestamp_bye: None,
        }
    );
}

#[tokio::test]
async fn test_second_invite_overwrites() {
    let h = harness();
    h.correlator
        .process(&sip("INVITE", 1, 0), &billed())
        .await
        .unwrap();
    h.correlator
        .process(&sip("INVITE", 2, 0), &ResolvedIdentity::new("200", ""))
        .await
        .unwrap();

    let call: Call = h.store.get(CALL_ID).await.unwrap();
    assert_eq!(call.cseq, "2");
    assert_eq!(call.account_tag, "200");
    assert_eq!(call.destination_account_tag, "");

    // the ACK of the first INVITE no longer matches
    let outcome = h
        .correlator
        .process(&sip("ACK", 1, 0), &billed())
        .await
        .unwrap();
    assert_eq!(outcome, CorrelatorOutcome::Duplicate);

    let outcome = h
        .correlator
        .process(&sip("ACK", 2, 0), &billed())
        .await
        .unwrap();
    match outcome {
        CorrelatorOutcome::Began(event) => assert_eq!(event.request.account_tag, "200"),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_ack_emits_once() {
    let h = harness();
    h.correlator
        .process(&sip("INVITE", 1, 0), &billed())
        .await
        .unwrap();
    let first = h
        .correlator
        .process(&sip("ACK", 1, 0), &billed())
        .await
        .unwrap();
    let second = h
        .correlator
        .process(&sip("ACK", 1, 5), &billed())
        .await
        .unwrap();
    assert!(matches!(first, CorrelatorOutcome::Began(_)));
    assert_eq!(second, CorrelatorOutcome::Duplicate);
    assert_eq!(h.publisher.events().len(), 1);

    // the first ACK time is kept
    let call: Call = h.store.get(CALL_ID).await.unwrap();
    assert_eq!(call.timestamp_ack, Some(ts(0)));
}

#[tokio::test(start_paused = true)]
async fn test_ack_extends_ttl() {
    let h = harness();
    h.correlator
        .process(&sip("INVITE", 1, 0), &billed())
        .await
        .unwrap();
    h.correlator
        .process(&sip("ACK", 1, 0), &billed())
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(700)).await;
    let call: Call = h.store.get(CALL_ID).await.unwrap();
    assert!(call.timestamp_ack.is_some());

    tokio::time::advance(Duration::from_secs(6 * 3600)).await;
    let call: Call = h.store.get(CALL_ID).await.unwrap();
    assert_eq!(call, Call::default());
}

#[tokio::test(start_paused = true)]
async fn test_pending_invite_expires() {
    let h = harness();
    h.correlator
        .process(&sip("INVITE", 1, 0), &billed())
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(601)).await;

    let outcome = h
        .correlator
        .process(&sip("ACK", 1, 0), &billed())
        .await
        .unwrap();
    assert_eq!(outcome, CorrelatorOutcome::Untracked);
}

#[tokio::test]
async fn test_bye_without_record_still_ends() {
    let h = harness();
    let outcome = h
        .correlator
        .process(&sip("BYE", 2, 0), &billed())
        .await
        .unwrap();
    let CorrelatorOutcome::Ended(event) = outcome else {
        panic!("expected an end transaction");
    };
    // identities come from the stored record only
    assert_eq!(event.request.account_tag, "");
    assert_eq!(event.request.destination_account_tag, "");
    assert_eq!(h.publisher.events().len(), 1);
}

#[tokio::test]
async fn test_cancel_ends_pending_call() {
    let h = harness();
    h.correlator
        .process(&sip("INVITE", 1, 0), &billed())
        .await
        .unwrap();
    let outcome = h
        .correlator
        .process(&sip("CANCEL", 1, 3), &ResolvedIdentity::default())
        .await
        .unwrap();
    let CorrelatorOutcome::Ended(event) = outcome else {
        panic!("expected an end transaction");
    };
    assert_eq!(event.request.account_tag, "151");
    assert_eq!(event.request.timestamp_end, "2020-03-14T08:56:11Z");
    assert_eq!(h.store.len().await, 0);

    let events = h.publisher.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, QUEUE_END_TRANSACTION);
}

#[tokio::test]
async fn test_other_messages_are_ignored() {
    let h = harness();
    h.correlator
        .process(&sip("INVITE", 1, 0), &billed())
        .await
        .unwrap();

    for method in ["OPTIONS", "REGISTER", "INFO", "UPDATE"] {
        let outcome = h
            .correlator
            .process(&sip(method, 1, 0), &billed())
            .await
            .unwrap();
        assert_eq!(outcome, CorrelatorOutcome::Ignored);
    }

    let response = "SIP/2.0 200 OK\r\n\
         Via: SIP/2.0/UDP 10.135.0.12:5060;branch=z9hG4bKhye0bem20x.nx8hnt\r\n\
         From: <sip:151@10.135.0.1>;tag=m3l2hbp\r\n\
         To: <sip:001234567890@10.135.0.1>;tag=9fxced76sl\r\n\
         Call-ID: ud04chatv9q@10.135.0.1\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\r\n";
    let response = SipMessage::parse(response.as_bytes(), ts(0)).unwrap();
    let outcome = h.correlator.process(&response, &billed()).await.unwrap();
    assert_eq!(outcome, CorrelatorOutcome::Ignored);

    // the pending record is untouched
    let call: Call = h.store.get(CALL_ID).await.unwrap();
    assert_eq!(call.cseq, "1");
    assert!(call.timestamp_ack.is_none());
    assert!(h.publisher.events().is_empty());
}

#[tokio::test]
async fn test_begin_event_carries_product_and_tags() {
    let h = harness_with(CorrelatorConfig {
        tenant: "acme".to_string(),
        product_tag: "voice".to_string(),
        tags: vec!["hep".to_string(), "sip".to_string()],
        ..Default::default()
    });
    h.correlator
        .process(&sip("INVITE", 1, 0), &billed())
        .await
        .unwrap();
    h.correlator
        .process(&sip("ACK", 1, 0), &billed())
        .await
        .unwrap();

    let events = h.publisher.events();
    let request = &events[0].1["request"];
    assert_eq!(request["tenant"], "acme");
    assert_eq!(request["product_tag"], "voice");
    assert_eq!(request["tags"], json!(["hep", "sip"]));
}

#[tokio::test]
async fn test_publish_failure_carries_body() {
    let mut publisher = MockPublisher::new();
    publisher
        .expect_publish()
        .times(1)
        .returning(|_, _| Err(anyhow!("channel closed")));
    let store = Arc::new(MemoryStore::new(Duration::from_secs(30)));
    let correlator =
        CallCorrelator::new(CorrelatorConfig::default(), store.clone(), Arc::new(publisher));

    let err = correlator
        .process(&sip("BYE", 2, 0), &billed())
        .await
        .unwrap_err();
    match err {
        CorrelatorError::Publish {
            routing_key, body, ..
        } => {
            assert_eq!(routing_key, QUEUE_END_TRANSACTION);
            assert!(body.contains(CALL_ID));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_publish_failure_keeps_ack_recorded() {
    let mut publisher = MockPublisher::new();
    publisher
        .expect_publish()
        .times(1)
        .returning(|_, _| Err(anyhow!("channel closed")));
    let store = Arc::new(MemoryStore::new(Duration::from_secs(30)));
    let correlator =
        CallCorrelator::new(CorrelatorConfig::default(), store.clone(), Arc::new(publisher));

    correlator
        .process(&sip("INVITE", 1, 0), &billed())
        .await
        .unwrap();
    assert!(correlator
        .process(&sip("ACK", 1, 0), &billed())
        .await
        .is_err());
    // at-most-once: a retransmitted ACK does not retry
    let outcome = correlator
        .process(&sip("ACK", 1, 0), &billed())
        .await
        .unwrap();
    assert_eq!(outcome, CorrelatorOutcome::Duplicate);
}

#[tokio::test]
async fn test_store_failure_on_invite() {
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().times(0);
    let store = Arc::new(FailingStore {
        fail_set: true,
        ..Default::default()
    });
    let correlator = CallCorrelator::new(CorrelatorConfig::default(), store, Arc::new(publisher));

    let err = correlator
        .process(&sip("INVITE", 1, 0), &billed())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CorrelatorError::Store {
            operation: "set",
            ..
        }
    ));
}

#[tokio::test]
async fn test_store_failure_on_ack() {
    let mut publisher = MockPublisher::new();
    publisher.expect_publish().times(0);
    let store = Arc::new(FailingStore {
        fail_get: true,
        ..Default::default()
    });
    let correlator = CallCorrelator::new(CorrelatorConfig::default(), store, Arc::new(publisher));

    let err = correlator
        .process(&sip("ACK", 1, 0), &billed())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CorrelatorError::Store {
            operation: "get",
            ..
        }
    ));
}

#[tokio::test]
async fn test_bye_survives_store_failures() {
    let publisher = Arc::new(RecordingPublisher::default());
    let store = Arc::new(FailingStore {
        fail_get: true,
        fail_set: true,
        fail_delete: true,
    });
    let correlator = CallCorrelator::new(CorrelatorConfig::default(), store, publisher.clone());

    let outcome = correlator
        .process(&sip("BYE", 2, 0), &billed())
        .await
        .unwrap();
    assert!(matches!(outcome, CorrelatorOutcome::Ended(_)));
    let events = publisher.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1["request"]["account_tag"], "");
}

#[test]
fn test_call_record_json() {
    let call = Call {
        tenant: "default".to_string(),
        transaction_tag: CALL_ID.to_string(),
        account_tag: "151".to_string(),
        cseq: "10691".to_string(),
        timestamp_invite: Some(ts(0)),
        ..Default::default()
    };
    let value = serde_json::to_value(&call).unwrap();
    assert_eq!(value["timestamp_begin"], "2020-03-14T08:56:08Z");
    assert_eq!(value["timestamp_ack"], "0001-01-01T00:00:00Z");
    assert_eq!(value["timestamp_bye"], "0001-01-01T00:00:00Z");
    assert!(value.get("timestamp_invite").is_none());

    let decoded: Call = serde_json::from_value(value).unwrap();
    assert_eq!(decoded, call);
}

#[test]
fn test_call_record_from_other_writers() {
    let record = r#"{
        "tenant": "default",
        "transaction_tag": "abc",
        "account_tag": "151",
        "destination_account_tag": "",
        "source": "sip:151@10.135.0.1",
        "destination": "sip:001@10.135.0.1",
        "cseq": "1",
        "timestamp_begin": "2020-03-14T09:56:08.250+01:00",
        "timestamp_ack": "0001-01-01T00:00:00Z"
    }"#;
    let call: Call = serde_json::from_str(record).unwrap();
    assert_eq!(
        call.timestamp_invite,
        Some(Utc.timestamp_opt(1_584_176_168, 250_000_000).unwrap())
    );
    assert_eq!(call.timestamp_ack, None);
    assert_eq!(call.timestamp_bye, None);
}

#[tokio::test]
async fn test_call_record_roundtrip_through_store() {
    let store = MemoryStore::new(Duration::from_secs(30));
    let call = Call {
        tenant: "default".to_string(),
        transaction_tag: CALL_ID.to_string(),
        account_tag: "151".to_string(),
        destination_account_tag: "001234567890".to_string(),
        source: "sip:151@10.135.0.1".to_string(),
        destination: "sip:001234567890@10.135.0.1".to_string(),
        cseq: "10691".to_string(),
        timestamp_invite: Some(ts(0)),
        timestamp_ack: Some(ts(1)),
        timestamp_bye: Some(Utc.timestamp_opt(1_584_176_170, 123_456_000).unwrap()),
    };
    store.set(CALL_ID, &call, 60).await.unwrap();
    let loaded: Call = store.get(CALL_ID).await.unwrap();
    assert_eq!(loaded, call);
}
