//! Counters recorded through the `metrics` facade. No exporter is installed
//! here; whichever recorder the embedding process sets up receives them.

pub mod ingest {
    /// Increment for every datagram or TCP read handed to a packet task
    pub fn packet_received(transport: &'static str) {
        metrics::counter!(
            "rating_agent_packets_received_total",
            "transport" => transport
        )
        .increment(1);
    }

    /// Increment when a packet cannot be turned into a SIP message
    pub fn decode_error() {
        metrics::counter!("rating_agent_decode_errors_total").increment(1);
    }
}

pub mod correlator {
    /// Record a begin/end transaction emitted by the correlator
    pub fn transaction(kind: &'static str) {
        metrics::counter!("rating_agent_transactions_total", "kind" => kind).increment(1);
    }

    pub fn publish_error(routing_key: &str) {
        metrics::counter!(
            "rating_agent_publish_errors_total",
            "routing_key" => routing_key.to_string()
        )
        .increment(1);
    }

    pub fn store_error(operation: &'static str) {
        metrics::counter!(
            "rating_agent_store_errors_total",
            "operation" => operation
        )
        .increment(1);
    }
}
