pub mod app;
pub mod config;
pub mod correlator;
pub mod hep;
pub mod identity;
pub mod metrics;
pub mod preflight;
pub mod publisher;
pub mod server;
pub mod sip;
pub mod state;
pub mod version;

pub use correlator::{CallCorrelator, CorrelatorOutcome};
pub use identity::{IdentityResolver, ResolvedIdentity};
pub use publisher::TransactionPublisher;
pub use sip::SipMessage;
pub use state::{StateStore, StateStoreExt};
