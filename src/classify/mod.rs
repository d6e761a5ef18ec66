//! Flow classification
//!
//! A [`Classifier`] opens one [`ClassifierState`] per flow. The meter feeds
//! it every observation of that flow and finalizes it exactly once, when
//! the flow is evicted. Dropping the state releases it on every other path.
//!
//! Classification never fails: anything the classifier cannot identify ends
//! up as [`Classification::unknown`].

pub mod basic;
pub mod tls;

use serde::{Deserialize, Serialize};

use crate::core::Observation;

pub use basic::BasicClassifier;

/// Final protocol / application verdict for a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub master_protocol: u16,
    pub app_protocol: u16,
    pub application_name: String,
    pub category_name: String,
}

impl Classification {
    pub fn unknown() -> Self {
        Self {
            master_protocol: 0,
            app_protocol: 0,
            application_name: "Unknown".to_string(),
            category_name: "Unknown".to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.master_protocol == 0 && self.app_protocol == 0
    }
}

impl Default for Classification {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Metadata a classifier fills in as the relevant messages go by
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMetadata {
    /// Client-side identity (TLS SNI, HTTP Host)
    pub client_info: String,
    /// Server-side identity (certificate names)
    pub server_info: String,
    /// JA3 client fingerprint
    pub ja3_client: String,
    /// JA3S server fingerprint
    pub ja3_server: String,
}

/// Factory for per-flow classifier state
pub trait Classifier: Send {
    /// Open state for a new flow; `first` is its first observation
    fn open(&self, first: &Observation) -> Box<dyn ClassifierState>;
}

/// In-progress classification of one flow
pub trait ClassifierState: Send {
    /// Inspect one observation of the flow
    fn update(&mut self, obs: &Observation, metadata: &mut FlowMetadata);

    /// Consume the state and produce the final verdict
    fn finish(self: Box<Self>) -> Classification;
}

/// Classifier that identifies nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClassifier;

struct Unclassified;

impl Classifier for NoClassifier {
    fn open(&self, _first: &Observation) -> Box<dyn ClassifierState> {
        Box::new(Unclassified)
    }
}

impl ClassifierState for Unclassified {
    fn update(&mut self, _obs: &Observation, _metadata: &mut FlowMetadata) {}

    fn finish(self: Box<Self>) -> Classification {
        Classification::unknown()
    }
}
