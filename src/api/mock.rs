use crate::common::data::RecordedRequest;
use crate::server::state::{RuleRegistry, StateManager};
use std::sync::Arc;

/// A handle onto one registered rule. Holds only the rule id and reads
/// through the registry, so it stays valid (and merely turns empty) after
/// a reset removed the rule.
#[derive(Clone)]
pub struct MockedEndpoint {
    id: usize,
    registry: Arc<RuleRegistry>,
}

impl MockedEndpoint {
    pub(crate) fn new(id: usize, registry: Arc<RuleRegistry>) -> Self {
        Self { id, registry }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The requests this rule has served, in arrival order. Empty when the
    /// rule has been removed.
    pub fn seen_requests(&self) -> Vec<Arc<RecordedRequest>> {
        self.registry.seen_requests(self.id)
    }

    pub fn times_called(&self) -> usize {
        self.seen_requests().len()
    }
}

impl std::fmt::Debug for MockedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockedEndpoint")
            .field("id", &self.id)
            .field("times_called", &self.times_called())
            .finish()
    }
}
