//! The networking modules handle all transport framing, secure channel state
//! and connection management between clients and the server.

pub mod buffer;
pub mod channel;
pub mod endpoint;
pub mod frame;
pub mod support;

use flint::policy::{MessageSecurityMode, PolicyKind, SecurityPolicy};
use std::rc::Rc;

/// One endpoint-exposed security configuration.
pub struct PolicyEntry {
    pub policy: Rc<SecurityPolicy>,
    pub mode: MessageSecurityMode,
}

/// The set of security policies the server exposes. Shared read-only by all
/// channels; replaced wholesale when the server identity rotates.
pub struct PolicySet {
    entries: Vec<PolicyEntry>,
}

impl PolicySet {
    #[inline]
    pub fn new(entries: Vec<PolicyEntry>) -> PolicySet {
        PolicySet { entries }
    }

    #[inline]
    pub fn entries(&self) -> &[PolicyEntry] {
        &self.entries
    }

    /// Finds the policy matching the given URI, if exposed.
    pub fn find_by_uri(&self, uri: &str) -> Option<&PolicyEntry> {
        let kind = PolicyKind::from_uri(uri)?;
        self.entries.iter().find(|entry| entry.policy.kind() == kind)
    }
}
