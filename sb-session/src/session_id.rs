/// A session identifier, grounded on `original_source/src/session_id.cxx`.
/// That file supports a multi-word `SessionId` (`SESSION_ID_WORDS`); the
/// default build uses a single 32-bit word, which is what this type
/// reproduces (32 bits of entropy, formatted as 8 hex chars).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u32);

impl SessionId {
    /// All-zero id, matching `SessionId::Clear()` / `IsDefined() == false`.
    pub const UNDEFINED: SessionId = SessionId(0);

    pub fn generate() -> Self {
        loop {
            let v = rand::random::<u32>();
            if v != 0 {
                return SessionId(v);
            }
        }
    }

    pub fn is_defined(&self) -> bool {
        self.0 != 0
    }

    /// "Cluster hash" — the word routing decisions stick on. With a single
    /// 32-bit word this is the whole value.
    pub fn cluster_hash(&self) -> u32 {
        self.0
    }

    /// Rewrites the cluster hash so `cluster_hash() % cluster_size ==
    /// cluster_node`, preserving the rest of the entropy exactly as
    /// `SessionId::SetClusterNode` does (`id - (id % cluster_size) +
    /// cluster_node`).
    pub fn with_cluster_node(self, cluster_size: u32, cluster_node: u32) -> Self {
        assert!(cluster_size > 0, "cluster_size must be positive");
        assert!(cluster_node < cluster_size, "cluster_node must be < cluster_size");
        let remainder = self.0 % cluster_size;
        SessionId(self.0 - remainder + cluster_node)
    }

    /// 8 lowercase hex chars, matching `SessionId::Format`.
    pub fn format(&self) -> String {
        format!("{:08x}", self.0)
    }

    /// Inverse of [`Self::format`]. Matches `SessionId::Parse`: rejects
    /// anything not exactly 8 hex chars.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 8 {
            return None;
        }
        u32::from_str_radix(s, 16).ok().map(SessionId)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for SessionId {
    fn from(v: u32) -> Self {
        SessionId(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse_roundtrip() {
        let id = SessionId(0xdeadbeef);
        assert_eq!(id.format(), "deadbeef");
        assert_eq!(SessionId::parse("deadbeef"), Some(id));
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert_eq!(SessionId::parse("abc"), None);
        assert_eq!(SessionId::parse("deadbeef00"), None);
    }

    #[test]
    fn test_undefined_is_not_defined() {
        assert!(!SessionId::UNDEFINED.is_defined());
        assert!(SessionId::generate().is_defined());
    }

    #[test]
    fn test_cluster_node_property() {
        // spec §8 testable property #7: cluster_size=8, cluster_node=3
        for _ in 0..1000 {
            let id = SessionId::generate().with_cluster_node(8, 3);
            assert_eq!(id.cluster_hash() % 8, 3);
        }
    }

    #[test]
    fn test_set_cluster_node_preserves_other_bits_modulo_rewrite() {
        let id = SessionId(100).with_cluster_node(10, 4);
        // 100 % 10 == 0, so this rewrites to 100 - 0 + 4 == 104
        assert_eq!(id.as_u32(), 104);
        assert_eq!(id.cluster_hash() % 10, 4);
    }
}
