use std::sync::Arc;

use sb_shm::{DPool, Shm};

use crate::session_id::SessionId;

/// Per-widget session state, grounded on `original_source/src/session.h`'s
/// `struct widget_session` (`id`, nested `children`, `path_info`,
/// `query_string`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WidgetSession {
    pub id: String,
    pub children: Vec<WidgetSession>,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
}

/// One cookie stored in a session's cookie jar, grounded on the fields
/// `session_write.cxx`'s `write_cookie` persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: u64,
}

/// A session associated with a user (spec §3 data model, §4.5). Owns a
/// `DPool` 1:1 — not because this port stores field bytes inside it (plain
/// owned Rust fields are simpler and equally safe here), but because the
/// pool's fragmentation counter is exactly what `Put`'s defragment check
/// and `Purge`'s scoring read, and both are part of this type's contract.
pub struct Session {
    pub id: SessionId,
    pub realm: String,
    /// Unix timestamp (seconds) after which this session is expired.
    pub expires: u64,
    /// Incremented on every `Get`; `Put`'s defragment check reads the
    /// post-increment value.
    pub counter: u32,
    pub is_new: bool,
    pub cookie_sent: bool,
    pub cookie_received: bool,
    pub translate: Option<Vec<u8>>,
    pub user: Option<String>,
    pub user_expires: u64,
    pub language: Option<String>,
    pub widgets: Vec<WidgetSession>,
    pub cookies: Vec<SessionCookie>,
    pub(crate) pool: Arc<DPool>,
}

impl Session {
    pub(crate) fn new(id: SessionId, realm: String, expires: u64, pool: Arc<DPool>) -> Self {
        Self {
            id,
            realm,
            expires,
            counter: 0,
            is_new: true,
            cookie_sent: false,
            cookie_received: false,
            translate: None,
            user: None,
            user_expires: 0,
            language: None,
            widgets: Vec::new(),
            cookies: Vec::new(),
            pool,
        }
    }

    pub fn is_fragmented(&self) -> bool {
        self.pool.is_fragmented()
    }

    /// Replace this session's dpool with a fresh one — the mechanics half
    /// of `session_defragment` (the manager half, swapping the set entry,
    /// lives in `SessionManager::defragment`).
    pub(crate) fn defragment(&mut self, shm: &Arc<Shm>) -> Option<()> {
        self.pool = Arc::new(DPool::try_new(shm.clone())?);
        Some(())
    }
}
