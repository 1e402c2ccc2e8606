use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use sb_shm::{DPool, Shm};

use crate::session::Session;
use crate::session_id::SessionId;

/// Matches the original `session_put`'s `(counter % 1024) == 0` check:
/// the defragment decision is only reconsidered every 1024th `Get`, and
/// reads the post-increment counter value (spec §4.5).
const DEFRAGMENT_EVERY: u32 = 1024;

/// Cap on how many sessions a single `Purge` round forces out, matching
/// the original's `StaticArray<Session *, 256>`.
const PURGE_BATCH_LIMIT: usize = 256;

/// Below this many freed sessions in the highest-score group, `Purge`
/// would be called too often for the work it does, so it retries itself
/// once more when the table is still nearly full.
const PURGE_RETRY_THRESHOLD: usize = 16;

/// Shared-memory-backed session table with cluster-hash stickiness,
/// grounded on `original_source/src/session_manager.cxx`'s
/// `SessionManager`. Sessions live behind per-session `Mutex`es inside a
/// `RwLock`-guarded table — manager lock, then session lock, never the
/// reverse — mirroring the original's table rwlock / per-session lock
/// pair without needing real shared memory or multiple processes.
pub struct SessionManager {
    idle_timeout: u64,
    cluster_size: u32,
    cluster_node: u32,
    shm: Arc<Shm>,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    abandoned: AtomicBool,
    crash_unsafe_depth: AtomicU32,
}

/// A locked handle to a live session, returned by [`SessionManager::get`]
/// and [`SessionManager::new_session`]. Must be released through
/// [`SessionManager::put`] to run the defragment check and leave the
/// crash-unsafe window the original enters for the duration of the hold.
pub struct SessionLease<'a> {
    _manager: &'a SessionManager,
    id: SessionId,
    entry: Arc<Mutex<Session>>,
}

impl<'a> SessionLease<'a> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn with<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.entry.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.entry.lock())
    }
}

impl SessionManager {
    pub fn new(idle_timeout: u64, cluster_size: u32, cluster_node: u32, shm: Arc<Shm>) -> Self {
        assert!(
            cluster_size == 0 || cluster_node < cluster_size,
            "cluster_node must be < cluster_size"
        );
        Self {
            idle_timeout,
            cluster_size,
            cluster_node,
            shm,
            sessions: RwLock::new(HashMap::new()),
            abandoned: AtomicBool::new(false),
            crash_unsafe_depth: AtomicU32::new(0),
        }
    }

    /// Marks entry into a window where shared memory is being mutated
    /// and must not be trusted if the process dies mid-window. A real
    /// master process would consult this via [`Self::is_crash_unsafe`]
    /// on worker death to decide whether to keep or abandon the table.
    pub fn crash_unsafe_enter(&self) {
        self.crash_unsafe_depth.fetch_add(1, Ordering::SeqCst);
    }

    pub fn crash_unsafe_leave(&self) {
        self.crash_unsafe_depth.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_crash_unsafe(&self) -> bool {
        self.crash_unsafe_depth.load(Ordering::SeqCst) > 0
    }

    /// Disables the manager after a worker crash leaves shared memory in
    /// a possibly-inconsistent state (matches `SessionManager::Abandon`).
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn generate_id(&self) -> SessionId {
        let id = SessionId::generate();
        if self.cluster_size > 0 {
            id.with_cluster_node(self.cluster_size, self.cluster_node)
        } else {
            id
        }
    }

    /// Allocates a dpool and a session id, retrying once via [`Self::purge`]
    /// if shared memory is exhausted (matches `session_new`/`session_new_unsafe`).
    pub fn new_session(&self, realm: &str, now: u64) -> Option<SessionLease<'_>> {
        self.crash_unsafe_enter();
        let lease = self.new_session_unsafe(realm, now);
        if lease.is_none() {
            self.crash_unsafe_leave();
        }
        lease
    }

    fn new_session_unsafe(&self, realm: &str, now: u64) -> Option<SessionLease<'_>> {
        if self.is_abandoned() {
            return None;
        }

        let pool = match DPool::try_new(self.shm.clone()) {
            Some(pool) => pool,
            None => {
                if !self.purge(now) {
                    return None;
                }
                DPool::try_new(self.shm.clone())?
            }
        };

        let id = self.generate_id();
        let session = Session::new(id, realm.to_string(), now + self.idle_timeout, Arc::new(pool));
        let entry = Arc::new(Mutex::new(session));

        self.sessions.write().insert(id, entry.clone());

        Some(SessionLease {
            _manager: self,
            id,
            entry,
        })
    }

    /// Looks up and locks a session, touching its expiry and
    /// incrementing its access counter (matches `session_find`).
    pub fn get(&self, id: SessionId, now: u64) -> Option<SessionLease<'_>> {
        if self.is_abandoned() {
            return None;
        }

        self.crash_unsafe_enter();

        let entry = self.sessions.read().get(&id).cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => {
                self.crash_unsafe_leave();
                return None;
            }
        };

        {
            let mut session = entry.lock();
            session.expires = now + self.idle_timeout;
            session.counter = session.counter.wrapping_add(1);
        }

        Some(SessionLease {
            _manager: self,
            id,
            entry,
        })
    }

    /// Releases a session, defragmenting it when its dpool is fragmented
    /// on a `DEFRAGMENT_EVERY`th access (matches `session_put`). The
    /// defragment check reads the counter `Get` already incremented.
    pub fn put(&self, lease: SessionLease<'_>) {
        let needs_defragment =
            lease.with(|session| session.counter % DEFRAGMENT_EVERY == 0 && session.is_fragmented());
        let id = lease.id;
        drop(lease);

        if needs_defragment {
            self.defragment(id);
        }

        self.crash_unsafe_leave();
    }

    /// Duplicates a session into a fresh dpool, keeping the fragmented
    /// copy if shared memory is too exhausted to grow one (matches
    /// `session_defragment`/`session_defragment_id`).
    fn defragment(&self, id: SessionId) {
        let sessions = self.sessions.write();
        let Some(entry) = sessions.get(&id).cloned() else {
            return;
        };
        drop(sessions);

        let mut session = entry.lock();
        if session.defragment(&self.shm).is_some() {
            tracing::debug!(id = %id.format(), "defragmented session");
        } else {
            tracing::warn!(id = %id.format(), "defragment failed, shm exhausted");
        }
    }

    pub fn delete(&self, id: SessionId) {
        self.sessions.write().remove(&id);
    }

    /// Calls `f` on every non-expired live session, stopping early if `f`
    /// returns `false`. Each session is locked individually rather than
    /// holding the table lock for the whole walk (matches
    /// `SessionManager::Visit`).
    pub fn visit(&self, now: u64, mut f: impl FnMut(&Session) -> bool) {
        let entries: Vec<_> = self.sessions.read().values().cloned().collect();
        for entry in entries {
            let session = entry.lock();
            if session.expires < now {
                continue;
            }
            if !f(&session) {
                break;
            }
        }
    }

    /// Scores every session by "soon to expire, rarely accessed, bloated
    /// dpool" and forces out the highest-scoring group (at most
    /// [`PURGE_BATCH_LIMIT`] sessions). Retries itself once more if the
    /// freed group was small and the table is still nearly full, to
    /// avoid calling this expensive scan too often (matches
    /// `SessionManager::Purge`). Returns whether anything was purged.
    pub fn purge(&self, now: u64) -> bool {
        let mut sessions = self.sessions.write();

        let mut highest_score = i64::MIN;
        let mut candidates: Vec<SessionId> = Vec::new();

        for (id, entry) in sessions.iter() {
            let score = purge_score(&entry.lock(), now);

            if score > highest_score {
                candidates.clear();
                highest_score = score;
            }
            if score == highest_score && candidates.len() < PURGE_BATCH_LIMIT {
                candidates.push(*id);
            }
        }

        if candidates.is_empty() {
            return false;
        }

        for id in &candidates {
            sessions.remove(id);
        }

        let remaining = sessions.len();
        let region_nearly_full = remaining > self.shm.num_pages().saturating_sub(PURGE_BATCH_LIMIT);
        let again = candidates.len() < PURGE_RETRY_THRESHOLD && region_nearly_full;

        drop(sessions);

        tracing::debug!(purged = candidates.len(), score = highest_score, again, "purged sessions");

        if again {
            self.purge(now);
        }

        true
    }
}

/// Higher score = more purge-worthy. This isn't a verbatim port —
/// `session_purge_score`'s body wasn't present in the retrieved original
/// source — but follows the "expiry-soon + low counter + large dpool"
/// shape spec §4.5 names.
fn purge_score(session: &Session, now: u64) -> i64 {
    let time_left = session.expires.saturating_sub(now) as i64;
    let counter_score = session.counter as i64;
    let size_score = session.pool.total_used() as i64;
    -time_left - counter_score + size_score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shm() -> Arc<Shm> {
        Arc::new(Shm::new(4096, 64))
    }

    #[test]
    fn test_new_get_put_roundtrip() {
        let manager = SessionManager::new(300, 0, 0, shm());
        let lease = manager.new_session("realm", 1000).unwrap();
        let id = lease.id();
        manager.put(lease);

        let lease = manager.get(id, 1001).unwrap();
        lease.with(|s| assert_eq!(s.counter, 1));
        manager.put(lease);

        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let manager = SessionManager::new(300, 0, 0, shm());
        assert!(manager.get(SessionId::from(0xdead), 0).is_none());
    }

    #[test]
    fn test_delete_removes_session() {
        let manager = SessionManager::new(300, 0, 0, shm());
        let lease = manager.new_session("realm", 0).unwrap();
        let id = lease.id();
        manager.put(lease);

        manager.delete(id);
        assert!(manager.get(id, 0).is_none());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_cluster_hash_routes_new_sessions_to_configured_node() {
        let manager = SessionManager::new(300, 8, 3, Arc::new(Shm::new(4096, 256)));
        for _ in 0..100 {
            let lease = manager.new_session("realm", 0).unwrap();
            let id = lease.id();
            manager.put(lease);
            assert_eq!(id.cluster_hash() % 8, 3);
        }
    }

    #[test]
    fn test_visit_sees_every_session() {
        let manager = SessionManager::new(300, 0, 0, shm());
        for _ in 0..5 {
            let lease = manager.new_session("realm", 0).unwrap();
            manager.put(lease);
        }

        let mut seen = 0;
        manager.visit(0, |_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 5);
    }

    #[test]
    fn test_visit_skips_expired_sessions() {
        let manager = SessionManager::new(300, 0, 0, shm());
        for _ in 0..5 {
            let lease = manager.new_session("realm", 0).unwrap();
            manager.put(lease);
        }

        let mut seen = 0;
        manager.visit(1000, |_| {
            seen += 1;
            true
        });
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_visit_stops_early_when_callback_returns_false() {
        let manager = SessionManager::new(300, 0, 0, shm());
        for _ in 0..5 {
            let lease = manager.new_session("realm", 0).unwrap();
            manager.put(lease);
        }

        let mut seen = 0;
        manager.visit(0, |_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_purge_evicts_at_least_one_session_when_table_nonempty() {
        let manager = SessionManager::new(300, 0, 0, shm());
        for i in 0..10 {
            let lease = manager.new_session("realm", i).unwrap();
            manager.put(lease);
        }

        assert!(manager.purge(100));
        assert!(manager.len() < 10);
    }

    #[test]
    fn test_purge_on_empty_table_returns_false() {
        let manager = SessionManager::new(300, 0, 0, shm());
        assert!(!manager.purge(0));
    }

    #[test]
    fn test_abandoned_manager_refuses_new_sessions() {
        let manager = SessionManager::new(300, 0, 0, shm());
        manager.abandon();
        assert!(manager.new_session("realm", 0).is_none());
    }
}
