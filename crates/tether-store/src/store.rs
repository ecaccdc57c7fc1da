use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use tether_core::fingerprint::TaskFingerprint;
use tether_core::ids::SessionId;
use tether_settings::{RefinementSettings, SessionSettings};
use tether_telemetry::metrics::{names, MetricsRecorder};

use crate::error::{AdmissionError, StoreError};
use crate::persist::{self, StoreLayout};
use crate::record::{classify_trend, RefinementState, SessionRecord, SessionStatus};

/// Ceilings the store enforces.
#[derive(Clone, Debug)]
pub struct StoreLimits {
    pub max_depth: u32,
    pub max_total_calls: u32,
    pub max_refinements: u32,
    pub max_parallel_agents: usize,
    pub idle_timeout: Duration,
    pub allow_nested_spawn: bool,
    pub trend_window: usize,
    pub trend_delta: f64,
}

impl StoreLimits {
    pub fn from_settings(sessions: &SessionSettings, refinement: &RefinementSettings) -> Self {
        Self {
            max_depth: sessions.max_depth,
            max_total_calls: sessions.max_total_calls,
            max_refinements: sessions.max_refinements,
            max_parallel_agents: sessions.max_parallel_agents,
            idle_timeout: Duration::from_secs(sessions.idle_timeout_secs),
            allow_nested_spawn: sessions.allow_nested_spawn,
            trend_window: refinement.trend_window,
            trend_delta: refinement.trend_delta,
        }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default(), &RefinementSettings::default())
    }
}

type Shared<T> = Arc<Mutex<T>>;

/// File-backed session store.
///
/// Records sit in a `DashMap`, each behind its own mutex. A mutation holds
/// the record's lock while it writes the file, so writes for one session
/// never race and different sessions never contend.
pub struct SessionStore {
    layout: StoreLayout,
    limits: StoreLimits,
    sessions: DashMap<SessionId, Shared<SessionRecord>>,
    lineages: DashMap<String, Shared<RefinementState>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SessionStore {
    /// Open (or create) a store rooted at `root`, reloading persisted
    /// sessions. Sessions idle past `limits.idle_timeout` are archived as
    /// expired instead of loaded.
    pub fn open(root: impl Into<PathBuf>, limits: StoreLimits) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        layout.create_dirs()?;

        let store = Self {
            layout,
            limits,
            sessions: DashMap::new(),
            lineages: DashMap::new(),
            metrics: None,
        };

        let now = Utc::now();
        let idle = to_chrono(store.limits.idle_timeout);
        let mut dropped = 0usize;
        for record in persist::load_dir::<SessionRecord>(&store.layout.active_dir())? {
            if record.idle_for(now) > idle {
                store.archive(record, SessionStatus::Expired)?;
                dropped += 1;
            } else {
                store.sessions.insert(record.id.clone(), Arc::new(Mutex::new(record)));
            }
        }

        // only lineages of sessions still active come back into memory
        let mut retired = 0usize;
        for state in persist::load_dir::<RefinementState>(&store.layout.refinements_dir())? {
            if store.sessions.contains_key(&state.session_id) {
                let key = lineage_key(&state.session_id, &state.role, &state.fingerprint);
                store.lineages.insert(key, Arc::new(Mutex::new(state)));
            } else {
                store.archive_lineage(&state)?;
                retired += 1;
            }
        }

        info!(
            root = %store.layout.root().display(),
            loaded = store.sessions.len(),
            expired = dropped,
            lineages = store.lineages.len(),
            retired_lineages = retired,
            "session store opened"
        );
        Ok(store)
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        metrics.gauge_set(names::STORE_SESSIONS_ACTIVE, &[], self.sessions.len() as f64);
        self.metrics = Some(metrics);
        self
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    /// Create a session. With no parent this starts a new top-level lineage;
    /// with a parent the child inherits `depth + 1` and is a sub-agent.
    #[instrument(skip(self, parent), fields(parent = ?parent.map(SessionId::as_str)))]
    pub fn admit(&self, parent: Option<&SessionId>) -> Result<SessionId, StoreError> {
        let record = match parent {
            None => SessionRecord::root(),
            Some(parent_id) => {
                let handle = self.handle(parent_id)?;
                let mut parent = handle.lock();
                if let Err(e) = self.check_spawn(&parent) {
                    self.reject(&e);
                    return Err(e.into());
                }
                parent.touch();
                persist::write_atomic(&self.layout.active_path(parent.id.as_str()), &*parent)?;
                SessionRecord::child_of(&parent)
            }
        };

        persist::write_atomic(&self.layout.active_path(record.id.as_str()), &record)?;
        let id = record.id.clone();
        debug!(session_id = %id, depth = record.depth, "session admitted");
        self.sessions.insert(id.clone(), Arc::new(Mutex::new(record)));
        self.update_active_gauge();
        Ok(id)
    }

    fn check_spawn(&self, parent: &SessionRecord) -> Result<(), AdmissionError> {
        let depth = parent.depth + 1;
        if depth > self.limits.max_depth {
            return Err(AdmissionError::DepthExceeded {
                depth,
                max: self.limits.max_depth,
            });
        }
        if parent.total_calls >= self.limits.max_total_calls {
            return Err(AdmissionError::CallBudgetExceeded {
                calls: parent.total_calls,
                max: self.limits.max_total_calls,
            });
        }
        if parent.is_sub_agent && !self.limits.allow_nested_spawn {
            return Err(AdmissionError::SubAgentCannotSpawn(parent.id.to_string()));
        }
        Ok(())
    }

    /// Charge one provider call to `id` and every ancestor still active.
    ///
    /// All ceilings are checked on the whole chain before any counter moves,
    /// so a rejected call leaves every record untouched. The new counters are
    /// written for the whole chain before memory is updated; a failed write
    /// restores the files already written and leaves memory as it was.
    #[instrument(skip(self, id), fields(session_id = %id))]
    pub fn record_call(&self, id: &SessionId, role: &str) -> Result<u32, StoreError> {
        let chain = self.lineage_chain(id)?;
        // child before ancestor; every caller locks in this order
        let mut guards: Vec<_> = chain.iter().map(|h| h.lock()).collect();

        for rec in guards.iter() {
            if rec.total_calls >= self.limits.max_total_calls {
                let e = AdmissionError::CallBudgetExceeded {
                    calls: rec.total_calls,
                    max: self.limits.max_total_calls,
                };
                self.reject(&e);
                return Err(e.into());
            }
        }

        let updated: Vec<SessionRecord> = guards
            .iter()
            .map(|rec| {
                let mut next = (**rec).clone();
                next.total_calls += 1;
                *next.per_role_calls.entry(role.to_string()).or_insert(0) += 1;
                next.touch();
                next
            })
            .collect();

        for (written, next) in updated.iter().enumerate() {
            if let Err(e) = persist::write_atomic(&self.layout.active_path(next.id.as_str()), next) {
                for prev in &guards[..written] {
                    if let Err(restore) = persist::write_atomic(&self.layout.active_path(prev.id.as_str()), &**prev) {
                        warn!(session_id = %prev.id, error = %restore, "failed to restore record after aborted call");
                    }
                }
                return Err(e);
            }
        }

        let total = updated[0].total_calls;
        for (rec, next) in guards.iter_mut().zip(updated) {
            **rec = next;
        }
        Ok(total)
    }

    /// Increment and return the refinement counter for `fingerprint`.
    #[instrument(skip(self, id, fingerprint), fields(session_id = %id, fingerprint = fingerprint.short()))]
    pub fn record_refinement(&self, id: &SessionId, fingerprint: &TaskFingerprint) -> Result<u32, StoreError> {
        let handle = self.handle(id)?;
        let mut rec = handle.lock();
        let count = rec.refinements_for(fingerprint);
        if count >= self.limits.max_refinements {
            let e = AdmissionError::RefinementBudgetExceeded {
                count,
                max: self.limits.max_refinements,
            };
            self.reject(&e);
            return Err(e.into());
        }
        let mut next = rec.clone();
        next.per_task_refinements.insert(fingerprint.clone(), count + 1);
        next.touch();
        persist::write_atomic(&self.layout.active_path(next.id.as_str()), &next)?;
        *rec = next;
        Ok(count + 1)
    }

    pub fn refinement_count(&self, id: &SessionId, fingerprint: &TaskFingerprint) -> Result<u32, StoreError> {
        Ok(self.handle(id)?.lock().refinements_for(fingerprint))
    }

    /// Pure admission check for a parallel batch of `n` agents.
    pub fn admit_parallel(&self, n: usize) -> bool {
        n <= self.limits.max_parallel_agents
    }

    /// Archive sessions idle longer than `max_idle` as expired.
    /// Returns the ids that were removed.
    #[instrument(skip(self))]
    pub fn sweep(&self, max_idle: Duration) -> Result<Vec<SessionId>, StoreError> {
        let now = Utc::now();
        let max_idle = to_chrono(max_idle);
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.value().lock().idle_for(now) > max_idle)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = Vec::new();
        for id in candidates {
            // re-check under the entry lock; a call may have touched it since
            let taken = self
                .sessions
                .remove_if(&id, |_, rec| rec.lock().idle_for(now) > max_idle);
            if let Some((_, handle)) = taken {
                let record = {
                    let mut rec = handle.lock();
                    rec.status = SessionStatus::Expired;
                    rec.clone()
                };
                self.archive(record, SessionStatus::Expired)?;
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "swept idle sessions");
            self.update_active_gauge();
        }
        Ok(removed)
    }

    /// Move a session to `completed/`. Completed sessions accept no more calls.
    #[instrument(skip(self, id), fields(session_id = %id))]
    pub fn complete(&self, id: &SessionId) -> Result<SessionRecord, StoreError> {
        let (_, handle) = self
            .sessions
            .remove(id)
            .ok_or_else(|| self.missing(id))?;
        let record = {
            let mut rec = handle.lock();
            rec.status = SessionStatus::Completed;
            rec.touch();
            rec.clone()
        };
        let record = self.archive(record, SessionStatus::Completed)?;
        self.update_active_gauge();
        Ok(record)
    }

    /// Look up a session, active or archived.
    pub fn get(&self, id: &SessionId) -> Result<SessionRecord, StoreError> {
        if let Some(handle) = self.sessions.get(id) {
            return Ok(handle.lock().clone());
        }
        let path = self.layout.completed_path(id.as_str());
        if path.exists() {
            return persist::read_json(&path);
        }
        Err(StoreError::NotFound(id.to_string()))
    }

    /// Active sessions ordered by id (which is creation order).
    pub fn list_active(&self) -> Vec<SessionRecord> {
        let mut out: Vec<SessionRecord> = self.sessions.iter().map(|e| e.value().lock().clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Archived sessions, read from disk.
    pub fn list_completed(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut out: Vec<SessionRecord> = persist::load_dir(&self.layout.completed_dir())?;
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Append a score to the (session, role, fingerprint) lineage and
    /// recompute its trend. The session must still be active.
    #[instrument(skip(self, id, fingerprint), fields(session_id = %id))]
    pub fn record_score(
        &self,
        id: &SessionId,
        role: &str,
        fingerprint: &TaskFingerprint,
        score: f64,
    ) -> Result<RefinementState, StoreError> {
        let session_handle = self.handle(id)?;
        // held until the lineage is written so a concurrent complete or
        // sweep archives it afterwards
        let session = session_handle.lock();
        if session.status != SessionStatus::Active {
            return Err(StoreError::Inactive(id.to_string()));
        }

        let key = lineage_key(id, role, fingerprint);
        let handle = self
            .lineages
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(RefinementState::new(id.clone(), role, fingerprint.clone()))))
            .clone();

        let mut state = handle.lock();
        let mut next = state.clone();
        next.attempts += 1;
        next.scores.push(score);
        next.last_attempt_at = Utc::now();
        next.trend = classify_trend(&next.scores, self.limits.trend_window, self.limits.trend_delta);

        let path = self.layout.lineage_path(id.as_str(), role, fingerprint.as_str());
        persist::write_atomic(&path, &next)?;
        debug!(attempts = next.attempts, trend = next.trend.as_str(), "score recorded");
        *state = next.clone();
        Ok(next)
    }

    /// Score lineage of an active session.
    pub fn refinement_state(&self, id: &SessionId, role: &str, fingerprint: &TaskFingerprint) -> Option<RefinementState> {
        self.lineages
            .get(&lineage_key(id, role, fingerprint))
            .map(|h| h.lock().clone())
    }

    /// Score lineages of a session that has been completed or expired,
    /// read from disk.
    pub fn archived_lineages(&self, id: &SessionId) -> Result<Vec<RefinementState>, StoreError> {
        let mut out: Vec<RefinementState> = persist::load_dir(&self.layout.archived_refinements_dir())?;
        out.retain(|state| &state.session_id == id);
        out.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.fingerprint.cmp(&b.fingerprint)));
        Ok(out)
    }

    /// Number of lineages held in memory.
    pub fn lineage_count(&self) -> usize {
        self.lineages.len()
    }

    fn handle(&self, id: &SessionId) -> Result<Shared<SessionRecord>, StoreError> {
        self.sessions
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| self.missing(id))
    }

    fn missing(&self, id: &SessionId) -> StoreError {
        if self.layout.completed_path(id.as_str()).exists() {
            StoreError::Inactive(id.to_string())
        } else {
            StoreError::NotFound(id.to_string())
        }
    }

    /// `id` followed by each ancestor still held in memory.
    fn lineage_chain(&self, id: &SessionId) -> Result<Vec<Shared<SessionRecord>>, StoreError> {
        let mut chain = vec![self.handle(id)?];
        let mut next = chain[0].lock().parent_id.clone();
        while let Some(parent_id) = next {
            let Some(handle) = self.sessions.get(&parent_id).map(|e| Arc::clone(e.value())) else {
                break;
            };
            next = handle.lock().parent_id.clone();
            chain.push(handle);
        }
        Ok(chain)
    }

    fn archive(&self, mut record: SessionRecord, status: SessionStatus) -> Result<SessionRecord, StoreError> {
        record.status = status;
        persist::write_atomic(&self.layout.completed_path(record.id.as_str()), &record)?;
        persist::remove_if_exists(&self.layout.active_path(record.id.as_str()))?;
        let lineages = self.archive_lineages(&record.id)?;
        debug!(session_id = %record.id, status = status.as_str(), lineages, "session archived");
        Ok(record)
    }

    /// Drop a session's lineages from memory and move their files under
    /// `completed/refinements/`.
    fn archive_lineages(&self, id: &SessionId) -> Result<usize, StoreError> {
        let prefix = format!("{id}\u{1f}");
        let keys: Vec<String> = self
            .lineages
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();

        let mut moved = 0;
        for key in keys {
            if let Some((_, handle)) = self.lineages.remove(&key) {
                let state = handle.lock().clone();
                self.archive_lineage(&state)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn archive_lineage(&self, state: &RefinementState) -> Result<(), StoreError> {
        let (session, fingerprint) = (state.session_id.as_str(), state.fingerprint.as_str());
        persist::write_atomic(
            &self.layout.archived_lineage_path(session, &state.role, fingerprint),
            state,
        )?;
        persist::remove_if_exists(&self.layout.lineage_path(session, &state.role, fingerprint))
    }

    fn reject(&self, e: &AdmissionError) {
        warn!(reason = e.kind(), error = %e, "admission rejected");
        if let Some(m) = &self.metrics {
            m.counter_inc(names::STORE_ADMISSION_REJECTED, &[("reason", e.kind())], 1);
        }
    }

    fn update_active_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.gauge_set(names::STORE_SESSIONS_ACTIVE, &[], self.sessions.len() as f64);
        }
    }

    #[cfg(test)]
    fn backdate(&self, id: &SessionId, secs: i64) {
        let handle = self.handle(id).unwrap();
        let mut rec = handle.lock();
        rec.last_activity -= chrono::Duration::seconds(secs);
        persist::write_atomic(&self.layout.active_path(rec.id.as_str()), &*rec).unwrap();
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

fn lineage_key(id: &SessionId, role: &str, fingerprint: &TaskFingerprint) -> String {
    format!("{id}\u{1f}{role}\u{1f}{fingerprint}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Trend;
    use std::fs;

    fn limits() -> StoreLimits {
        StoreLimits {
            max_depth: 2,
            max_total_calls: 3,
            max_refinements: 2,
            max_parallel_agents: 4,
            idle_timeout: Duration::from_secs(3600),
            allow_nested_spawn: false,
            trend_window: 3,
            trend_delta: 5.0,
        }
    }

    fn open(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::open(dir.path(), limits()).unwrap()
    }

    fn fp(s: &str) -> TaskFingerprint {
        TaskFingerprint::from_raw(s)
    }

    #[test]
    fn admit_root_and_child() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        let root = store.admit(None).unwrap();
        let child = store.admit(Some(&root)).unwrap();

        let r = store.get(&root).unwrap();
        let c = store.get(&child).unwrap();
        assert_eq!((r.depth, r.is_sub_agent), (0, false));
        assert_eq!((c.depth, c.is_sub_agent), (1, true));
        assert_eq!(c.parent_id, Some(root));
        assert!(dir.path().join("active").join(format!("{child}.json")).exists());
    }

    #[test]
    fn sub_agent_cannot_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let root = store.admit(None).unwrap();
        let child = store.admit(Some(&root)).unwrap();

        let err = store.admit(Some(&child)).unwrap_err();
        assert!(matches!(err, StoreError::Admission(AdmissionError::SubAgentCannotSpawn(_))));
    }

    #[test]
    fn nested_spawn_allowed_up_to_depth() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(
            dir.path(),
            StoreLimits {
                allow_nested_spawn: true,
                max_depth: 1,
                ..limits()
            },
        )
        .unwrap();
        let root = store.admit(None).unwrap();
        let child = store.admit(Some(&root)).unwrap();

        let err = store.admit(Some(&child)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Admission(AdmissionError::DepthExceeded { depth: 2, max: 1 })
        ));
    }

    #[test]
    fn admit_rejects_exhausted_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let root = store.admit(None).unwrap();
        for _ in 0..3 {
            store.record_call(&root, "architect").unwrap();
        }
        let err = store.admit(Some(&root)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Admission(AdmissionError::CallBudgetExceeded { calls: 3, max: 3 })
        ));
    }

    #[test]
    fn unknown_parent_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let err = store.admit(Some(&SessionId::from_raw("sess_missing"))).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn call_budget_rejects_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = store.admit(None).unwrap();

        assert_eq!(store.record_call(&id, "debugger").unwrap(), 1);
        assert_eq!(store.record_call(&id, "debugger").unwrap(), 2);
        assert_eq!(store.record_call(&id, "architect").unwrap(), 3);

        let err = store.record_call(&id, "debugger").unwrap_err();
        assert!(err.is_admission());

        let rec = store.get(&id).unwrap();
        assert_eq!(rec.total_calls, 3);
        assert_eq!(rec.per_role_calls["debugger"], 2);
        assert_eq!(rec.per_role_calls["architect"], 1);
    }

    #[test]
    fn calls_charge_the_whole_lineage() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let root = store.admit(None).unwrap();
        let a = store.admit(Some(&root)).unwrap();
        let b = store.admit(Some(&root)).unwrap();

        store.record_call(&a, "x").unwrap();
        store.record_call(&b, "x").unwrap();
        store.record_call(&root, "x").unwrap();
        assert_eq!(store.get(&root).unwrap().total_calls, 3);

        // root is exhausted, so the child is refused and stays at 1
        assert!(store.record_call(&a, "x").unwrap_err().is_admission());
        assert_eq!(store.get(&a).unwrap().total_calls, 1);
    }

    #[test]
    fn refinement_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = store.admit(None).unwrap();

        assert_eq!(store.record_refinement(&id, &fp("t1")).unwrap(), 1);
        assert_eq!(store.record_refinement(&id, &fp("t1")).unwrap(), 2);
        let err = store.record_refinement(&id, &fp("t1")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Admission(AdmissionError::RefinementBudgetExceeded { count: 2, max: 2 })
        ));
        // independent per fingerprint
        assert_eq!(store.record_refinement(&id, &fp("t2")).unwrap(), 1);
        assert_eq!(store.refinement_count(&id, &fp("t1")).unwrap(), 2);
    }

    #[test]
    fn parallel_admission_is_a_pure_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.admit_parallel(4));
        assert!(!store.admit_parallel(5));
        assert!(store.list_active().is_empty());
    }

    #[test]
    fn reload_restores_counters() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = open(&dir);
            let id = store.admit(None).unwrap();
            store.record_call(&id, "architect").unwrap();
            store.record_refinement(&id, &fp("t")).unwrap();
            id
        };

        let store = open(&dir);
        let rec = store.get(&id).unwrap();
        assert_eq!(rec.total_calls, 1);
        assert_eq!(rec.refinements_for(&fp("t")), 1);
        assert_eq!(store.record_call(&id, "architect").unwrap(), 2);
    }

    #[test]
    fn reload_expires_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (stale, fresh) = {
            let store = open(&dir);
            let stale = store.admit(None).unwrap();
            let fresh = store.admit(None).unwrap();
            store.backdate(&stale, 7200);
            (stale, fresh)
        };

        let store = open(&dir);
        let active: Vec<_> = store.list_active().into_iter().map(|r| r.id).collect();
        assert_eq!(active, vec![fresh]);
        assert_eq!(store.get(&stale).unwrap().status, SessionStatus::Expired);
    }

    #[test]
    fn sweep_removes_only_idle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let old = store.admit(None).unwrap();
        let new = store.admit(None).unwrap();
        store.backdate(&old, 120);

        let swept = store.sweep(Duration::from_secs(60)).unwrap();
        assert_eq!(swept, vec![old.clone()]);
        assert_eq!(store.list_active().len(), 1);
        assert_eq!(store.get(&new).unwrap().status, SessionStatus::Active);
        assert!(!dir.path().join("active").join(format!("{old}.json")).exists());
    }

    #[test]
    fn completed_sessions_reject_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = store.admit(None).unwrap();
        store.record_call(&id, "r").unwrap();

        let rec = store.complete(&id).unwrap();
        assert_eq!(rec.status, SessionStatus::Completed);
        assert_eq!(store.get(&id).unwrap().total_calls, 1);
        assert!(matches!(store.record_call(&id, "r").unwrap_err(), StoreError::Inactive(_)));
        assert_eq!(store.list_completed().unwrap().len(), 1);
    }

    #[test]
    fn score_lineage_tracks_trend_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = open(&dir);
            let id = store.admit(None).unwrap();
            store.record_score(&id, "architect", &fp("t"), 40.0).unwrap();
            store.record_score(&id, "architect", &fp("t"), 30.0).unwrap();
            let state = store.record_score(&id, "architect", &fp("t"), 20.0).unwrap();
            assert_eq!(state.attempts, 3);
            assert_eq!(state.trend, Trend::Declining);
            id
        };

        let store = open(&dir);
        let state = store.refinement_state(&id, "architect", &fp("t")).unwrap();
        assert_eq!(state.scores, vec![40.0, 30.0, 20.0]);
        assert_eq!(state.best_score(), Some(40.0));
        assert!(store.refinement_state(&id, "debugger", &fp("t")).is_none());
    }

    #[test]
    fn metrics_track_active_and_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsRecorder::new());
        let store = open(&dir).with_metrics(Arc::clone(&metrics));

        let root = store.admit(None).unwrap();
        let child = store.admit(Some(&root)).unwrap();
        assert_eq!(metrics.gauge_get(names::STORE_SESSIONS_ACTIVE, &[]), 2.0);

        let _ = store.admit(Some(&child));
        assert_eq!(
            metrics.counter_get(names::STORE_ADMISSION_REJECTED, &[("reason", "sub_agent_cannot_spawn")]),
            1
        );
    }

    #[test]
    fn concurrent_calls_never_overshoot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SessionStore::open(
                dir.path(),
                StoreLimits {
                    max_total_calls: 20,
                    ..limits()
                },
            )
            .unwrap(),
        );
        let root = store.admit(None).unwrap();
        let children: Vec<_> = (0..4).map(|_| store.admit(Some(&root)).unwrap()).collect();

        let handles: Vec<_> = children
            .into_iter()
            .map(|child| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || (0..10).filter(|_| store.record_call(&child, "w").is_ok()).count())
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(accepted, 20);
        assert_eq!(store.get(&root).unwrap().total_calls, 20);
    }

    #[test]
    fn completed_sessions_release_their_lineages() {
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<SessionId> = {
            let store = open(&dir);
            let ids = (0..50)
                .map(|i| {
                    let id = store.admit(None).unwrap();
                    store.record_score(&id, "architect", &fp(&format!("t{i}")), 60.0).unwrap();
                    store.complete(&id).unwrap();
                    id
                })
                .collect();
            assert!(store.list_active().is_empty());
            assert_eq!(store.lineage_count(), 0);
            ids
        };

        let store = open(&dir);
        assert_eq!(store.lineage_count(), 0);
        assert_eq!(fs::read_dir(dir.path().join("refinements")).unwrap().count(), 0);

        // history stays readable after archival
        let archived = store.archived_lineages(&ids[7]).unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].fingerprint, fp("t7"));
        assert_eq!(archived[0].scores, vec![60.0]);
    }

    #[test]
    fn expired_sessions_release_their_lineages() {
        let dir = tempfile::tempdir().unwrap();
        let (stale, swept, fresh) = {
            let store = open(&dir);
            let stale = store.admit(None).unwrap();
            let swept = store.admit(None).unwrap();
            let fresh = store.admit(None).unwrap();
            for id in [&stale, &swept, &fresh] {
                store.record_score(id, "architect", &fp("t"), 50.0).unwrap();
            }
            store.backdate(&swept, 120);
            assert_eq!(store.sweep(Duration::from_secs(60)).unwrap(), vec![swept.clone()]);
            assert_eq!(store.lineage_count(), 2);
            assert!(store.refinement_state(&swept, "architect", &fp("t")).is_none());
            store.backdate(&stale, 7200);
            (stale, swept, fresh)
        };

        // the stale session expires on load and its lineage goes with it
        let store = open(&dir);
        assert_eq!(store.lineage_count(), 1);
        assert!(store.refinement_state(&fresh, "architect", &fp("t")).is_some());
        assert!(store.refinement_state(&stale, "architect", &fp("t")).is_none());
        assert_eq!(store.archived_lineages(&stale).unwrap().len(), 1);
        assert_eq!(store.archived_lineages(&swept).unwrap().len(), 1);
    }

    #[test]
    fn scores_for_inactive_sessions_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = store.admit(None).unwrap();
        store.complete(&id).unwrap();

        let err = store.record_score(&id, "architect", &fp("t"), 70.0).unwrap_err();
        assert!(matches!(err, StoreError::Inactive(_)));
        assert_eq!(store.lineage_count(), 0);
    }

    #[test]
    fn failed_write_leaves_counters_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = store.admit(None).unwrap();
        store.record_call(&id, "debugger").unwrap();

        let active = dir.path().join("active");
        fs::remove_dir_all(&active).unwrap();
        assert!(store.record_call(&id, "debugger").is_err());
        assert!(store.record_refinement(&id, &fp("t")).is_err());

        let rec = store.get(&id).unwrap();
        assert_eq!(rec.total_calls, 1);
        assert_eq!(rec.per_role_calls["debugger"], 1);
        assert_eq!(rec.refinements_for(&fp("t")), 0);

        fs::create_dir_all(&active).unwrap();
        assert_eq!(store.record_call(&id, "debugger").unwrap(), 2);
        assert_eq!(store.record_refinement(&id, &fp("t")).unwrap(), 1);
    }

    #[test]
    fn failed_ancestor_write_rolls_back_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let root = store.admit(None).unwrap();
        let child = store.admit(Some(&root)).unwrap();

        // a directory in place of the root's file makes its rename fail
        let root_path = dir.path().join("active").join(format!("{root}.json"));
        fs::remove_file(&root_path).unwrap();
        fs::create_dir(&root_path).unwrap();
        fs::write(root_path.join("keep"), "x").unwrap();

        assert!(store.record_call(&child, "w").is_err());
        assert_eq!(store.get(&child).unwrap().total_calls, 0);
        assert_eq!(store.get(&root).unwrap().total_calls, 0);

        let child_path = dir.path().join("active").join(format!("{child}.json"));
        let on_disk: SessionRecord = persist::read_json(&child_path).unwrap();
        assert_eq!(on_disk.total_calls, 0);
    }
}
