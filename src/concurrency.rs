//! Per-scope concurrency admission over shared active-session sets.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::clock::Clock;
use crate::config::ConcurrencyConfig;
use crate::error::{CoordError, Result};
use crate::scripts;
use crate::store::CoordStore;

/// A concurrency ceiling scope. Each maps to one ordered set of
/// `(session_id, last_activity_ms)` pairs in the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Key(String),
    Provider(String),
    User(String),
}

impl Scope {
    pub(crate) fn segment(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Key(id) => format!("key:{id}"),
            Scope::Provider(id) => format!("provider:{id}"),
            Scope::User(id) => format!("user:{id}"),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segment())
    }
}

/// Outcome of one admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Pruned count after the check (unchanged when rejected).
    pub count: u64,
    /// True when this call inserted the session rather than refreshing it.
    pub newly_tracked: bool,
}

impl Admission {
    /// Store-unavailable default: admit, report nothing tracked. Limits are
    /// effectively disabled while the store is down.
    fn fail_open() -> Self {
        Self {
            admitted: true,
            count: 0,
            newly_tracked: false,
        }
    }
}

/// Outcome of a batch admission check across several scopes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchAdmission {
    /// Every scope admitted; one entry per requested scope, in order.
    Admitted(Vec<Admission>),
    /// Some scope was full. Nothing was written to any scope.
    Rejected { scope_index: usize, count: u64 },
}

#[derive(Clone)]
pub struct ConcurrencyTracker {
    store: CoordStore,
    config: ConcurrencyConfig,
    clock: Arc<dyn Clock>,
}

impl ConcurrencyTracker {
    pub fn new(store: CoordStore, config: ConcurrencyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    fn window_ms(&self) -> u64 {
        self.config.window_seconds * 1000
    }

    fn set_ttl_seconds(&self) -> u64 {
        // Fallback expiry slightly past the window so abandoned sets self-clean.
        self.config.window_seconds + 60
    }

    /// Atomic prune + membership check + limit check + upsert in one round
    /// trip. `limit == 0` disables the ceiling for this scope.
    pub async fn check_and_track(&self, scope: &Scope, session_id: &str, limit: u32) -> Admission {
        match self.try_check_and_track(scope, session_id, limit).await {
            Ok(admission) => admission,
            Err(err) => {
                warn!(scope = %scope, error = %err, "admission check failed open");
                Admission::fail_open()
            }
        }
    }

    async fn try_check_and_track(
        &self,
        scope: &Scope,
        session_id: &str,
        limit: u32,
    ) -> Result<Admission> {
        let mut conn = self.store.connection().await?;
        let key = self.store.key_active_sessions(&scope.segment());
        let reply: Vec<i64> = scripts::check_and_track()
            .key(key)
            .arg(session_id)
            .arg(limit)
            .arg(self.clock.now_epoch_ms())
            .arg(self.window_ms())
            .arg(self.set_ttl_seconds())
            .invoke_async(&mut conn)
            .await?;
        parse_admission(&reply)
    }

    /// Batch admission across several candidate scopes in one round trip.
    /// All-or-nothing: a single full scope rejects the whole batch with no
    /// writes, so candidate fan-out cannot leak partial admissions.
    pub async fn check_and_track_many(
        &self,
        checks: &[(Scope, u32)],
        session_id: &str,
    ) -> BatchAdmission {
        if checks.is_empty() {
            return BatchAdmission::Admitted(Vec::new());
        }
        match self.try_check_and_track_many(checks, session_id).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "batch admission check failed open");
                BatchAdmission::Admitted(vec![Admission::fail_open(); checks.len()])
            }
        }
    }

    async fn try_check_and_track_many(
        &self,
        checks: &[(Scope, u32)],
        session_id: &str,
    ) -> Result<BatchAdmission> {
        let mut conn = self.store.connection().await?;
        let script = scripts::check_and_track_many();
        let mut invocation = script.prepare_invoke();
        for (scope, _) in checks {
            invocation.key(self.store.key_active_sessions(&scope.segment()));
        }
        invocation
            .arg(session_id)
            .arg(self.clock.now_epoch_ms())
            .arg(self.window_ms())
            .arg(self.set_ttl_seconds());
        for (_, limit) in checks {
            invocation.arg(*limit);
        }
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        parse_batch_admission(&reply, checks.len())
    }

    /// Pruned count for one scope, with a secondary existence check: a set
    /// member whose session record no longer exists is dropped from the set
    /// and not counted.
    pub async fn active_count(&self, scope: &Scope) -> u64 {
        match self.try_active_count(scope).await {
            Ok(count) => count,
            Err(err) => {
                warn!(scope = %scope, error = %err, "active count read failed open");
                0
            }
        }
    }

    pub async fn active_counts(&self, scopes: &[Scope]) -> Vec<u64> {
        let mut out = Vec::with_capacity(scopes.len());
        for scope in scopes {
            out.push(self.active_count(scope).await);
        }
        out
    }

    async fn try_active_count(&self, scope: &Scope) -> Result<u64> {
        match self.read_validated_count(scope).await {
            Ok(count) => Ok(count),
            Err(err) if is_wrong_type(&err) => {
                // Schema drift: the key holds some other structure. Drop it
                // and report empty; the next write recreates it correctly.
                warn!(scope = %scope, "active-session key had wrong type, deleting");
                let mut conn = self.store.connection().await?;
                let key = self.store.key_active_sessions(&scope.segment());
                let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    async fn read_validated_count(&self, scope: &Scope) -> Result<u64> {
        let mut conn = self.store.connection().await?;
        let key = self.store.key_active_sessions(&scope.segment());
        let now_ms = self.clock.now_epoch_ms();
        let horizon = now_ms.saturating_sub(self.window_ms());

        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(horizon)
            .query_async(&mut conn)
            .await?;
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut count = 0u64;
        for session_id in members {
            let exists: i64 = redis::cmd("EXISTS")
                .arg(self.store.key_session_info(&session_id))
                .query_async(&mut conn)
                .await?;
            if exists == 1 {
                count += 1;
            } else {
                // Stale entry: the session expired but its set member did not.
                let _: i64 = redis::cmd("ZREM")
                    .arg(&key)
                    .arg(&session_id)
                    .query_async(&mut conn)
                    .await?;
            }
        }
        Ok(count)
    }

    /// Remove a session from a scope set (session termination path).
    pub async fn untrack(&self, scope: &Scope, session_id: &str) {
        if let Err(err) = self.try_untrack(scope, session_id).await {
            warn!(scope = %scope, error = %err, "untrack failed");
        }
    }

    async fn try_untrack(&self, scope: &Scope, session_id: &str) -> Result<()> {
        let mut conn = self.store.connection().await?;
        let key = self.store.key_active_sessions(&scope.segment());
        let _: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(session_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn parse_admission(reply: &[i64]) -> Result<Admission> {
    match reply {
        [admitted, newly_tracked, count] => Ok(Admission {
            admitted: *admitted == 1,
            count: (*count).max(0) as u64,
            newly_tracked: *newly_tracked == 1,
        }),
        other => Err(CoordError::ScriptResponse(format!(
            "check_and_track returned {other:?}"
        ))),
    }
}

fn parse_batch_admission(reply: &[i64], scope_count: usize) -> Result<BatchAdmission> {
    match reply.first() {
        Some(1) => {
            let pairs = &reply[1..];
            if pairs.len() != scope_count * 2 {
                return Err(CoordError::ScriptResponse(format!(
                    "batch admission returned {} values for {scope_count} scopes",
                    pairs.len()
                )));
            }
            let admissions = pairs
                .chunks_exact(2)
                .map(|chunk| Admission {
                    admitted: true,
                    count: chunk[0].max(0) as u64,
                    newly_tracked: chunk[1] == 1,
                })
                .collect();
            Ok(BatchAdmission::Admitted(admissions))
        }
        Some(0) => match reply {
            [_, index, count] => Ok(BatchAdmission::Rejected {
                // Lua indices are 1-based.
                scope_index: (*index).max(1) as usize - 1,
                count: (*count).max(0) as u64,
            }),
            other => Err(CoordError::ScriptResponse(format!(
                "batch rejection returned {other:?}"
            ))),
        },
        other => Err(CoordError::ScriptResponse(format!(
            "batch admission returned {other:?}"
        ))),
    }
}

fn is_wrong_type(err: &CoordError) -> bool {
    match err {
        CoordError::Redis(redis_err) => redis_err.code() == Some("WRONGTYPE"),
        _ => false,
    }
}
