//! Session identity derivation and session-to-provider affinity.
//!
//! A session is a logical client conversation. Keeping its requests on the
//! same upstream provider preserves provider-side context and prompt-cache
//! state, so rebinding is deliberately sticky: a working, highest-priority
//! binding is kept even when a retry happened to succeed elsewhere.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::circuit::CircuitStore;
use crate::clock::Clock;
use crate::concurrency::{ConcurrencyTracker, Scope};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::store::CoordStore;
use crate::util::{hex_encode, random_hex};

/// Provider configuration record, read-only from this crate's perspective.
/// Supplied by the configuration store of the surrounding gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub provider_id: String,
    /// Lower value = higher priority.
    pub priority: u32,
    #[serde(default)]
    pub weight: u32,
    #[serde(default = "default_cost_multiplier")]
    pub cost_multiplier: f64,
    #[serde(default)]
    pub max_concurrency: u32,
    pub vendor_id: String,
    pub provider_type: String,
    pub endpoint_url: String,
}

fn default_cost_multiplier() -> f64 {
    1.0
}

pub trait ProviderDirectory: Send + Sync {
    fn provider(&self, provider_id: &str) -> Option<ProviderRecord>;
}

/// Signals extracted from one inbound request by the transport layer.
#[derive(Clone, Debug, Default)]
pub struct RequestSignals {
    /// Dedicated session-id metadata field, when the client sent one.
    pub session_id: Option<String>,
    /// Free-form client metadata that may embed `<client>_session_<id>`.
    pub metadata_user: Option<String>,
    pub message_count: u32,
    /// Text content of the leading messages, for the hash fallback.
    pub messages: Vec<String>,
    pub key_id: Option<String>,
    pub user_id: Option<String>,
}

/// How the session identity was obtained. Later variants are progressively
/// less reliable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentitySource {
    /// Stable identifier supplied in request metadata.
    ClientMetadata,
    /// Metadata identified a session, but it had a concurrent in-flight
    /// request and the conversation is short, so it is treated as an independent
    /// call and given a fresh identity.
    MintedFresh,
    /// Looked up or created via the content-hash mapping. Collisions on
    /// similar openings are possible; this is a lossy downgrade path.
    ContentHash,
    /// Nothing usable in the request; generated randomly.
    Random,
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub session_id: String,
    /// Monotonic per-session request sequence.
    pub sequence: u64,
    pub source: IdentitySource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at_ms: u64,
    pub last_seen_ms: u64,
    pub status: SessionStatus,
    pub message_count: u32,
}

/// Why a binding did or did not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingReason {
    FirstSuccess,
    ConcurrentBindingExists,
    FailoverSuccess,
    PriorityUpgrade,
    CircuitOpenFallback,
    KeepHealthyHigherPriority,
    Error,
}

impl BindingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingReason::FirstSuccess => "first_success",
            BindingReason::ConcurrentBindingExists => "concurrent_binding_exists",
            BindingReason::FailoverSuccess => "failover_success",
            BindingReason::PriorityUpgrade => "priority_upgrade",
            BindingReason::CircuitOpenFallback => "circuit_open_fallback",
            BindingReason::KeepHealthyHigherPriority => "keep_healthy_higher_priority",
            BindingReason::Error => "error",
        }
    }
}

/// Tagged outcome of a binding update; call sites match on the variant
/// instead of inspecting optional fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingOutcome {
    Updated(BindingReason),
    Unchanged(BindingReason),
}

impl BindingOutcome {
    pub fn updated(&self) -> bool {
        matches!(self, BindingOutcome::Updated(_))
    }

    pub fn reason(&self) -> BindingReason {
        match self {
            BindingOutcome::Updated(reason) | BindingOutcome::Unchanged(reason) => *reason,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RebindDecision {
    Migrate(BindingReason),
    Keep,
}

/// Pure re-binding policy for a retry that succeeded without failover.
/// A missing directory record for the bound provider counts as lowest
/// priority, so any configured provider supersedes it.
pub(crate) fn rebind_decision(
    bound_priority: Option<u32>,
    bound_circuit_open: bool,
    new_priority: u32,
) -> RebindDecision {
    if new_priority < bound_priority.unwrap_or(u32::MAX) {
        return RebindDecision::Migrate(BindingReason::PriorityUpgrade);
    }
    if bound_circuit_open {
        return RebindDecision::Migrate(BindingReason::CircuitOpenFallback);
    }
    RebindDecision::Keep
}

pub struct SessionBinder {
    store: CoordStore,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    directory: Arc<dyn ProviderDirectory>,
    circuits: CircuitStore,
    concurrency: ConcurrencyTracker,
}

impl SessionBinder {
    pub fn new(
        store: CoordStore,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn ProviderDirectory>,
        circuits: CircuitStore,
        concurrency: ConcurrencyTracker,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            directory,
            circuits,
            concurrency,
        }
    }

    fn ttl_seconds(&self) -> u64 {
        self.config.ttl_seconds
    }

    /// Derive an identity for the request and upsert the session record.
    /// Returns the session id, its new request sequence number and how the
    /// identity was obtained.
    pub async fn get_or_create_session(&self, signals: &RequestSignals) -> SessionHandle {
        let (session_id, source) = self.derive_session_id(signals).await;
        let sequence = match self.upsert_session(&session_id, signals).await {
            Ok(sequence) => sequence,
            Err(err) => {
                warn!(session_id, error = %err, "session record write dropped");
                0
            }
        };
        SessionHandle {
            session_id,
            sequence,
            source,
        }
    }

    /// Ordered identity derivation: metadata id (with the short-conversation
    /// concurrency guard), then content hash, then a fresh random id.
    pub async fn derive_session_id(&self, signals: &RequestSignals) -> (String, IdentitySource) {
        if let Some(candidate) = metadata_session_id(signals) {
            if signals.message_count <= self.config.short_message_threshold {
                match self.load_info(&candidate).await {
                    Ok(Some(info)) if info.status == SessionStatus::InProgress => {
                        // A short prompt with a concurrent sibling is almost
                        // certainly an independent call, not a continuation.
                        let minted = fresh_session_id();
                        debug!(
                            candidate,
                            minted, "short conversation has in-flight sibling, minting new session"
                        );
                        return (minted, IdentitySource::MintedFresh);
                    }
                    Ok(_) => return (candidate, IdentitySource::ClientMetadata),
                    Err(err) => {
                        warn!(candidate, error = %err, "session lookup failed, reusing metadata id");
                        return (candidate, IdentitySource::ClientMetadata);
                    }
                }
            }
            return (candidate, IdentitySource::ClientMetadata);
        }

        if !signals.messages.is_empty() {
            let hash = content_hash(&signals.messages, self.config.hash_message_count);
            match self.lookup_or_create_hash_mapping(&hash).await {
                Ok(session_id) => {
                    debug!(hash, session_id, "session identity downgraded to content hash");
                    return (session_id, IdentitySource::ContentHash);
                }
                Err(err) => {
                    warn!(error = %err, "content-hash mapping unavailable, generating random id");
                }
            }
        }

        (fresh_session_id(), IdentitySource::Random)
    }

    async fn lookup_or_create_hash_mapping(&self, hash: &str) -> Result<String> {
        let mut conn = self.store.connection().await?;
        let key = self.store.key_session_hash(hash);

        let existing: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        if let Some(session_id) = existing {
            let _: i64 = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(self.ttl_seconds())
                .query_async(&mut conn)
                .await?;
            return Ok(session_id);
        }

        let minted = fresh_session_id();
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&minted)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds())
            .query_async(&mut conn)
            .await?;
        if set.is_some() {
            return Ok(minted);
        }
        // Lost the race: another replica created the mapping first.
        let winner: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        Ok(winner.unwrap_or(minted))
    }

    async fn upsert_session(&self, session_id: &str, signals: &RequestSignals) -> Result<u64> {
        let now_ms = self.clock.now_epoch_ms();
        let existing = self.load_info(session_id).await?;
        let info = SessionInfo {
            session_id: session_id.to_string(),
            key_id: signals
                .key_id
                .clone()
                .or_else(|| existing.as_ref().and_then(|info| info.key_id.clone())),
            user_id: signals
                .user_id
                .clone()
                .or_else(|| existing.as_ref().and_then(|info| info.user_id.clone())),
            created_at_ms: existing
                .as_ref()
                .map(|info| info.created_at_ms)
                .unwrap_or(now_ms),
            last_seen_ms: now_ms,
            status: SessionStatus::InProgress,
            message_count: signals.message_count,
        };

        let mut conn = self.store.connection().await?;
        let seq_key = self.store.key_session_seq(session_id);
        let _: () = redis::cmd("SET")
            .arg(self.store.key_session_info(session_id))
            .arg(serde_json::to_string(&info)?)
            .arg("EX")
            .arg(self.ttl_seconds())
            .query_async(&mut conn)
            .await?;
        let sequence: i64 = redis::cmd("INCR").arg(&seq_key).query_async(&mut conn).await?;
        let _: i64 = redis::cmd("EXPIRE")
            .arg(&seq_key)
            .arg(self.ttl_seconds())
            .query_async(&mut conn)
            .await?;
        Ok(sequence.max(0) as u64)
    }

    /// Plain first-writer-wins bind. Returns whether this call created the
    /// binding.
    pub async fn bind_session_to_provider(&self, session_id: &str, provider_id: &str) -> bool {
        match self.try_bind_if_absent(session_id, provider_id).await {
            Ok(bound) => bound,
            Err(err) => {
                warn!(session_id, provider_id, error = %err, "binding write dropped");
                false
            }
        }
    }

    /// Race-tolerant binding re-evaluation after a request attempt
    /// succeeded on `new_provider_id`.
    pub async fn update_binding(
        &self,
        session_id: &str,
        new_provider_id: &str,
        new_priority: u32,
        is_first_attempt: bool,
        is_failover_success: bool,
    ) -> BindingOutcome {
        match self
            .try_update_binding(
                session_id,
                new_provider_id,
                new_priority,
                is_first_attempt,
                is_failover_success,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(session_id, new_provider_id, error = %err, "binding update degraded");
                BindingOutcome::Unchanged(BindingReason::Error)
            }
        }
    }

    async fn try_update_binding(
        &self,
        session_id: &str,
        new_provider_id: &str,
        new_priority: u32,
        is_first_attempt: bool,
        is_failover_success: bool,
    ) -> Result<BindingOutcome> {
        if is_first_attempt {
            return self.bind_first_writer(session_id, new_provider_id).await;
        }

        if is_failover_success {
            // The previously bound provider just failed and this one worked.
            // Adopt it unconditionally to minimize future cache misses.
            self.overwrite_binding(session_id, new_provider_id).await?;
            return Ok(BindingOutcome::Updated(BindingReason::FailoverSuccess));
        }

        let current = self.read_binding(session_id).await?;
        let Some(current) = current else {
            return self.bind_first_writer(session_id, new_provider_id).await;
        };

        if current == new_provider_id {
            self.refresh_session_ttls(session_id).await?;
            return Ok(BindingOutcome::Unchanged(
                BindingReason::KeepHealthyHigherPriority,
            ));
        }

        let bound_priority = self
            .directory
            .provider(&current)
            .map(|record| record.priority);
        let bound_circuit_open = self.circuits.is_open(&current).await;

        match rebind_decision(bound_priority, bound_circuit_open, new_priority) {
            RebindDecision::Migrate(reason) => {
                self.overwrite_binding(session_id, new_provider_id).await?;
                Ok(BindingOutcome::Updated(reason))
            }
            RebindDecision::Keep => {
                self.refresh_session_ttls(session_id).await?;
                Ok(BindingOutcome::Unchanged(
                    BindingReason::KeepHealthyHigherPriority,
                ))
            }
        }
    }

    async fn bind_first_writer(
        &self,
        session_id: &str,
        provider_id: &str,
    ) -> Result<BindingOutcome> {
        if self.try_bind_if_absent(session_id, provider_id).await? {
            Ok(BindingOutcome::Updated(BindingReason::FirstSuccess))
        } else {
            self.refresh_session_ttls(session_id).await?;
            Ok(BindingOutcome::Unchanged(
                BindingReason::ConcurrentBindingExists,
            ))
        }
    }

    async fn try_bind_if_absent(&self, session_id: &str, provider_id: &str) -> Result<bool> {
        let mut conn = self.store.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.store.key_session_provider(session_id))
            .arg(provider_id)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds())
            .query_async(&mut conn)
            .await?;
        self.refresh_info_ttl(&mut conn, session_id).await?;
        Ok(reply.is_some())
    }

    async fn overwrite_binding(&self, session_id: &str, provider_id: &str) -> Result<()> {
        let mut conn = self.store.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.store.key_session_provider(session_id))
            .arg(provider_id)
            .arg("EX")
            .arg(self.ttl_seconds())
            .query_async(&mut conn)
            .await?;
        self.refresh_info_ttl(&mut conn, session_id).await?;
        Ok(())
    }

    async fn read_binding(&self, session_id: &str) -> Result<Option<String>> {
        let mut conn = self.store.connection().await?;
        let current: Option<String> = redis::cmd("GET")
            .arg(self.store.key_session_provider(session_id))
            .query_async(&mut conn)
            .await?;
        Ok(current)
    }

    /// Currently bound provider for the session, refreshing the sliding TTL
    /// on the way out.
    pub async fn get_session_provider(&self, session_id: &str) -> Option<String> {
        match self.try_get_session_provider(session_id).await {
            Ok(provider) => provider,
            Err(err) => {
                warn!(session_id, error = %err, "binding read failed open");
                None
            }
        }
    }

    async fn try_get_session_provider(&self, session_id: &str) -> Result<Option<String>> {
        let provider = self.read_binding(session_id).await?;
        if provider.is_some() {
            self.refresh_session_ttls(session_id).await?;
        }
        Ok(provider)
    }

    async fn refresh_session_ttls(&self, session_id: &str) -> Result<()> {
        let mut conn = self.store.connection().await?;
        let ttl = self.ttl_seconds();
        let _: () = redis::pipe()
            .cmd("EXPIRE")
            .arg(self.store.key_session_provider(session_id))
            .arg(ttl)
            .ignore()
            .cmd("EXPIRE")
            .arg(self.store.key_session_info(session_id))
            .arg(ttl)
            .ignore()
            .cmd("EXPIRE")
            .arg(self.store.key_session_seq(session_id))
            .arg(ttl)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn refresh_info_ttl(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        session_id: &str,
    ) -> Result<()> {
        let _: i64 = redis::cmd("EXPIRE")
            .arg(self.store.key_session_info(session_id))
            .arg(self.ttl_seconds())
            .query_async(conn)
            .await?;
        Ok(())
    }

    /// Mark the session's lifecycle status without touching the binding.
    pub async fn complete_session(&self, session_id: &str, status: SessionStatus) {
        if let Err(err) = self.try_complete_session(session_id, status).await {
            warn!(session_id, error = %err, "session status write dropped");
        }
    }

    async fn try_complete_session(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let Some(mut info) = self.load_info(session_id).await? else {
            return Ok(());
        };
        info.status = status;
        info.last_seen_ms = self.clock.now_epoch_ms();
        let mut conn = self.store.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.store.key_session_info(session_id))
            .arg(serde_json::to_string(&info)?)
            .arg("EX")
            .arg(self.ttl_seconds())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Administrative kill switch: drop the session's keys and remove it
    /// from every concurrency scope its record names. Returns whether the
    /// session existed.
    pub async fn terminate_session(&self, session_id: &str) -> bool {
        match self.try_terminate_session(session_id).await {
            Ok(found) => found,
            Err(err) => {
                warn!(session_id, error = %err, "session termination failed");
                false
            }
        }
    }

    pub async fn terminate_sessions_batch(&self, session_ids: &[String]) -> usize {
        let mut terminated = 0;
        for session_id in session_ids {
            if self.terminate_session(session_id).await {
                terminated += 1;
            }
        }
        terminated
    }

    async fn try_terminate_session(&self, session_id: &str) -> Result<bool> {
        let info = self.load_info(session_id).await?;
        let provider = self.read_binding(session_id).await?;

        let mut conn = self.store.connection().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.store.key_session_info(session_id))
            .arg(self.store.key_session_provider(session_id))
            .arg(self.store.key_session_seq(session_id))
            .query_async(&mut conn)
            .await?;

        let mut scopes = vec![Scope::Global];
        if let Some(info) = &info {
            if let Some(key_id) = &info.key_id {
                scopes.push(Scope::Key(key_id.clone()));
            }
            if let Some(user_id) = &info.user_id {
                scopes.push(Scope::User(user_id.clone()));
            }
        }
        if let Some(provider_id) = provider {
            scopes.push(Scope::Provider(provider_id));
        }
        for scope in &scopes {
            self.concurrency.untrack(scope, session_id).await;
        }

        Ok(deleted > 0)
    }

    pub async fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        match self.load_info(session_id).await {
            Ok(info) => info,
            Err(err) => {
                warn!(session_id, error = %err, "session info read failed open");
                None
            }
        }
    }

    async fn load_info(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let mut conn = self.store.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.store.key_session_info(session_id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

fn metadata_session_id(signals: &RequestSignals) -> Option<String> {
    if let Some(session_id) = &signals.session_id {
        if !session_id.is_empty() {
            return Some(session_id.clone());
        }
    }
    signals
        .metadata_user
        .as_ref()
        .filter(|value| value.contains("_session_"))
        .cloned()
}

fn fresh_session_id() -> String {
    format!("sess_{}", random_hex(16))
}

/// SHA-256 over the leading messages' text. Similar openings collide; the
/// mapping stays lossy on purpose.
fn content_hash(messages: &[String], take: usize) -> String {
    let mut hasher = Sha256::new();
    for message in messages.iter().take(take.max(1)) {
        hasher.update(message.as_bytes());
        hasher.update([0u8]);
    }
    hex_encode(&hasher.finalize())
}
