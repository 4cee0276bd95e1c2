use crate::error::Result;

/// Thin client for the shared coordination store.
///
/// Every cross-replica decision in this crate goes through one of these.
/// Callers are expected to tolerate its absence: the public component APIs
/// catch connection errors and degrade to safe defaults instead of failing
/// the request path.
#[derive(Clone, Debug)]
pub struct CoordStore {
    client: redis::Client,
    prefix: String,
}

impl CoordStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "crossbar".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: Option<String> = redis::cmd("GET")
            .arg(format!("{}:__ping__", self.prefix))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub(crate) fn key_session_info(&self, session_id: &str) -> String {
        format!("{}:session:{session_id}:info", self.prefix)
    }

    pub(crate) fn key_session_provider(&self, session_id: &str) -> String {
        format!("{}:session:{session_id}:provider", self.prefix)
    }

    pub(crate) fn key_session_seq(&self, session_id: &str) -> String {
        format!("{}:session:{session_id}:seq", self.prefix)
    }

    pub(crate) fn key_session_usage(&self, session_id: &str) -> String {
        format!("{}:session:{session_id}:usage", self.prefix)
    }

    pub(crate) fn key_session_messages(&self, session_id: &str) -> String {
        format!("{}:session:{session_id}:messages", self.prefix)
    }

    pub(crate) fn key_session_hash(&self, content_hash: &str) -> String {
        format!("{}:session_hash:{content_hash}", self.prefix)
    }

    pub(crate) fn key_active_sessions(&self, scope: &str) -> String {
        format!("{}:{scope}:active_sessions", self.prefix)
    }

    pub(crate) fn key_circuit(&self, provider_id: &str) -> String {
        format!("{}:circuit:{provider_id}", self.prefix)
    }

    pub(crate) fn key_vendor_type_circuit(&self, vendor_id: &str, provider_type: &str) -> String {
        format!("{}:vendor_type_circuit:{vendor_id}:{provider_type}", self.prefix)
    }

    pub(crate) fn key_cost(&self, scope_id: &str, window_suffix: &str) -> String {
        format!("{}:cost:{scope_id}:{window_suffix}", self.prefix)
    }

    pub(crate) fn key_lock(&self, job: &str) -> String {
        format!("{}:locks:{job}", self.prefix)
    }

    pub(crate) fn key_probe_history(&self, provider_id: &str) -> String {
        format!("{}:probe_history:{provider_id}", self.prefix)
    }
}
