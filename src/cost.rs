//! Rolling spend windows per key or provider.
//!
//! Costs are integer USD-micros. Each entry is a sorted-set member scored by
//! its timestamp; the member string carries the timestamp, an optional
//! request id and the cost, so re-tracking the same request id at the same
//! timestamp is idempotent and summation just parses the last segment.

use std::sync::Arc;

use tracing::warn;

use crate::clock::Clock;
use crate::error::Result;
use crate::scripts;
use crate::store::CoordStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CostWindow {
    FiveHour,
    Daily,
}

impl CostWindow {
    pub fn suffix(&self) -> &'static str {
        match self {
            CostWindow::FiveHour => "5h",
            CostWindow::Daily => "daily",
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            CostWindow::FiveHour => 5 * 60 * 60 * 1000,
            CostWindow::Daily => 24 * 60 * 60 * 1000,
        }
    }

    /// Fallback key expiry, one hour past the window so abandoned scopes
    /// self-clean.
    fn ttl_seconds(&self) -> u64 {
        self.duration_ms() / 1000 + 3600
    }
}

pub(crate) fn cost_member(now_ms: u64, request_id: Option<&str>, usd_micros: u64) -> String {
    match request_id {
        Some(request_id) => format!("{now_ms}:{request_id}:{usd_micros}"),
        None => format!("{now_ms}:{usd_micros}"),
    }
}

#[derive(Clone)]
pub struct CostTracker {
    store: CoordStore,
    clock: Arc<dyn Clock>,
}

impl CostTracker {
    pub fn new(store: CoordStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append a cost entry and return the new window total. Store failure
    /// drops the entry and reports zero; spend enforcement fails open.
    pub async fn track_cost(
        &self,
        scope_id: &str,
        window: CostWindow,
        usd_micros: u64,
        request_id: Option<&str>,
    ) -> u64 {
        match self
            .try_track_cost(scope_id, window, usd_micros, request_id)
            .await
        {
            Ok(total) => total,
            Err(err) => {
                warn!(scope_id, window = window.suffix(), error = %err, "cost tracking dropped");
                0
            }
        }
    }

    async fn try_track_cost(
        &self,
        scope_id: &str,
        window: CostWindow,
        usd_micros: u64,
        request_id: Option<&str>,
    ) -> Result<u64> {
        let mut conn = self.store.connection().await?;
        let now_ms = self.clock.now_epoch_ms();
        let total: i64 = scripts::track_cost()
            .key(self.store.key_cost(scope_id, window.suffix()))
            .arg(cost_member(now_ms, request_id, usd_micros))
            .arg(now_ms)
            .arg(window.duration_ms())
            .arg(window.ttl_seconds())
            .invoke_async(&mut conn)
            .await?;
        Ok(total.max(0) as u64)
    }

    /// Current window total without appending; used for limit checks before
    /// admitting a request. Store failure reports zero (limit disabled).
    pub async fn cost_in_window(&self, scope_id: &str, window: CostWindow) -> u64 {
        match self.try_cost_in_window(scope_id, window).await {
            Ok(total) => total,
            Err(err) => {
                warn!(scope_id, window = window.suffix(), error = %err, "cost read failed open");
                0
            }
        }
    }

    async fn try_cost_in_window(&self, scope_id: &str, window: CostWindow) -> Result<u64> {
        let mut conn = self.store.connection().await?;
        let now_ms = self.clock.now_epoch_ms();
        let total: i64 = scripts::get_cost()
            .key(self.store.key_cost(scope_id, window.suffix()))
            .arg(now_ms)
            .arg(window.duration_ms())
            .arg(window.ttl_seconds())
            .invoke_async(&mut conn)
            .await?;
        Ok(total.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_embeds_cost_as_last_segment() {
        assert_eq!(cost_member(1_000, None, 250_000), "1000:250000");
        assert_eq!(
            cost_member(1_000, Some("req-7"), 250_000),
            "1000:req-7:250000"
        );
    }

    #[test]
    fn windows_have_expected_spans() {
        assert_eq!(CostWindow::FiveHour.duration_ms(), 18_000_000);
        assert_eq!(CostWindow::Daily.duration_ms(), 86_400_000);
        assert_eq!(CostWindow::FiveHour.suffix(), "5h");
        assert_eq!(CostWindow::Daily.suffix(), "daily");
    }
}
