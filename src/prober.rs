//! Leader-gated endpoint health probing.
//!
//! One replica at a time runs the probe cycle, elected through the leader
//! lock. Leadership loss is detected by the renewal loop and propagated as a
//! cooperative stop flag: workers finish the probe they are on and stop
//! pulling new ones, nothing is interrupted mid-flight.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit::CircuitStore;
use crate::clock::Clock;
use crate::config::ProberConfig;
use crate::error::Result;
use crate::lock::{LeaderLock, Lease};
use crate::store::CoordStore;
use crate::util::{rand_u64, shuffle};

const PROBER_JOB: &str = "endpoint_prober";
const CLEANUP_JOB: &str = "probe_history_cleanup";

/// One probeable provider endpoint, as configured by the surrounding
/// gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeEndpoint {
    pub provider_id: String,
    pub vendor_id: String,
    pub provider_type: String,
    pub url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    Timeout,
    InvalidUrl,
    NetworkError,
    #[serde(rename = "http_5xx")]
    Http5xx,
}

/// Immutable outcome of one health check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ProbeErrorKind>,
}

impl ProbeResult {
    fn from_status(status: u16, latency_ms: u64) -> Self {
        if status >= 500 {
            Self {
                ok: false,
                status_code: Some(status),
                latency_ms: Some(latency_ms),
                error_type: Some(ProbeErrorKind::Http5xx),
            }
        } else {
            Self {
                ok: true,
                status_code: Some(status),
                latency_ms: Some(latency_ms),
                error_type: None,
            }
        }
    }

    fn from_transport(err: &reqwest::Error, latency_ms: u64) -> Self {
        let kind = if err.is_timeout() {
            ProbeErrorKind::Timeout
        } else {
            ProbeErrorKind::NetworkError
        };
        Self {
            ok: false,
            status_code: None,
            latency_ms: Some(latency_ms),
            error_type: Some(kind),
        }
    }

    fn invalid_url() -> Self {
        Self {
            ok: false,
            status_code: None,
            latency_ms: None,
            error_type: Some(ProbeErrorKind::InvalidUrl),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeHistoryEntry {
    pub ts_ms: u64,
    pub result: ProbeResult,
}

/// Probe one endpoint: HEAD, falling back to GET only when HEAD was
/// inconclusive (no status code at all). Any status below 500 counts as
/// healthy; auth-walled endpoints commonly answer 401/404 here.
pub async fn probe_endpoint(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> ProbeResult {
    if reqwest::Url::parse(url).is_err() {
        return ProbeResult::invalid_url();
    }

    let started = Instant::now();
    let head = http.head(url).timeout(timeout).send().await;
    match head {
        Ok(response) => {
            ProbeResult::from_status(response.status().as_u16(), elapsed_ms(started))
        }
        Err(err) if err.status().is_some() => {
            // A status made it back; HEAD was conclusive.
            ProbeResult::from_status(
                err.status().map(|status| status.as_u16()).unwrap_or(0),
                elapsed_ms(started),
            )
        }
        Err(_) => {
            let retry_started = Instant::now();
            match http.get(url).timeout(timeout).send().await {
                Ok(response) => {
                    ProbeResult::from_status(response.status().as_u16(), elapsed_ms(retry_started))
                }
                Err(err) => ProbeResult::from_transport(&err, elapsed_ms(retry_started)),
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Run a bounded worker pool over the endpoint list. Workers observe the
/// stop flag between probes only: flipping it mid-batch lets in-flight
/// probes finish while no new ones start.
pub async fn run_probe_pool(
    http: &reqwest::Client,
    endpoints: Vec<ProbeEndpoint>,
    timeout: Duration,
    concurrency: usize,
    stop: Arc<AtomicBool>,
) -> Vec<(ProbeEndpoint, ProbeResult)> {
    let queue = Arc::new(Mutex::new(VecDeque::from(endpoints)));
    let results = Arc::new(Mutex::new(Vec::new()));

    let workers: Vec<JoinHandle<()>> = (0..concurrency.max(1))
        .map(|_| {
            let http = http.clone();
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                loop {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = queue.lock().await.pop_front();
                    let Some(endpoint) = next else {
                        break;
                    };
                    let result = probe_endpoint(&http, &endpoint.url, timeout).await;
                    results.lock().await.push((endpoint, result));
                }
            })
        })
        .collect();
    join_all(workers).await;

    let mut results = results.lock().await;
    results.drain(..).collect()
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub leader: bool,
    pub cycles_completed: u64,
    pub last_cycle_ms: u64,
    pub probes_ok: u64,
    pub probes_failed: u64,
}

struct ProberInner {
    store: CoordStore,
    lock: LeaderLock,
    circuits: CircuitStore,
    endpoints: Vec<ProbeEndpoint>,
    config: ProberConfig,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    stop: AtomicBool,
    running: AtomicBool,
    leading: AtomicBool,
    cycles_completed: AtomicU64,
    last_cycle_ms: AtomicU64,
    probes_ok: AtomicU64,
    probes_failed: AtomicU64,
}

/// The singleton endpoint prober plus its history-cleanup companion job.
pub struct ProbeScheduler {
    inner: Arc<ProberInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProbeScheduler {
    pub fn new(
        store: CoordStore,
        lock: LeaderLock,
        circuits: CircuitStore,
        endpoints: Vec<ProbeEndpoint>,
        config: ProberConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_seconds.max(1) * 2))
            .build()?;
        Ok(Self {
            inner: Arc::new(ProberInner {
                store,
                lock,
                circuits,
                endpoints,
                config,
                clock,
                http,
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                leading: AtomicBool::new(false),
                cycles_completed: AtomicU64::new(0),
                last_cycle_ms: AtomicU64::new(0),
                probes_ok: AtomicU64::new(0),
                probes_failed: AtomicU64::new(0),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        info!(
            endpoints = self.inner.endpoints.len(),
            interval_seconds = self.inner.config.interval_seconds,
            "probe scheduler starting"
        );
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(probe_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(cleanup_loop(Arc::clone(&self.inner))));
    }

    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.stop.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("probe scheduler stopped");
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            leader: self.inner.leading.load(Ordering::SeqCst),
            cycles_completed: self.inner.cycles_completed.load(Ordering::SeqCst),
            last_cycle_ms: self.inner.last_cycle_ms.load(Ordering::SeqCst),
            probes_ok: self.inner.probes_ok.load(Ordering::SeqCst),
            probes_failed: self.inner.probes_failed.load(Ordering::SeqCst),
        }
    }

    /// Newest-first probe history for one provider, for dashboards.
    pub async fn recent_history(&self, provider_id: &str, limit: usize) -> Vec<ProbeHistoryEntry> {
        match read_history(&self.inner.store, provider_id, limit).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(provider_id, error = %err, "probe history read failed open");
                Vec::new()
            }
        }
    }
}

async fn probe_loop(inner: Arc<ProberInner>) {
    let interval = Duration::from_secs(inner.config.interval_seconds.max(1));
    loop {
        if inner.stop.load(Ordering::SeqCst) {
            break;
        }
        let lease_ttl_ms = inner.config.lease_ttl_seconds.max(1) * 1000;
        if let Some(lease) = inner.lock.acquire(PROBER_JOB, lease_ttl_ms).await {
            inner.leading.store(true, Ordering::SeqCst);
            run_cycle(&inner, lease).await;
            inner.leading.store(false, Ordering::SeqCst);
        }
        if sleep_with_stop(&inner.stop, interval).await {
            break;
        }
    }
}

async fn run_cycle(inner: &Arc<ProberInner>, lease: Lease) {
    let cycle_stop = Arc::new(AtomicBool::new(false));
    let cycle_done = Arc::new(AtomicBool::new(false));
    let renewal = tokio::spawn(renewal_loop(
        Arc::clone(inner),
        lease.clone(),
        Arc::clone(&cycle_stop),
        Arc::clone(&cycle_done),
    ));

    // Replicas that raced into leadership near-simultaneously desynchronize
    // here before touching the endpoints.
    let jitter = Duration::from_millis(rand_u64() % inner.config.jitter_max_ms.saturating_add(1));
    tokio::time::sleep(jitter).await;

    // Shuffle so partial cycles do not starve the tail of the list.
    let mut endpoints = inner.endpoints.clone();
    shuffle(&mut endpoints);

    let outcomes = run_probe_pool(
        &inner.http,
        endpoints,
        Duration::from_secs(inner.config.probe_timeout_seconds.max(1)),
        inner.config.concurrency,
        Arc::clone(&cycle_stop),
    )
    .await;

    for (endpoint, result) in outcomes {
        record_outcome(inner, &endpoint, &result).await;
    }

    cycle_done.store(true, Ordering::SeqCst);
    let _ = renewal.await;
    inner.lock.release(&lease).await;

    inner
        .last_cycle_ms
        .store(inner.clock.now_epoch_ms(), Ordering::SeqCst);
    inner.cycles_completed.fetch_add(1, Ordering::SeqCst);
}

async fn renewal_loop(
    inner: Arc<ProberInner>,
    lease: Lease,
    cycle_stop: Arc<AtomicBool>,
    cycle_done: Arc<AtomicBool>,
) {
    let period = Duration::from_millis((lease.ttl_ms / 2).max(250));
    let slice = Duration::from_millis(200);
    'renewal: loop {
        let mut waited = Duration::ZERO;
        while waited < period {
            if cycle_done.load(Ordering::SeqCst) {
                break 'renewal;
            }
            if inner.stop.load(Ordering::SeqCst) {
                cycle_stop.store(true, Ordering::SeqCst);
                break 'renewal;
            }
            let step = (period - waited).min(slice);
            tokio::time::sleep(step).await;
            waited += step;
        }
        if !inner.lock.renew(&lease, lease.ttl_ms).await {
            warn!(job = PROBER_JOB, "leadership lost mid-cycle, stopping workers");
            cycle_stop.store(true, Ordering::SeqCst);
            break;
        }
        debug!(job = PROBER_JOB, "lease renewed");
    }
}

async fn record_outcome(inner: &Arc<ProberInner>, endpoint: &ProbeEndpoint, result: &ProbeResult) {
    if result.ok {
        inner.probes_ok.fetch_add(1, Ordering::SeqCst);
        inner.circuits.record_success(&endpoint.provider_id).await;
        inner
            .circuits
            .record_vendor_success(&endpoint.vendor_id, &endpoint.provider_type)
            .await;
    } else {
        inner.probes_failed.fetch_add(1, Ordering::SeqCst);
        debug!(
            provider_id = %endpoint.provider_id,
            error_type = ?result.error_type,
            status_code = ?result.status_code,
            "probe failed"
        );
        inner.circuits.record_failure(&endpoint.provider_id).await;
        inner
            .circuits
            .record_vendor_failure(&endpoint.vendor_id, &endpoint.provider_type)
            .await;
    }
    if let Err(err) = append_history(inner, endpoint, result).await {
        warn!(provider_id = %endpoint.provider_id, error = %err, "probe history append dropped");
    }
}

async fn append_history(
    inner: &Arc<ProberInner>,
    endpoint: &ProbeEndpoint,
    result: &ProbeResult,
) -> Result<()> {
    let mut conn = inner.store.connection().await?;
    let key = inner.store.key_probe_history(&endpoint.provider_id);
    let now_ms = inner.clock.now_epoch_ms();
    let member = format!("{now_ms}:{}", serde_json::to_string(result)?);
    let ttl_seconds = inner.config.history_retention_seconds + 3600;
    let _: () = redis::pipe()
        .atomic()
        .zadd(&key, member, now_ms)
        .expire(&key, ttl_seconds as i64)
        .query_async(&mut conn)
        .await?;
    Ok(())
}

async fn read_history(
    store: &CoordStore,
    provider_id: &str,
    limit: usize,
) -> Result<Vec<ProbeHistoryEntry>> {
    let mut conn = store.connection().await?;
    let limit = limit.clamp(1, 1000);
    let members: Vec<String> = redis::cmd("ZREVRANGEBYSCORE")
        .arg(store.key_probe_history(provider_id))
        .arg("+inf")
        .arg("-inf")
        .arg("LIMIT")
        .arg(0)
        .arg(limit)
        .query_async(&mut conn)
        .await?;

    let mut out = Vec::with_capacity(members.len());
    for member in members {
        let Some((ts_raw, json)) = member.split_once(':') else {
            continue;
        };
        let Ok(ts_ms) = ts_raw.parse::<u64>() else {
            continue;
        };
        match serde_json::from_str(json) {
            Ok(result) => out.push(ProbeHistoryEntry { ts_ms, result }),
            Err(_) => continue,
        }
    }
    Ok(out)
}

/// Batch-delete probe history older than the retention window, gated behind
/// its own lease so exactly one replica does the sweeping.
async fn cleanup_loop(inner: Arc<ProberInner>) {
    let interval = Duration::from_secs(inner.config.cleanup_interval_seconds.max(1));
    loop {
        if inner.stop.load(Ordering::SeqCst) {
            break;
        }
        if let Some(lease) = inner.lock.acquire(CLEANUP_JOB, 60_000).await {
            if let Err(err) = sweep_history(&inner).await {
                warn!(error = %err, "probe history cleanup failed");
            }
            inner.lock.release(&lease).await;
        }
        if sleep_with_stop(&inner.stop, interval).await {
            break;
        }
    }
}

async fn sweep_history(inner: &Arc<ProberInner>) -> Result<()> {
    let mut conn = inner.store.connection().await?;
    let horizon = inner
        .clock
        .now_epoch_ms()
        .saturating_sub(inner.config.history_retention_seconds * 1000);

    let provider_ids: HashSet<&str> = inner
        .endpoints
        .iter()
        .map(|endpoint| endpoint.provider_id.as_str())
        .collect();
    for provider_id in provider_ids {
        let removed: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(inner.store.key_probe_history(provider_id))
            .arg("-inf")
            .arg(horizon)
            .query_async(&mut conn)
            .await?;
        if removed > 0 {
            debug!(provider_id, removed, "pruned probe history");
        }
    }
    Ok(())
}

/// Sleep in short slices so a flipped flag is observed promptly. Returns
/// true when the flag was set.
async fn sleep_with_stop(flag: &AtomicBool, total: Duration) -> bool {
    let slice = Duration::from_millis(200);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
    flag.load(Ordering::SeqCst)
}
