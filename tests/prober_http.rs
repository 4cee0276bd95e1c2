use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use httpmock::Method::{GET, HEAD};
use httpmock::MockServer;

use crossbar_gateway::{ProbeEndpoint, ProbeErrorKind, probe_endpoint, run_probe_pool};

fn endpoint(url: String) -> ProbeEndpoint {
    ProbeEndpoint {
        provider_id: "p-1".to_string(),
        vendor_id: "v-1".to_string(),
        provider_type: "chat".to_string(),
        url,
    }
}

#[tokio::test]
async fn conclusive_head_never_falls_back_to_get() {
    let upstream = MockServer::start();
    let head_mock = upstream.mock(|when, then| {
        when.method(HEAD).path("/v1/models");
        then.status(200);
    });
    let get_mock = upstream.mock(|when, then| {
        when.method(GET).path("/v1/models");
        then.status(200);
    });

    let http = reqwest::Client::new();
    let result = probe_endpoint(&http, &upstream.url("/v1/models"), Duration::from_secs(2)).await;

    assert!(result.ok);
    assert_eq!(result.status_code, Some(200));
    assert_eq!(result.error_type, None);
    assert!(result.latency_ms.is_some());
    head_mock.assert();
    assert_eq!(get_mock.hits(), 0);
}

#[tokio::test]
async fn non_5xx_status_counts_as_healthy() {
    let upstream = MockServer::start();
    let head_mock = upstream.mock(|when, then| {
        when.method(HEAD).path("/v1/models");
        then.status(401);
    });
    let get_mock = upstream.mock(|when, then| {
        when.method(GET).path("/v1/models");
        then.status(401);
    });

    let http = reqwest::Client::new();
    let result = probe_endpoint(&http, &upstream.url("/v1/models"), Duration::from_secs(2)).await;

    assert!(result.ok);
    assert_eq!(result.status_code, Some(401));
    head_mock.assert();
    assert_eq!(get_mock.hits(), 0);
}

#[tokio::test]
async fn server_error_is_classified_http_5xx() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(HEAD).path("/v1/models");
        then.status(503);
    });

    let http = reqwest::Client::new();
    let result = probe_endpoint(&http, &upstream.url("/v1/models"), Duration::from_secs(2)).await;

    assert!(!result.ok);
    assert_eq!(result.status_code, Some(503));
    assert_eq!(result.error_type, Some(ProbeErrorKind::Http5xx));
}

#[tokio::test]
async fn inconclusive_head_retries_as_get_before_reporting_timeout() {
    let upstream = MockServer::start();
    let head_mock = upstream.mock(|when, then| {
        when.method(HEAD).path("/slow");
        then.status(200).delay(Duration::from_millis(900));
    });
    let get_mock = upstream.mock(|when, then| {
        when.method(GET).path("/slow");
        then.status(200).delay(Duration::from_millis(900));
    });

    let http = reqwest::Client::new();
    let result = probe_endpoint(&http, &upstream.url("/slow"), Duration::from_millis(150)).await;

    assert!(!result.ok);
    assert_eq!(result.status_code, None);
    assert_eq!(result.error_type, Some(ProbeErrorKind::Timeout));
    head_mock.assert();
    get_mock.assert();
}

#[tokio::test]
async fn unreachable_host_is_a_network_error() {
    // Reserved TEST-NET-1 address: nothing answers there.
    let http = reqwest::Client::new();
    let result = probe_endpoint(
        &http,
        "http://192.0.2.1:9/v1/models",
        Duration::from_millis(400),
    )
    .await;

    assert!(!result.ok);
    assert_eq!(result.status_code, None);
    assert!(matches!(
        result.error_type,
        Some(ProbeErrorKind::Timeout) | Some(ProbeErrorKind::NetworkError)
    ));
}

#[tokio::test]
async fn pool_probes_every_endpoint_when_not_stopped() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(HEAD).path("/v1/models");
        then.status(200);
    });

    let endpoints: Vec<ProbeEndpoint> = (0..6)
        .map(|_| endpoint(upstream.url("/v1/models")))
        .collect();
    let http = reqwest::Client::new();
    let stop = Arc::new(AtomicBool::new(false));
    let outcomes = run_probe_pool(&http, endpoints, Duration::from_secs(2), 3, stop).await;

    assert_eq!(outcomes.len(), 6);
    assert!(outcomes.iter().all(|(_, result)| result.ok));
    assert_eq!(mock.hits(), 6);
}

#[tokio::test]
async fn pre_set_stop_flag_starts_no_work() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(HEAD).path("/v1/models");
        then.status(200);
    });

    let endpoints: Vec<ProbeEndpoint> = (0..4)
        .map(|_| endpoint(upstream.url("/v1/models")))
        .collect();
    let http = reqwest::Client::new();
    let stop = Arc::new(AtomicBool::new(true));
    let outcomes = run_probe_pool(&http, endpoints, Duration::from_secs(2), 2, stop).await;

    assert!(outcomes.is_empty());
    assert_eq!(mock.hits(), 0);
}

#[tokio::test]
async fn stop_mid_batch_finishes_in_flight_probe_and_starts_no_new_ones() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(HEAD).path("/v1/models");
        then.status(200).delay(Duration::from_millis(700));
    });

    let endpoints: Vec<ProbeEndpoint> = (0..5)
        .map(|_| endpoint(upstream.url("/v1/models")))
        .collect();
    let http = reqwest::Client::new();
    let stop = Arc::new(AtomicBool::new(false));

    let flipper = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            // Leadership is lost while the first probe is still in flight.
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop.store(true, Ordering::SeqCst);
        })
    };

    let outcomes = run_probe_pool(&http, endpoints, Duration::from_secs(3), 1, stop).await;
    flipper.await.unwrap();

    // The in-flight probe completed; the queued remainder never started.
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].1.ok);
    assert_eq!(mock.hits(), 1);
}
