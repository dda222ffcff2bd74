//! Facade behavior through the public API.

mod common;

use common::{check_request, inline_client, quota_request, report_request, RecordingTransport, SERVICE};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tollgate::{Importance, ManualTicker, TollgateError};

#[test]
fn test_check_cache_lifecycle() {
    let transport = RecordingTransport::new();
    let ticker = Arc::new(ManualTicker::new());
    let client = inline_client(transport.clone(), ticker.clone());
    let req = check_request("project:demo");

    // Miss, hit, then expiry brings the upstream back into the path.
    assert!(client.check(&req).unwrap().is_some());
    assert!(client.check(&req).unwrap().is_some());
    assert_eq!(transport.checks.lock().len(), 1);

    ticker.advance_millis(4001);
    assert!(client.check(&req).unwrap().is_some());
    assert_eq!(transport.checks.lock().len(), 2);

    let stats = client.statistics();
    assert_eq!(stats.total_checks.load(Ordering::Relaxed), 3);
    assert_eq!(stats.check_hits.load(Ordering::Relaxed), 1);
    // Hits plus direct upstream calls account for every check.
    assert_eq!(
        stats.check_hits.load(Ordering::Relaxed) + stats.direct_checks(),
        stats.total_checks.load(Ordering::Relaxed)
    );
}

#[test]
fn test_check_transport_failure_fails_open() {
    let transport = RecordingTransport::new();
    transport.fail_checks.store(true, Ordering::Relaxed);
    let ticker = Arc::new(ManualTicker::new());
    let client = inline_client(transport.clone(), ticker);

    assert!(client.check(&check_request("project:demo")).unwrap().is_none());
    // Nothing was cached, so the next call tries upstream again.
    assert!(client.check(&check_request("project:demo")).unwrap().is_none());
    assert_eq!(transport.checks.lock().len(), 2);
}

#[test]
fn test_quota_depletion_goes_back_upstream() {
    let transport = RecordingTransport::new();
    let ticker = Arc::new(ManualTicker::new());
    let client = inline_client(transport.clone(), ticker);

    // First call misses and caches a grant of 100.
    client.allocate_quota(&quota_request(60)).unwrap();
    // 60 remains after this hit.
    client.allocate_quota(&quota_request(40)).unwrap();
    assert_eq!(transport.quotas.lock().len(), 1);
    // 60 left, 70 wanted: depleted, so upstream is consulted again.
    client.allocate_quota(&quota_request(70)).unwrap();
    assert_eq!(transport.quotas.lock().len(), 2);
}

#[test]
fn test_report_flush_cycle_and_statistics() {
    let transport = RecordingTransport::new();
    let ticker = Arc::new(ManualTicker::new());
    let client = inline_client(transport.clone(), ticker.clone());

    client.report(&report_request("project:a", Importance::Low)).unwrap();
    client.report(&report_request("project:a", Importance::Low)).unwrap();
    client.report(&report_request("project:b", Importance::Low)).unwrap();
    assert!(transport.reports.lock().is_empty());

    ticker.advance_millis(1000);
    client.report(&report_request("project:c", Importance::Low)).unwrap();

    // Two project:a calls merged into one slot; four inputs, three slots.
    assert_eq!(transport.reported_operations(), 3);

    let stats = client.statistics();
    assert_eq!(stats.total_reports.load(Ordering::Relaxed), 4);
    assert_eq!(stats.reported_operations.load(Ordering::Relaxed), 4);
    assert_eq!(stats.flushed_operations.load(Ordering::Relaxed), 3);
    assert_eq!(stats.direct_reports.load(Ordering::Relaxed), 0);

    let rendered = stats.to_string();
    assert!(rendered.starts_with("statistics:"));
    assert!(rendered.contains("total_reports: 4"));
    assert!(rendered.contains("reported_operations: 4"));
}

#[test]
fn test_stopped_client_rejects_stop_but_restarts_on_use() {
    let transport = RecordingTransport::new();
    let ticker = Arc::new(ManualTicker::new());
    let client = inline_client(transport.clone(), ticker);

    assert!(matches!(
        client.stop().unwrap_err(),
        TollgateError::IllegalState(_)
    ));

    client.report(&report_request("project:a", Importance::Low)).unwrap();
    client.stop().unwrap();
    assert_eq!(transport.reported_operations(), 1);

    // A stopped client restarts lazily on the next call.
    assert!(client.check(&check_request("project:a")).unwrap().is_some());
    client.stop().unwrap();
}

#[test]
fn test_service_name_mismatch_is_surfaced() {
    let transport = RecordingTransport::new();
    let ticker = Arc::new(ManualTicker::new());
    let client = inline_client(transport, ticker);

    let mut req = check_request("project:demo");
    req.service_name = "other.example.com".into();
    assert!(matches!(
        client.check(&req).unwrap_err(),
        TollgateError::InvalidRequest(_)
    ));
    assert_eq!(client.service_name(), SERVICE);
}
