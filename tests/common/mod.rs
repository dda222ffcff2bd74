//! Shared fixtures for integration tests.
#![allow(dead_code)] // each test binary uses its own subset of the helpers

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tollgate::{
    AllocateQuotaRequest, AllocateQuotaResponse, CheckRequest, CheckResponse, Client, Importance,
    ManualTicker, MetricValue, MetricValueSet, Operation, ReportRequest, Result, ThreadFactory,
    TollgateError, Transport,
};

pub const SERVICE: &str = "library.example.com";

/// Transport double recording every request it sees.
#[derive(Default)]
pub struct RecordingTransport {
    pub fail_checks: AtomicBool,
    pub fail_quotas: AtomicBool,
    pub fail_reports: AtomicBool,
    pub checks: Mutex<Vec<CheckRequest>>,
    pub quotas: Mutex<Vec<AllocateQuotaRequest>>,
    pub reports: Mutex<Vec<ReportRequest>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total operations delivered across all report requests.
    pub fn reported_operations(&self) -> usize {
        self.reports.lock().iter().map(|r| r.operations.len()).sum()
    }

    /// Sizes of the report batches received, smallest first.
    pub fn report_batch_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self.reports.lock().iter().map(|r| r.operations.len()).collect();
        sizes.sort_unstable();
        sizes
    }
}

impl Transport for RecordingTransport {
    fn check(&self, req: &CheckRequest) -> Result<CheckResponse> {
        self.checks.lock().push(req.clone());
        if self.fail_checks.load(Ordering::Relaxed) {
            return Err(TollgateError::transport("upstream unavailable"));
        }
        Ok(CheckResponse {
            operation_id: req.operation()?.operation_id.clone(),
            check_errors: Vec::new(),
        })
    }

    fn allocate_quota(&self, req: &AllocateQuotaRequest) -> Result<AllocateQuotaResponse> {
        self.quotas.lock().push(req.clone());
        if self.fail_quotas.load(Ordering::Relaxed) {
            return Err(TollgateError::transport("upstream unavailable"));
        }
        let quota_metrics = req
            .operation()?
            .metric_value_sets
            .iter()
            .map(|set| MetricValueSet::single(set.metric_name.clone(), MetricValue::int64(100)))
            .collect();
        Ok(AllocateQuotaResponse {
            operation_id: req.operation()?.operation_id.clone(),
            allocate_errors: Vec::new(),
            quota_metrics,
        })
    }

    fn report(&self, req: &ReportRequest) -> Result<()> {
        self.reports.lock().push(req.clone());
        if self.fail_reports.load(Ordering::Relaxed) {
            return Err(TollgateError::transport("upstream unavailable"));
        }
        Ok(())
    }
}

/// Factory whose spawn always fails, forcing inline-drive mode so tests
/// control every scheduler tick through report calls.
pub struct NoThreads;

impl ThreadFactory for NoThreads {
    fn spawn(&self, _name: &str, _body: Box<dyn FnOnce() + Send>) -> Result<JoinHandle<()>> {
        Err(TollgateError::thread("threads are forbidden here"))
    }
}

/// An inline-drive client over the given transport and clock.
pub fn inline_client(transport: Arc<RecordingTransport>, ticker: Arc<ManualTicker>) -> Client {
    Client::builder(SERVICE)
        .transport(transport)
        .thread_factory(Arc::new(NoThreads))
        .ticker(ticker)
        .build()
        .unwrap()
}

pub fn check_request(consumer: &str) -> CheckRequest {
    CheckRequest {
        service_name: SERVICE.into(),
        operation: Some(
            Operation::builder()
                .operation_id("op-1")
                .consumer_id(consumer)
                .operation_name("Library.List")
                .build()
                .unwrap(),
        ),
    }
}

pub fn quota_request(amount: i64) -> AllocateQuotaRequest {
    AllocateQuotaRequest {
        service_name: SERVICE.into(),
        operation: Some(
            Operation::builder()
                .operation_id("op-q")
                .consumer_id("project:demo")
                .operation_name("Library.Borrow")
                .metric_value_set(MetricValueSet::single("qps", MetricValue::int64(amount)))
                .build()
                .unwrap(),
        ),
    }
}

pub fn report_request(consumer: &str, importance: Importance) -> ReportRequest {
    ReportRequest {
        service_name: SERVICE.into(),
        operations: vec![Operation::builder()
            .consumer_id(consumer)
            .operation_name("Library.Borrow")
            .importance(importance)
            .metric_value_set(MetricValueSet::single("m.requests", MetricValue::int64(1)))
            .build()
            .unwrap()],
    }
}
