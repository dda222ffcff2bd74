//! The client facade binding the aggregators to a transport.
//!
//! The facade serves check and quota calls from cache where it can, batches
//! report calls, and runs a background scheduler that periodically drains
//! the report and quota aggregators upstream. Upstream failures never block
//! the application: checks fail open, quota failures return a cached default
//! grant, report failures are logged and dropped.

use crate::aggregator::{CheckAggregator, QuotaAggregator, ReportAggregator};
use crate::core::config::ClientConfig;
use crate::core::error::{Result, TollgateError};
use crate::core::ticker::{SystemTicker, Ticker};
use crate::core::types::{
    AllocateQuotaRequest, AllocateQuotaResponse, CheckRequest, CheckResponse, ReportRequest,
};
use crate::scheduler::Scheduler;
use crate::statistics::Statistics;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Priority of the recurring quota refresh task.
const QUOTA_FLUSH_PRIORITY: i32 = 0;
/// Priority of the recurring report flush task.
const REPORT_FLUSH_PRIORITY: i32 = 1;

/// Synchronous upstream RPC surface consumed by the facade.
pub trait Transport: Send + Sync {
    /// Performs an access check upstream.
    fn check(&self, req: &CheckRequest) -> Result<CheckResponse>;
    /// Performs a quota allocation upstream.
    fn allocate_quota(&self, req: &AllocateQuotaRequest) -> Result<AllocateQuotaResponse>;
    /// Delivers a report batch upstream.
    fn report(&self, req: &ReportRequest) -> Result<()>;
}

/// Produces the single background thread driving the scheduler.
pub trait ThreadFactory: Send + Sync {
    /// Spawns a thread running `body`; failure triggers inline-drive mode.
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> Result<JoinHandle<()>>;
}

/// Default factory delegating to [`std::thread::Builder`].
#[derive(Debug, Default)]
pub struct StdThreadFactory;

impl ThreadFactory for StdThreadFactory {
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(body)
            .map_err(|e| TollgateError::thread(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Running,
    Stopping,
}

/// Mutable driver state behind the facade's single lifecycle lock.
struct Driver {
    lifecycle: Lifecycle,
    scheduler: Option<Arc<Scheduler>>,
    thread: Option<JoinHandle<()>>,
    /// Set when thread creation failed and flushes run on report calls.
    inline: bool,
}

struct ClientInner {
    config: ClientConfig,
    checks: CheckAggregator,
    quotas: QuotaAggregator,
    reports: ReportAggregator,
    transport: Arc<dyn Transport>,
    threads: Arc<dyn ThreadFactory>,
    ticker: Arc<dyn Ticker>,
    statistics: Arc<Statistics>,
    driver: Mutex<Driver>,
    /// Ticker time of the last non-empty report flush, for idle shutdown.
    last_flush_activity_nanos: AtomicU64,
}

/// Facade encapsulating check caching, quota caching, and report batching
/// in front of a [`Transport`].
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Starts building a client for `service_name`.
    pub fn builder<S: Into<String>>(service_name: S) -> ClientBuilder {
        ClientBuilder::new(service_name)
    }

    /// The service this client fronts.
    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    /// The shared performance counters.
    pub fn statistics(&self) -> Arc<Statistics> {
        self.inner.statistics.clone()
    }

    /// Starts the background flushing driver.
    ///
    /// Safe to call on a running client. check/quota/report start the client
    /// lazily, so calling this is only needed to front-load the thread spawn.
    pub fn start(&self) {
        start(&self.inner);
    }

    /// Stops processing, draining pending reports through the transport.
    ///
    /// The transition to Stopped completes at the next scheduler tick (or
    /// immediately when no background thread is driving). Fails with an
    /// illegal-state error when the client is not running.
    pub fn stop(&self) -> Result<()> {
        stop(&self.inner)
    }

    /// Processes a check request.
    ///
    /// Served from cache when possible; otherwise the transport is called
    /// and the response cached. Returns `None` on transport failure so the
    /// caller can fail open.
    pub fn check(&self, req: &CheckRequest) -> Result<Option<CheckResponse>> {
        let inner = &self.inner;
        start_if_stopped(inner);
        inner.statistics.total_checks.fetch_add(1, Ordering::Relaxed);

        let started = inner.ticker.now_nanos();
        let cached = inner.checks.check(req)?;
        add_elapsed(
            &inner.statistics.total_check_cache_lookup_millis,
            inner.ticker.as_ref(),
            started,
        );
        if let Some(resp) = cached {
            inner.statistics.check_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(service = %inner.config.service_name, "using cached check response");
            return Ok(Some(resp));
        }

        let started = inner.ticker.now_nanos();
        match inner.transport.check(req) {
            Ok(resp) => {
                add_elapsed(
                    &inner.statistics.total_check_transport_millis,
                    inner.ticker.as_ref(),
                    started,
                );
                let started = inner.ticker.now_nanos();
                inner.checks.add_response(req, &resp)?;
                add_elapsed(
                    &inner.statistics.total_check_cache_update_millis,
                    inner.ticker.as_ref(),
                    started,
                );
                Ok(Some(resp))
            },
            Err(e) => {
                tracing::error!(error = %e, "direct send of a check request failed; failing open");
                Ok(None)
            },
        }
    }

    /// Processes a quota-allocation request.
    ///
    /// Served from cache with deduction when possible; otherwise the
    /// transport is called. On transport failure a default-empty response is
    /// cached and returned so a systemic outage does not block callers.
    pub fn allocate_quota(&self, req: &AllocateQuotaRequest) -> Result<AllocateQuotaResponse> {
        let inner = &self.inner;
        start_if_stopped(inner);
        inner.statistics.total_quotas.fetch_add(1, Ordering::Relaxed);

        let started = inner.ticker.now_nanos();
        let cached = inner.quotas.allocate_quota(req)?;
        add_elapsed(
            &inner.statistics.total_quota_cache_lookup_millis,
            inner.ticker.as_ref(),
            started,
        );
        if let Some(resp) = cached {
            inner.statistics.quota_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(resp);
        }

        let started = inner.ticker.now_nanos();
        match inner.transport.allocate_quota(req) {
            Ok(resp) => {
                add_elapsed(
                    &inner.statistics.total_quota_transport_millis,
                    inner.ticker.as_ref(),
                    started,
                );
                let started = inner.ticker.now_nanos();
                inner.quotas.cache_response(req, &resp)?;
                add_elapsed(
                    &inner.statistics.total_quota_cache_update_millis,
                    inner.ticker.as_ref(),
                    started,
                );
                Ok(resp)
            },
            Err(e) => {
                tracing::error!(error = %e, "direct send of a quota request failed; caching default response");
                let fallback = AllocateQuotaResponse::default();
                inner.quotas.cache_response(req, &fallback)?;
                Ok(fallback)
            },
        }
    }

    /// Processes a report request.
    ///
    /// The request is merged into the report aggregator, or sent directly
    /// when the aggregator declines it. Transport errors are logged, never
    /// propagated. In inline-drive mode each call also ticks the scheduler.
    pub fn report(&self, req: &ReportRequest) -> Result<()> {
        let inner = &self.inner;
        start_if_stopped(inner);
        inner.statistics.total_reports.fetch_add(1, Ordering::Relaxed);
        inner
            .statistics
            .reported_operations
            .fetch_add(req.operations.len() as u64, Ordering::Relaxed);

        let started = inner.ticker.now_nanos();
        let merged = inner.reports.report(req)?;
        add_elapsed(
            &inner.statistics.total_report_cache_update_millis,
            inner.ticker.as_ref(),
            started,
        );
        if !merged {
            inner.statistics.direct_reports.fetch_add(1, Ordering::Relaxed);
            let started = inner.ticker.now_nanos();
            match inner.transport.report(req) {
                Ok(()) => add_elapsed(
                    &inner.statistics.total_transported_report_millis,
                    inner.ticker.as_ref(),
                    started,
                ),
                Err(e) => {
                    tracing::error!(error = %e, "direct send of a report request failed");
                },
            }
        }

        let inline_scheduler = {
            let driver = inner.driver.lock();
            if driver.inline {
                driver.scheduler.clone()
            } else {
                None
            }
        };
        if let Some(scheduler) = inline_scheduler {
            scheduler.run(false);
        }
        log_statistics(inner);
        Ok(())
    }
}

fn add_elapsed(counter: &AtomicU64, ticker: &dyn Ticker, started_nanos: u64) {
    let elapsed = ticker.now_nanos().saturating_sub(started_nanos) / 1_000_000;
    counter.fetch_add(elapsed, Ordering::Relaxed);
}

fn log_statistics(inner: &ClientInner) {
    let frequency = inner.config.stats_log_frequency;
    if frequency < 1 {
        return;
    }
    let total = inner.statistics.total_reports.load(Ordering::Relaxed);
    if total % frequency as u64 == 0 {
        tracing::info!("stats={}", inner.statistics);
    }
}

fn start_if_stopped(inner: &Arc<ClientInner>) {
    {
        let driver = inner.driver.lock();
        if driver.lifecycle != Lifecycle::Stopped {
            return;
        }
    }
    start(inner);
}

fn start(inner: &Arc<ClientInner>) {
    let scheduler = {
        let mut driver = inner.driver.lock();
        match driver.lifecycle {
            Lifecycle::Running => {
                tracing::info!(service = %inner.config.service_name, "client is already started");
                return;
            },
            Lifecycle::Stopping => {
                tracing::info!(service = %inner.config.service_name, "client is still stopping");
                return;
            },
            Lifecycle::Stopped => {},
        }
        tracing::info!(service = %inner.config.service_name, "starting client");
        driver.lifecycle = Lifecycle::Running;
        driver.inline = false;
        let scheduler = Arc::new(Scheduler::new(inner.ticker.clone()));
        scheduler.set_statistics(inner.statistics.clone());
        driver.scheduler = Some(scheduler.clone());
        scheduler
    };
    inner
        .last_flush_activity_nanos
        .store(inner.ticker.now_nanos(), Ordering::Relaxed);
    schedule_report_flush(inner, &scheduler, 0);
    schedule_quota_flush(inner, &scheduler, 0);

    let body = {
        let scheduler = scheduler.clone();
        let service = inner.config.service_name.clone();
        Box::new(move || {
            scheduler.run_blocking();
            tracing::info!(service = %service, "scheduler has no further tasks and will exit");
        })
    };
    match inner.threads.spawn("tollgate-flush", body) {
        Ok(handle) => {
            inner.driver.lock().thread = Some(handle);
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                "the scheduler thread was unable to start; flushes will only run \
                 after requests are served, which may delay reporting for \
                 low-traffic services"
            );
            inner.driver.lock().inline = true;
            // Run the seed tasks once so only interval work remains queued.
            scheduler.run(false);
        },
    }
}

fn stop(inner: &Arc<ClientInner>) -> Result<()> {
    {
        let mut driver = inner.driver.lock();
        if driver.lifecycle != Lifecycle::Running {
            return Err(TollgateError::illegal_state(
                "cannot stop a client that is not running",
            ));
        }
        driver.lifecycle = Lifecycle::Stopping;
    }
    tracing::info!(service = %inner.config.service_name, "stopping client and flushing the report aggregator");
    for req in inner.reports.clear() {
        if let Err(e) = inner.transport.report(&req) {
            tracing::error!(error = %e, "direct send of a report request failed during shutdown");
        }
    }
    let run_directly = {
        let driver = inner.driver.lock();
        driver.inline || driver.thread.is_none()
    };
    if run_directly {
        // No scheduler tick will come; complete the transition here.
        reset_if_stopped(inner);
    }
    Ok(())
}

/// Completes the Stopping → Stopped transition, clearing all caches.
///
/// Returns true when the client was (or now is) stopped, which tells the
/// recurring flush tasks to return without rescheduling.
fn reset_if_stopped(inner: &Arc<ClientInner>) -> bool {
    let mut driver = inner.driver.lock();
    match driver.lifecycle {
        Lifecycle::Running => false,
        Lifecycle::Stopped => true,
        Lifecycle::Stopping => {
            inner.checks.clear();
            inner.quotas.clear();
            let _ = inner.reports.clear();
            driver.lifecycle = Lifecycle::Stopped;
            driver.scheduler = None;
            driver.thread = None;
            true
        },
    }
}

fn schedule_report_flush(inner: &Arc<ClientInner>, scheduler: &Arc<Scheduler>, delta_millis: i64) {
    let weak_inner = Arc::downgrade(inner);
    let weak_scheduler = Arc::downgrade(scheduler);
    scheduler.enter(
        move || {
            if let (Some(inner), Some(scheduler)) = (weak_inner.upgrade(), weak_scheduler.upgrade())
            {
                flush_and_schedule_reports(&inner, &scheduler);
            }
        },
        delta_millis,
        REPORT_FLUSH_PRIORITY,
    );
}

fn flush_and_schedule_reports(inner: &Arc<ClientInner>, scheduler: &Arc<Scheduler>) {
    if reset_if_stopped(inner) {
        tracing::debug!("did not flush reports: client is stopped");
        return;
    }
    let interval = inner.reports.flush_interval_millis();
    if interval < 0 {
        tracing::debug!("did not schedule report flush: aggregation is disabled");
        return;
    }
    let flushed = inner.reports.flush();
    tracing::debug!(batches = flushed.len(), "flushing aggregated reports");
    inner
        .statistics
        .flushed_reports
        .fetch_add(flushed.len() as u64, Ordering::Relaxed);
    for req in &flushed {
        inner
            .statistics
            .flushed_operations
            .fetch_add(req.operations.len() as u64, Ordering::Relaxed);
        let started = inner.ticker.now_nanos();
        match inner.transport.report(req) {
            Ok(()) => add_elapsed(
                &inner.statistics.total_transported_report_millis,
                inner.ticker.as_ref(),
                started,
            ),
            Err(e) => {
                tracing::error!(error = %e, "send of a flushed report request failed");
            },
        }
    }

    let now = inner.ticker.now_nanos();
    if !flushed.is_empty() {
        inner.last_flush_activity_nanos.store(now, Ordering::Relaxed);
    } else {
        // Idle shutdown needs the steady tick cadence of the background
        // thread; it stays off in inline-drive mode.
        let inline = inner.driver.lock().inline;
        let idle_nanos =
            now.saturating_sub(inner.last_flush_activity_nanos.load(Ordering::Relaxed));
        if !inline && idle_nanos > inner.config.max_idle_seconds as u64 * 1_000_000_000 {
            tracing::info!(
                idle_seconds = inner.config.max_idle_seconds,
                "shutting down after an idle period with no reports"
            );
            if let Err(e) = stop(inner) {
                tracing::debug!(error = %e, "idle shutdown raced a concurrent stop");
            }
            return;
        }
    }
    if reset_if_stopped(inner) {
        tracing::debug!("did not schedule succeeding report flush: client is stopped");
        return;
    }
    schedule_report_flush(inner, scheduler, interval);
}

fn schedule_quota_flush(inner: &Arc<ClientInner>, scheduler: &Arc<Scheduler>, delta_millis: i64) {
    let weak_inner = Arc::downgrade(inner);
    let weak_scheduler = Arc::downgrade(scheduler);
    scheduler.enter(
        move || {
            if let (Some(inner), Some(scheduler)) = (weak_inner.upgrade(), weak_scheduler.upgrade())
            {
                flush_and_schedule_quota(&inner, &scheduler);
            }
        },
        delta_millis,
        QUOTA_FLUSH_PRIORITY,
    );
}

fn flush_and_schedule_quota(inner: &Arc<ClientInner>, scheduler: &Arc<Scheduler>) {
    if reset_if_stopped(inner) {
        tracing::debug!("did not flush quota: client is stopped");
        return;
    }
    let interval = inner.quotas.flush_interval_millis();
    if interval < 0 {
        tracing::debug!("did not schedule quota flush: caching is disabled");
        return;
    }
    if inner.driver.lock().inline {
        tracing::debug!("did not schedule quota flush: no scheduler thread is running");
        return;
    }

    let refreshes = inner.quotas.flush();
    tracing::debug!(refreshes = refreshes.len(), "refreshing cached quota allowances");
    for req in refreshes {
        let started = inner.ticker.now_nanos();
        match inner.transport.allocate_quota(&req) {
            Ok(resp) => {
                add_elapsed(
                    &inner.statistics.total_quota_transport_millis,
                    inner.ticker.as_ref(),
                    started,
                );
                let started = inner.ticker.now_nanos();
                if let Err(e) = inner.quotas.cache_response(&req, &resp) {
                    tracing::error!(error = %e, "failed to re-cache a quota refresh response");
                    continue;
                }
                inner.statistics.recached_quotas.fetch_add(1, Ordering::Relaxed);
                add_elapsed(
                    &inner.statistics.total_quota_cache_update_millis,
                    inner.ticker.as_ref(),
                    started,
                );
            },
            Err(e) => {
                tracing::error!(error = %e, "send of a quota refresh request failed");
            },
        }
    }
    if reset_if_stopped(inner) {
        tracing::debug!("did not schedule succeeding quota flush: client is stopped");
        return;
    }
    schedule_quota_flush(inner, scheduler, interval);
}

/// Builder assembling a [`Client`] from its configuration and seams.
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    threads: Arc<dyn ThreadFactory>,
    ticker: Arc<dyn Ticker>,
}

impl ClientBuilder {
    /// Creates a builder for `service_name` with default options.
    pub fn new<S: Into<String>>(service_name: S) -> Self {
        Self {
            config: ClientConfig::new(service_name),
            transport: None,
            threads: Arc::new(StdThreadFactory),
            ticker: Arc::new(SystemTicker::new()),
        }
    }

    /// Replaces the whole configuration; its service name wins.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the check cache options.
    pub fn check_options(mut self, options: crate::core::config::CheckAggregationConfig) -> Self {
        self.config.check = options;
        self
    }

    /// Sets the quota cache options.
    pub fn quota_options(mut self, options: crate::core::config::QuotaAggregationConfig) -> Self {
        self.config.quota = options;
        self
    }

    /// Sets the report batching options.
    pub fn report_options(mut self, options: crate::core::config::ReportAggregationConfig) -> Self {
        self.config.report = options;
        self
    }

    /// Sets the statistics logging cadence.
    pub fn stats_log_frequency(mut self, frequency: i64) -> Self {
        self.config.stats_log_frequency = frequency;
        self
    }

    /// Sets the idle-shutdown threshold.
    pub fn max_idle_seconds(mut self, seconds: i64) -> Self {
        self.config.max_idle_seconds = seconds;
        self
    }

    /// Sets the upstream transport. Required.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the thread factory.
    pub fn thread_factory(mut self, threads: Arc<dyn ThreadFactory>) -> Self {
        self.threads = threads;
        self
    }

    /// Replaces the time source.
    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = ticker;
        self
    }

    /// Builds the client without starting it.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| TollgateError::config("a transport must be provided"))?;
        let service_name = self.config.service_name.clone();
        let checks =
            CheckAggregator::new(&service_name, self.config.check.clone(), self.ticker.clone())?;
        let quotas =
            QuotaAggregator::new(&service_name, self.config.quota.clone(), self.ticker.clone())?;
        let reports = ReportAggregator::new(&service_name, self.config.report.clone())?;
        Ok(Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                checks,
                quotas,
                reports,
                transport,
                threads: self.threads,
                ticker: self.ticker,
                statistics: Arc::new(Statistics::new()),
                driver: Mutex::new(Driver {
                    lifecycle: Lifecycle::Stopped,
                    scheduler: None,
                    thread: None,
                    inline: false,
                }),
                last_flush_activity_nanos: AtomicU64::new(0),
            }),
        })
    }
}
