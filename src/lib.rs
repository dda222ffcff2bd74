//! Tollgate - client-side aggregation for a service-control plane.
//!
//! Tollgate sits between an application and a remote control service,
//! eliminating redundant round-trips for access checks and quota
//! allocations and coalescing high-volume usage reports into batched
//! upstream calls under bounded memory.
//!
//! # Features
//!
//! - **Check caching**: responses cached by canonical request fingerprint
//!   with TTL expiry and a HIGH-importance bypass
//! - **Quota caching**: cached allowances with per-call deduction and
//!   interval refresh carrying real usage
//! - **Report batching**: a bounded LRU of mergeable operations flushed on
//!   interval, split to a per-payload operation limit
//! - **Fail-open**: upstream failures never block the application
//! - **Inline drive**: works without a background thread in sandboxed
//!   runtimes by ticking the flush scheduler on each report call
//!
//! # Architecture
//!
//! - `core`: domain model, errors, configuration, injectable clock
//! - `signing`: canonical fingerprinting of requests
//! - `merge`: metric and operation merge arithmetic
//! - `aggregator`: the check/quota/report caches
//! - `scheduler`: the priority timer queue behind the background flushes
//! - `client`: the facade binding everything to a transport
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tollgate::{Client, CheckRequest, Operation};
//! # struct MyTransport;
//! # impl tollgate::Transport for MyTransport {
//! #     fn check(&self, _: &CheckRequest) -> tollgate::Result<tollgate::CheckResponse> { todo!() }
//! #     fn allocate_quota(&self, _: &tollgate::AllocateQuotaRequest) -> tollgate::Result<tollgate::AllocateQuotaResponse> { todo!() }
//! #     fn report(&self, _: &tollgate::ReportRequest) -> tollgate::Result<()> { todo!() }
//! # }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("library.example.com")
//!         .transport(Arc::new(MyTransport))
//!         .build()?;
//!     let request = CheckRequest {
//!         service_name: "library.example.com".into(),
//!         operation: Some(
//!             Operation::builder()
//!                 .consumer_id("project:demo")
//!                 .operation_name("Library.List")
//!                 .build()?,
//!         ),
//!     };
//!     match client.check(&request)? {
//!         Some(resp) if resp.is_ok() => println!("allowed"),
//!         Some(_) => println!("denied"),
//!         None => println!("upstream unavailable, failing open"),
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod aggregator;
pub mod client;
pub mod core;
pub mod merge;
pub mod scheduler;
pub mod signing;
pub mod statistics;

pub use aggregator::{CheckAggregator, QuotaAggregator, ReportAggregator, NON_CACHING};
pub use client::{Client, ClientBuilder, StdThreadFactory, ThreadFactory, Transport};
pub use core::{
    AllocateQuotaRequest, AllocateQuotaResponse, CheckAggregationConfig, CheckRequest,
    CheckResponse, ClientConfig, ClientConfigBuilder, Distribution, Importance, ManualTicker,
    MetricKind, MetricValue, MetricValueSet, Operation, QuotaAggregationConfig, ReportAggregationConfig,
    ReportRequest, Result, SystemTicker, Ticker, Timestamp, TollgateError, DO_NOT_LOG_STATS,
};
pub use scheduler::Scheduler;
pub use signing::{sign_check, sign_quota, sign_report_slot, Fingerprint};
pub use statistics::Statistics;
