//! Core domain models and shared plumbing.
//!
//! This module holds the pieces every subsystem leans on: the error type,
//! configuration, the injectable clock, and the operation/metric data model.

pub mod config;
pub mod error;
pub mod ticker;
pub mod types;

// Re-export commonly used types
pub use config::{
    CheckAggregationConfig, ClientConfig, ClientConfigBuilder, QuotaAggregationConfig,
    ReportAggregationConfig, DO_NOT_LOG_STATS,
};
pub use error::{Result, TollgateError};
pub use ticker::{ManualTicker, SystemTicker, Ticker};
pub use types::{
    AllocateQuotaRequest, AllocateQuotaResponse, CheckError, CheckRequest, CheckResponse,
    Distribution, Importance, Labels, MetricKind, MetricValue, MetricValueSet, Operation,
    OperationBuilder, QuotaError, ReportRequest, Timestamp,
};
