//! Metrics definitions for the requestor.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REMOTE_CALLS: MetricDef = MetricDef {
    name: "remote.calls",
    metric_type: MetricType::Counter,
    description: "Outbound API calls. Tagged with operation, status.",
};

pub const RATE_LIMIT_REJECTIONS: MetricDef = MetricDef {
    name: "rate_limit.rejections",
    metric_type: MetricType::Counter,
    description: "Number of 429 responses received from the remote API",
};

pub const CIRCUIT_BREAKER_OPENED: MetricDef = MetricDef {
    name: "circuit_breaker.opened",
    metric_type: MetricType::Counter,
    description: "Number of times the circuit breaker forced a global pause",
};

pub const LIMITER_WAIT: MetricDef = MetricDef {
    name: "limiter.wait",
    metric_type: MetricType::Histogram,
    description: "Time spent waiting for a token bucket permit in seconds",
};

pub const BACKOFF_SLEEP: MetricDef = MetricDef {
    name: "retry.backoff",
    metric_type: MetricType::Histogram,
    description: "Backoff sleep before a retried call in seconds. Tagged with operation, reason.",
};

pub const HANDLE_RESOLVED: MetricDef = MetricDef {
    name: "handle.resolved",
    metric_type: MetricType::Counter,
    description: "Handles returned to the pipeline. Tagged with kind, source.",
};

pub const HANDLE_FAILED: MetricDef = MetricDef {
    name: "handle.failed",
    metric_type: MetricType::Counter,
    description: "Entities for which no handle could be obtained. Tagged with kind, reason.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REMOTE_CALLS,
    RATE_LIMIT_REJECTIONS,
    CIRCUIT_BREAKER_OPENED,
    LIMITER_WAIT,
    BACKOFF_SLEEP,
    HANDLE_RESOLVED,
    HANDLE_FAILED,
];
