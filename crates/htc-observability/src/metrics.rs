//! Prometheus metrics definitions and registry

use std::sync::Arc;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

/// Metrics registry for the controller, shared by every component.
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Arc<Registry>,

    /// Total reconcile cycles
    pub reconciliations_total: IntCounter,
    /// Reconcile cycles that ended in an error, by stage
    pub reconciliation_errors_total: IntCounterVec,
    /// Reconcile cycle duration
    pub reconciliation_duration_seconds: HistogramVec,

    /// Per-pod deployments by outcome
    pub deployments_total: IntCounterVec,
    /// Per-pod deployment errors
    pub deployment_errors_total: IntCounterVec,
    /// Per-pod deployment duration
    pub deployment_duration_seconds: HistogramVec,

    /// Validation attempts
    pub validations_total: IntCounter,
    /// Validation failures by phase
    pub validation_errors_total: IntCounterVec,

    /// Entries per watched-resource alias
    pub resource_count: IntGaugeVec,

    /// Live event-bus subscribers
    pub event_bus_subscribers: IntGauge,
    /// Events published over the bus
    pub events_published_total: IntCounter,

    /// 1 while this replica holds the lease
    pub is_leader: IntGauge,
}

impl ControllerMetrics {
    /// Create and register all metrics on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounter::with_opts(Opts::new(
            "htc_reconciliations_total",
            "Total number of reconcile cycles",
        ))?;
        let reconciliation_errors_total = IntCounterVec::new(
            Opts::new(
                "htc_reconciliation_errors_total",
                "Reconcile cycles that failed, by pipeline stage",
            ),
            &["stage"],
        )?;
        let reconciliation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "htc_reconciliation_duration_seconds",
                "Duration of reconcile cycles",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["stage"],
        )?;

        let deployments_total = IntCounterVec::new(
            Opts::new("htc_deployments_total", "Per-pod deployments by outcome"),
            &["pod", "outcome"],
        )?;
        let deployment_errors_total = IntCounterVec::new(
            Opts::new("htc_deployment_errors_total", "Per-pod deployment errors"),
            &["pod"],
        )?;
        let deployment_duration_seconds = HistogramVec::new(
            HistogramOpts::new("htc_deployment_duration_seconds", "Per-pod sync duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["pod"],
        )?;

        let validations_total = IntCounter::with_opts(Opts::new(
            "htc_validations_total",
            "Total validation attempts",
        ))?;
        let validation_errors_total = IntCounterVec::new(
            Opts::new("htc_validation_errors_total", "Validation failures by phase"),
            &["phase"],
        )?;

        let resource_count = IntGaugeVec::new(
            Opts::new("htc_resource_count", "Stored entries per watched-resource alias"),
            &["alias"],
        )?;

        let event_bus_subscribers = IntGauge::with_opts(Opts::new(
            "htc_event_bus_subscribers",
            "Live event bus subscribers",
        ))?;
        let events_published_total = IntCounter::with_opts(Opts::new(
            "htc_events_published_total",
            "Events published over the bus",
        ))?;

        let is_leader = IntGauge::with_opts(Opts::new(
            "htc_is_leader",
            "1 while this replica holds the leadership lease",
        ))?;

        registry.register(Box::new(reconciliations_total.clone()))?;
        registry.register(Box::new(reconciliation_errors_total.clone()))?;
        registry.register(Box::new(reconciliation_duration_seconds.clone()))?;
        registry.register(Box::new(deployments_total.clone()))?;
        registry.register(Box::new(deployment_errors_total.clone()))?;
        registry.register(Box::new(deployment_duration_seconds.clone()))?;
        registry.register(Box::new(validations_total.clone()))?;
        registry.register(Box::new(validation_errors_total.clone()))?;
        registry.register(Box::new(resource_count.clone()))?;
        registry.register(Box::new(event_bus_subscribers.clone()))?;
        registry.register(Box::new(events_published_total.clone()))?;
        registry.register(Box::new(is_leader.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            reconciliations_total,
            reconciliation_errors_total,
            reconciliation_duration_seconds,
            deployments_total,
            deployment_errors_total,
            deployment_duration_seconds,
            validations_total,
            validation_errors_total,
            resource_count,
            event_bus_subscribers,
            events_published_total,
            is_leader,
        })
    }

    /// The underlying registry, for the exporter.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished deployment attempt.
    pub fn record_deployment(&self, pod: &str, outcome: &str, duration_seconds: f64) {
        self.deployments_total.with_label_values(&[pod, outcome]).inc();
        self.deployment_duration_seconds.with_label_values(&[pod]).observe(duration_seconds);
    }

    /// Record a per-pod deployment error.
    pub fn record_deployment_error(&self, pod: &str) {
        self.deployment_errors_total.with_label_values(&[pod]).inc();
    }

    /// Record a validation failure in one phase.
    pub fn record_validation_error(&self, phase: &str) {
        self.validation_errors_total.with_label_values(&[phase]).inc();
    }

    /// Update the stored-entry gauge for one alias.
    pub fn set_resource_count(&self, alias: &str, count: i64) {
        self.resource_count.with_label_values(&[alias]).set(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_collisions() {
        use prometheus::{Encoder, TextEncoder};

        let metrics = ControllerMetrics::new().unwrap();
        metrics.reconciliations_total.inc();
        metrics.record_deployment("haproxy-0", "applied", 0.25);
        metrics.record_validation_error("schema");
        metrics.set_resource_count("ingresses", 3);
        metrics.is_leader.set(1);

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metrics.registry().gather(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("htc_reconciliations_total 1"));
        assert!(text.contains("htc_is_leader 1"));
        assert!(text.contains("htc_resource_count{alias=\"ingresses\"} 3"));
    }

    #[test]
    fn two_instances_use_independent_registries() {
        let a = ControllerMetrics::new().unwrap();
        let b = ControllerMetrics::new().unwrap();
        a.reconciliations_total.inc();
        assert_eq!(b.reconciliations_total.get(), 0);
    }
}
