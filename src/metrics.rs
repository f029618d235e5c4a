use crate::runtime::ResourceIdentity;
use crate::Error;
use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry,
};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub queue_depth: IntGaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "app_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "app_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "instance", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("app_operator_reconciliations_total", "reconciliations").unwrap();
        let queue_depth = IntGaugeVec::new(
            opts!(
                "app_operator_queue_depth",
                "identities waiting in the work queue"
            ),
            &["kind"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            queue_depth,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.queue_depth.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: kube::Resource<DynamicType = ()>>(
        &self,
        identity: &ResourceIdentity,
        e: &Error,
    ) {
        self.failures
            .with_label_values(&[
                T::kind(&()).as_ref(),
                identity.to_string().as_ref(),
                e.metric_label(),
            ])
            .inc()
    }

    pub fn set_queue_depth<T: kube::Resource<DynamicType = ()>>(&self, depth: usize) {
        self.queue_depth
            .with_label_values(&[T::kind(&()).as_ref()])
            .set(i64::try_from(depth).unwrap_or(i64::MAX))
    }

    pub fn count_and_measure<T: kube::Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer<T> {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            _resource_type: std::marker::PhantomData,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer<T: kube::Resource<DynamicType = ()>> {
    start: Instant,
    metric: HistogramVec,
    _resource_type: std::marker::PhantomData<T>,
}

impl<T: kube::Resource<DynamicType = ()>> Drop for ReconcileMeasurer<T> {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[T::kind(&()).as_ref()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[test]
    fn failures_are_labelled_by_kind_and_error() {
        let registry = Registry::new();
        let metrics = Metrics::default().register(&registry).unwrap();
        let identity = ResourceIdentity::new("a").within("default");
        metrics.reconcile_failure::<ConfigMap>(&identity, &Error::LeadershipLost);
        metrics.set_queue_depth::<ConfigMap>(3);

        let counter = metrics
            .failures
            .with_label_values(&["ConfigMap", "default/a", "LeadershipLost"]);
        assert_eq!(counter.get(), 1);
        assert_eq!(metrics.queue_depth.with_label_values(&["ConfigMap"]).get(), 3);
        assert!(registry
            .gather()
            .iter()
            .any(|family| family.get_name() == "app_operator_queue_depth"));
    }
}
