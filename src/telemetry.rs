use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;

pub struct Metrics {
    request_counter: Counter<u64>,
    detection_duration: Histogram<u64>,
    objects_detected: Counter<u64>,
    images_saved: Counter<u64>,
    model_loads: Counter<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("cropbox_server");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        // CPU inference on a 640 input sits between tens of ms and a few seconds.
        let boundaries = latency_boundaries([10, 50, 250, 1000, 5000], [10, 25, 125, 1000]);

        let detection_duration = meter
            .u64_histogram("detection_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of decode and inference in milliseconds")
            .build();

        let objects_detected = meter
            .u64_counter("objects_detected_total")
            .with_description("Objects detected, by label")
            .build();

        let images_saved = meter
            .u64_counter("images_saved_total")
            .with_description("Images persisted by the upload endpoint")
            .build();

        let model_loads = meter
            .u64_counter("model_loads_total")
            .with_description("Model load attempts, by outcome")
            .build();

        Ok(Metrics {
            request_counter,
            detection_duration,
            objects_detected,
            images_saved,
            model_loads,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_detection_duration(&self, duration_ms: u64) {
        self.detection_duration.record(duration_ms, &[]);
    }

    pub fn record_object(&self, label: &str) {
        let attributes = vec![KeyValue::new("object", label.to_string())];
        self.objects_detected.add(1, &attributes);
    }

    pub fn record_image_saved(&self) {
        self.images_saved.add(1, &[]);
    }

    pub fn record_model_load(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        let attributes = vec![KeyValue::new("outcome", outcome)];
        self.model_loads.add(1, &attributes);
    }
}

/// Histogram edges stepping by `steps[i]` ms between `edges[i]` and
/// `edges[i + 1]`. Edges must ascend and steps must be non-zero.
fn latency_boundaries(edges: [u64; 5], steps: [u64; 4]) -> Vec<f64> {
    let mut boundaries: Vec<u64> = edges
        .windows(2)
        .zip(steps)
        .flat_map(|(range, step)| (range[0]..=range[1]).step_by(step as usize))
        .collect();
    boundaries.dedup();
    boundaries.into_iter().map(|b| b as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_boundaries() {
        let boundaries = latency_boundaries([10, 50, 250, 1000, 5000], [10, 25, 125, 1000]);
        let expected = vec![
            10., 20., 30., 40., 50., 75., 100., 125., 150., 175., 200., 225., 250., 375., 500.,
            625., 750., 875., 1000., 2000., 3000., 4000., 5000.,
        ];

        assert_eq!(boundaries, expected);
    }

    #[test]
    fn test_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/health");
        metrics.record_image_saved();

        let families = metrics.registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.iter().any(|n| n.starts_with("requests")));
        assert!(names.iter().any(|n| n.starts_with("images_saved")));
    }
}
