use crate::migration::MigrationKind;
use once_cell::sync::Lazy;
use opentelemetry::{
    metrics::{Counter, Histogram, MeterProvider as _},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use std::time::Duration;

pub static METRICS: Lazy<MigrationMetrics> = Lazy::new(MigrationMetrics::init);

pub struct MigrationMetrics {
    pub registry: Registry,
    pub migrations_applied: Counter<u64>,
    pub migrations_failed: Counter<u64>,
    pub migration_duration: Histogram<f64>,
    pub lock_wait_duration: Histogram<f64>,
    pub lock_steals: Counter<u64>,
    // Dropping the provider shuts the instruments down
    _provider: SdkMeterProvider,
}

impl MigrationMetrics {
    pub fn init() -> Self {
        let registry = Registry::new();
        let provider = match opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
        {
            Ok(exporter) => SdkMeterProvider::builder().with_reader(exporter).build(),
            Err(e) => {
                log::warn!(
                    "Prometheus exporter unavailable, migration metrics are not exported: {e}"
                );
                SdkMeterProvider::builder().build()
            }
        };
        let meter = provider.meter("cassandra_migration");

        let migrations_applied = meter.u64_counter("cassandra_migration_applied_total")
            .with_description("Migrations applied successfully").build();

        let migrations_failed = meter.u64_counter("cassandra_migration_failed_total")
            .with_description("Migrations that failed while executing").build();

        let migration_duration = meter.f64_histogram("cassandra_migration_duration_seconds")
            .with_description("Time spent executing a single migration").build();

        let lock_wait_duration = meter.f64_histogram("cassandra_migration_lock_wait_seconds")
            .with_description("Time spent waiting for the migration lock").build();

        let lock_steals = meter.u64_counter("cassandra_migration_lock_steals_total")
            .with_description("Stale migration locks taken over from crashed holders").build();

        Self {
            registry,
            migrations_applied,
            migrations_failed,
            migration_duration,
            lock_wait_duration,
            lock_steals,
            _provider: provider,
        }
    }

    pub fn record_applied(&self, kind: MigrationKind, elapsed: Duration) {
        let attributes = [KeyValue::new("type", kind.as_str())];
        self.migrations_applied.add(1, &attributes);
        self.migration_duration.record(elapsed.as_secs_f64(), &attributes);
    }

    pub fn record_failed(&self, kind: MigrationKind, elapsed: Duration) {
        let attributes = [KeyValue::new("type", kind.as_str())];
        self.migrations_failed.add(1, &attributes);
        self.migration_duration.record(elapsed.as_secs_f64(), &attributes);
    }

    pub fn observe_lock_wait(&self, waited: Duration, stolen: bool) {
        self.lock_wait_duration.record(waited.as_secs_f64(), &[]);
        if stolen {
            self.lock_steals.add(1, &[]);
        }
    }

    /// Prometheus text exposition of every migration metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            log::warn!("Failed to encode migration metrics: {e}");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
