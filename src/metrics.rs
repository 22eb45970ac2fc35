//! Prometheus metrics.
//!
//! Metrics live in an explicitly owned registry rather than the process-wide
//! default one, so several engines (e.g. in tests) can coexist.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    admissions: IntCounterVec,
    reservations: IntCounterVec,
    reconciles: IntCounterVec,
    events: IntCounterVec,
    registered_nodes: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let admissions = IntCounterVec::new(
            Opts::new("diskio_admissions_total", "Admission decisions by result"),
            &["result"],
        )?;
        let reservations = IntCounterVec::new(
            Opts::new("diskio_reservations_total", "Reserve/unreserve calls by result"),
            &["op", "result"],
        )?;
        let reconciles = IntCounterVec::new(
            Opts::new(
                "diskio_reconciles_total",
                "External record reconciliations by outcome",
            ),
            &["outcome"],
        )?;
        let events = IntCounterVec::new(
            Opts::new("diskio_events_total", "Handled cluster events by kind and outcome"),
            &["kind", "outcome"],
        )?;
        let registered_nodes = IntGauge::new(
            "diskio_registered_nodes",
            "Nodes with a registered bandwidth ledger",
        )?;

        registry.register(Box::new(admissions.clone()))?;
        registry.register(Box::new(reservations.clone()))?;
        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(registered_nodes.clone()))?;

        Ok(Self {
            registry,
            admissions,
            reservations,
            reconciles,
            events,
            registered_nodes,
        })
    }

    pub fn admission(&self, result: &str) {
        self.admissions.with_label_values(&[result]).inc();
    }

    pub fn reservation(&self, op: &str, result: &str) {
        self.reservations.with_label_values(&[op, result]).inc();
    }

    pub fn reconcile(&self, outcome: &str) {
        self.reconciles.with_label_values(&[outcome]).inc();
    }

    pub fn event(&self, kind: &str, outcome: &str) {
        self.events.with_label_values(&[kind, outcome]).inc();
    }

    pub fn set_registered_nodes(&self, count: usize) {
        self.registered_nodes.set(count as i64);
    }

    pub fn reconcile_count(&self, outcome: &str) -> u64 {
        self.reconciles.with_label_values(&[outcome]).get()
    }

    pub fn event_count(&self, kind: &str, outcome: &str) -> u64 {
        self.events.with_label_values(&[kind, outcome]).get()
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
