//! # Prometheus Metrics
//!
//! Operational metrics for the sandbox, scraped at `/metrics` on the
//! metrics port. Every series carries a `party` label (`maker`, `taker`,
//! `arbitrator`).
//!
//! Counters are fed from the trade and dispute event streams by
//! [`NodeMetrics::record_events`]; nothing in the protocol crate knows
//! about Prometheus.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::warn;

use xmrx_protocol::dispute::coordinator::DisputeEvent;
use xmrx_protocol::trade::TradeEvent;

/// Tasks whose failure means a payout did not match the contract.
const PAYOUT_CHECKING_TASKS: &[&str] = &[
    "SellerProcessPaymentSent",
    "SellerSignAndPublishPayoutTx",
    "BuyerProcessPaymentReceived",
    "ArbitratorProcessPaymentSent",
    "ArbitratorProcessPaymentReceived",
];

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub trades_started_total: IntCounterVec,
    pub trades_closed_total: IntCounterVec,
    /// Trades that hit a verification failure and need a dispute.
    pub trades_failed_total: IntCounterVec,
    pub pipeline_failures_total: IntCounterVec,
    pub deferred_discarded_total: IntCounterVec,
    pub payout_verification_failures_total: IntCounterVec,
    pub disputes_opened_total: IntCounterVec,
    pub active_trades: IntGaugeVec,
    /// `POST /verify-payout` requests that failed a check.
    pub payout_checks_rejected_total: IntCounter,
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).expect("metric creation");
    registry
        .register(Box::new(counter.clone()))
        .expect("metric registration");
    counter
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("xmrx".into()), None)
            .expect("failed to create prometheus registry");

        let trades_started_total = counter_vec(
            &registry,
            "trades_started_total",
            "Trades started, per party",
            &["party"],
        );
        let trades_closed_total = counter_vec(
            &registry,
            "trades_closed_total",
            "Trades that reached Closed",
            &["party"],
        );
        let trades_failed_total = counter_vec(
            &registry,
            "trades_failed_total",
            "Trades escalated after a verification failure",
            &["party"],
        );
        let pipeline_failures_total = counter_vec(
            &registry,
            "pipeline_failures_total",
            "Failed task pipelines, by failing task",
            &["party", "task"],
        );
        let deferred_discarded_total = counter_vec(
            &registry,
            "deferred_discarded_total",
            "Deferred messages discarded after their retry budget",
            &["party"],
        );
        let payout_verification_failures_total = counter_vec(
            &registry,
            "payout_verification_failures_total",
            "Payout transactions that did not match the contract",
            &["party"],
        );
        let disputes_opened_total = counter_vec(
            &registry,
            "disputes_opened_total",
            "Disputes opened, by support type",
            &["party", "support_type"],
        );

        let active_trades = IntGaugeVec::new(
            Opts::new("active_trades", "Open trades with a running actor"),
            &["party"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(active_trades.clone()))
            .expect("metric registration");

        let payout_checks_rejected_total = IntCounter::new(
            "payout_checks_rejected_total",
            "Stateless payout checks that failed",
        )
        .expect("metric creation");
        registry
            .register(Box::new(payout_checks_rejected_total.clone()))
            .expect("metric registration");

        Self {
            registry,
            trades_started_total,
            trades_closed_total,
            trades_failed_total,
            pipeline_failures_total,
            deferred_discarded_total,
            payout_verification_failures_total,
            disputes_opened_total,
            active_trades,
            payout_checks_rejected_total,
        }
    }

    pub fn observe_trade(&self, party: &str, event: &TradeEvent) {
        match event {
            TradeEvent::Started { .. } => {
                self.trades_started_total.with_label_values(&[party]).inc();
                self.active_trades.with_label_values(&[party]).inc();
            }
            TradeEvent::Closed { .. } => {
                self.trades_closed_total.with_label_values(&[party]).inc();
                self.active_trades.with_label_values(&[party]).dec();
            }
            TradeEvent::PipelineFailed { task, .. } => {
                self.pipeline_failures_total
                    .with_label_values(&[party, task])
                    .inc();
            }
            TradeEvent::EscalationRequired { reason, .. } => {
                self.trades_failed_total.with_label_values(&[party]).inc();
                if PAYOUT_CHECKING_TASKS
                    .iter()
                    .any(|task| reason.starts_with(&format!("{task}:")))
                {
                    self.payout_verification_failures_total
                        .with_label_values(&[party])
                        .inc();
                }
            }
            TradeEvent::MessageDiscarded { .. } => {
                self.deferred_discarded_total.with_label_values(&[party]).inc();
            }
            TradeEvent::StateChanged { .. } => {}
        }
    }

    pub fn observe_dispute(&self, party: &str, event: &DisputeEvent) {
        if let DisputeEvent::Opened { support_type, .. } = event {
            self.disputes_opened_total
                .with_label_values(&[party, &support_type.to_string()])
                .inc();
        }
    }

    /// Feeds one party's event streams into the counters until shutdown.
    pub async fn record_events(
        self: Arc<Self>,
        party: &'static str,
        mut trades: broadcast::Receiver<TradeEvent>,
        mut disputes: broadcast::Receiver<DisputeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = trades.recv() => match event {
                    Ok(event) => self.observe_trade(party, &event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(party, missed, "metrics lagged behind trade events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = disputes.recv() => match event {
                    Ok(event) => self.observe_dispute(party, &event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(party, missed, "metrics lagged behind dispute events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
