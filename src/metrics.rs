use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

pub static WS_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "delivery_ws_connections",
        "Open WebSocket sessions on this instance",
    )
    .expect("create delivery_ws_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("register delivery_ws_connections");
    gauge
});

/// Route label: "local" (sent to a session), "buffered" (parked during
/// resume), "remote" (forwarded on the bus).
pub static EVENTS_DISPATCHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "delivery_events_dispatched_total",
            "Events routed by the dispatcher",
        ),
        &["route"],
    )
    .expect("create delivery_events_dispatched_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("register delivery_events_dispatched_total");
    counter
});

pub static MESSAGES_SENT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "messaging_messages_sent_total",
        "Messages committed by the send pipeline",
    )
    .expect("create messaging_messages_sent_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("register messaging_messages_sent_total");
    counter
});

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
