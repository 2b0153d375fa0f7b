use tracing_subscriber::{fmt, EnvFilter};

/// Default per-target levels: the service itself logs at info while the
/// chatty layers underneath it stay at warn — sqlx statement logs, the
/// librdkafka client, and tungstenite frame noise. `RUST_LOG` replaces the
/// whole set.
const DEFAULT_DIRECTIVES: &str =
    "info,sqlx=warn,rdkafka=warn,librdkafka=warn,tungstenite=warn,tokio_tungstenite=warn";

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    fmt().with_env_filter(env_filter).with_target(false).init();
}
