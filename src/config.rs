use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    /// REST API + health/metrics.
    pub http_port: u16,
    /// WebSocket session listener.
    pub session_port: u16,
    pub kafka_brokers: String,
    /// Topic the outbox worker produces to.
    pub kafka_topic: String,
    /// Topics the delivery dispatcher consumes.
    pub kafka_consumer_topics: Vec<String>,
    pub instance_id: String,
    /// When unset, the session handshake skips token validation (gateway-only
    /// deployments terminate auth upstream).
    pub jwt: Option<JwtConfig>,
    pub session_queue_size: usize,
    pub heartbeat_interval: Duration,
    pub presence_ttl: Duration,
    pub outbox_batch_size: i32,
    pub outbox_max_retries: i32,
    pub outbox_poll_delay: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| crate::error::AppError::Config("DATABASE_URL missing".into()))?;
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let http_port = env_parse("HTTP_PORT", 8080);
        let session_port = env_parse("PORT", 8090);

        let kafka_brokers =
            env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".into());
        let kafka_topic =
            env::var("KAFKA_TOPIC").unwrap_or_else(|_| "messaging.events".into());
        let kafka_consumer_topics = env::var("KAFKA_CONSUMER_TOPICS")
            .unwrap_or_else(|_| kafka_topic.clone())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let instance_id = env::var("INSTANCE_ID").ok().filter(|s| !s.is_empty()).unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| format!("instance-{}", uuid::Uuid::new_v4()))
        });

        let jwt = env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()).map(|secret| JwtConfig {
            secret,
            issuer: env::var("JWT_ISSUER").ok().filter(|s| !s.is_empty()),
            audience: env::var("JWT_AUDIENCE").ok().filter(|s| !s.is_empty()),
        });

        let presence_ttl = Duration::from_secs(env_parse("PRESENCE_TTL_SECS", 60u64));
        // Presence bindings are refreshed at a third of the TTL so two
        // refreshes can be missed before the binding lapses.
        let heartbeat_interval = Duration::from_secs(env_parse(
            "HEARTBEAT_INTERVAL_SECS",
            (presence_ttl.as_secs() / 3).max(1),
        ));

        Ok(Self {
            database_url,
            redis_url,
            http_port,
            session_port,
            kafka_brokers,
            kafka_topic,
            kafka_consumer_topics,
            instance_id,
            jwt,
            session_queue_size: env_parse("SESSION_QUEUE_SIZE", 128usize),
            heartbeat_interval,
            presence_ttl,
            outbox_batch_size: env_parse("OUTBOX_BATCH_SIZE", 100i32),
            outbox_max_retries: env_parse("OUTBOX_MAX_RETRIES", 3i32),
            outbox_poll_delay: Duration::from_millis(env_parse("OUTBOX_POLL_DELAY_MS", 500u64)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        env::set_var("TEST_ENV_PARSE_PORT", "not-a-number");
        assert_eq!(env_parse("TEST_ENV_PARSE_PORT", 8080u16), 8080);
        env::remove_var("TEST_ENV_PARSE_PORT");
    }

    #[test]
    fn config_defaults_without_optional_vars() {
        env::set_var("DATABASE_URL", "postgres://localhost/chat");
        env::remove_var("JWT_SECRET");
        env::remove_var("SESSION_QUEUE_SIZE");
        env::remove_var("PRESENCE_TTL_SECS");
        env::remove_var("HEARTBEAT_INTERVAL_SECS");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.session_queue_size, 128);
        assert_eq!(cfg.presence_ttl, Duration::from_secs(60));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(cfg.outbox_batch_size, 100);
        assert_eq!(cfg.outbox_max_retries, 3);
        assert!(cfg.jwt.is_none());
        assert!(!cfg.instance_id.is_empty());
    }
}
