use actix_web::{web, App, HttpServer};
use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use realtime_delivery_service::{
    config, db,
    delivery::{Dispatcher, EventLogConsumer, MembershipCache, Router},
    error, logging,
    presence::{Presence, PresenceWatcher},
    repository::Repository,
    routes,
    services::{ConversationService, MessageService},
    session::{Registry, SessionServer},
    state::AppState,
};
use redis_utils::RedisPool;
use std::sync::Arc;
use tokio::sync::watch;
use transactional_outbox::{KafkaOutboxPublisher, OutboxMetrics, OutboxRepository, OutboxWorker};

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let db = db::init_pool(&cfg.database_url)
        .await
        .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;
    db::run_migrations(&db)
        .await
        .map_err(|e| error::AppError::StartServer(format!("migrations: {e}")))?;

    // Presence bindings lapse when Redis becomes unreachable, so the
    // connection is kept warm at half the presence TTL.
    let redis_pool = RedisPool::connect(&cfg.redis_url, Some(cfg.presence_ttl / 2))
        .await
        .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;
    let redis = redis_pool.manager();

    // Shutdown fan-out: flipped once on SIGINT, observed by every loop.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let repo = Repository::new(db.clone());
    let outbox_repo = OutboxRepository::new(db.clone());
    let messages = Arc::new(MessageService::new(repo.clone(), outbox_repo.clone()));
    let conversations = Arc::new(ConversationService::new(repo.clone(), outbox_repo.clone()));

    let registry = Arc::new(Registry::new());
    let membership = Arc::new(MembershipCache::new());
    let presence = Arc::new(Presence::new(
        redis.clone(),
        cfg.instance_id.clone(),
        cfg.presence_ttl,
    ));

    // Outbox worker: same-instance publisher for events committed here.
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &cfg.kafka_brokers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("max.in.flight.requests.per.connection", "5")
        .create()
        .map_err(|e| error::AppError::StartServer(format!("kafka producer: {e}")))?;
    let publisher = Arc::new(KafkaOutboxPublisher::new(producer, cfg.kafka_topic.clone()));
    let outbox_metrics = OutboxMetrics::new(prometheus::default_registry())
        .map_err(|e| error::AppError::StartServer(format!("outbox metrics: {e}")))?;
    let outbox_worker = OutboxWorker::new(
        outbox_repo.clone(),
        publisher,
        cfg.outbox_batch_size,
        cfg.outbox_poll_delay,
        cfg.outbox_max_retries,
    )
    .with_metrics(outbox_metrics);
    let worker_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        outbox_worker.run(worker_shutdown).await;
    });

    // Delivery side: dispatcher fed by the event log and the instance bus.
    let router = Arc::new(Router::new(
        redis.clone(),
        redis_pool.client(),
        cfg.instance_id.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&membership),
        presence.clone(),
        router.clone(),
        conversations.clone(),
        cfg.instance_id.clone(),
    ));

    let bus_dispatcher = Arc::clone(&dispatcher);
    router.subscribe(
        move |payload| {
            let dispatcher = Arc::clone(&bus_dispatcher);
            async move { dispatcher.deliver_remote(&payload).await }
        },
        shutdown_rx.clone(),
    );

    let consumer = EventLogConsumer::new(
        &cfg.kafka_brokers,
        &cfg.kafka_consumer_topics,
        Arc::clone(&dispatcher),
    )?;
    let consumer_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        consumer.run(consumer_shutdown).await;
    });

    PresenceWatcher::new(
        redis_pool.client(),
        Arc::clone(&registry),
        Arc::clone(&membership),
    )
    .start(shutdown_rx.clone());

    // WebSocket session listener.
    let session_server = Arc::new(SessionServer::new(
        Arc::clone(&registry),
        Arc::clone(&presence),
        Arc::clone(&conversations),
        Arc::clone(&messages),
        Arc::clone(&cfg),
    ));
    let session_shutdown = shutdown_rx.clone();
    let session_handle = tokio::spawn(async move {
        if let Err(e) = session_server.run(session_shutdown).await {
            tracing::error!(error = %e, "session listener failed");
        }
    });

    let state = AppState {
        db,
        redis,
        config: Arc::clone(&cfg),
        messages,
        conversations,
        presence,
        registry: Arc::clone(&registry),
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.http_port);
    tracing::info!(%bind_addr, instance_id = %cfg.instance_id, "starting realtime-delivery-service");

    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure_routes)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("http bind: {e}")))?
    .shutdown_timeout(10)
    .run();

    let http_result = http_server.await;

    registry.close_all();
    let _ = session_handle.await;

    http_result.map_err(|e| error::AppError::StartServer(format!("http server: {e}")))
}
