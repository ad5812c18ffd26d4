use actix_web::{dev::ServerHandle, web, App, HttpServer};
use event_bus::{EventBus, RedisStreamsBus, Subscription};
use realtime_delivery_service::{
    config::Config,
    db,
    error::AppError,
    logging,
    redis_client::RedisClient,
    routes,
    services::{
        CachedSessionResolver, ConversationSynchronizer, MessagePublisher, MessageService,
        PgConversationStore, PgMembershipLookup, PgMessageRepository, PresenceStore,
        RedisPresenceStore,
    },
    state::AppState,
    websocket::{ConnectionRegistry, PresenceAwareFanout},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Unsubscribe fan-out, drain the bus, then stop accepting HTTP traffic.
async fn graceful_shutdown(
    bus: Arc<RedisStreamsBus>,
    fanout: Subscription,
    synchronizer: Subscription,
    presence_refresher: JoinHandle<()>,
    server: ServerHandle,
) {
    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    let name = fanout.name().to_string();
    tracing::info!(subscription = %name, "unsubscribing fan-out consumer");
    if let Err(e) = fanout.unsubscribe().await {
        tracing::warn!(subscription = %name, error = %e, "failed to unsubscribe fan-out consumer");
    }
    let name = synchronizer.name().to_string();
    tracing::info!(subscription = %name, "draining synchronizer");
    if let Err(e) = synchronizer.drain().await {
        tracing::warn!(subscription = %name, error = %e, "failed to drain synchronizer");
    }
    if let Err(e) = bus.drain().await {
        tracing::warn!(error = %e, "failed to drain event bus");
    }
    presence_refresher.abort();

    server.stop(true).await;
    tracing::info!("shutdown complete");
}

/// Re-assert presence for locally connected users before their keys expire.
fn spawn_presence_refresher(
    registry: ConnectionRegistry,
    presence: Arc<dyn PresenceStore>,
    ttl: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval((ttl / 3).max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            let users = registry.online_users();
            if let Err(e) = presence.refresh(&users).await {
                tracing::warn!(error = %e, users = users.len(), "presence refresh failed");
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Arc::new(Config::from_env()?);

    let db = db::init_pool(
        &cfg.database_url,
        cfg.db_max_connections,
        cfg.db_connect_timeout(),
    )
    .await
    .map_err(|e| AppError::StartServer(format!("db: {e}")))?;
    if cfg.run_migrations {
        db::run_migrations(&db).await?;
    }

    let redis = RedisClient::from_url(&cfg.redis_url)
        .await
        .map_err(|e| AppError::StartServer(format!("redis: {e}")))?;

    let bus = Arc::new(
        RedisStreamsBus::connect(&cfg.redis_url, cfg.instance_id.clone(), cfg.bus_config())
            .await
            .map_err(|e| AppError::StartServer(format!("event bus: {e}")))?,
    );

    let presence: Arc<dyn PresenceStore> = Arc::new(RedisPresenceStore::new(
        redis.clone(),
        cfg.instance_id.clone(),
        cfg.presence_ttl(),
    ));
    let registry = ConnectionRegistry::new(presence.clone());
    let membership = Arc::new(PgMembershipLookup::new(db.clone()));

    let fanout = Arc::new(PresenceAwareFanout::new(
        registry.clone(),
        membership.clone(),
        presence.clone(),
        cfg.fanout_deliver_to_author,
    ))
    .subscribe(bus.as_ref())
    .await
    .map_err(|e| AppError::StartServer(format!("subscribe fan-out: {e}")))?;

    let synchronizer = ConversationSynchronizer::new(
        Arc::new(PgConversationStore::new(db.clone())),
        cfg.pointer_policy,
    )
    .subscribe(bus.as_ref())
    .await
    .map_err(|e| AppError::StartServer(format!("subscribe synchronizer: {e}")))?;

    let messages = Arc::new(MessageService::new(
        Arc::new(PgMessageRepository::new(db.clone())),
        membership,
        MessagePublisher::new(bus.clone()),
    ));

    let state = AppState {
        registry: registry.clone(),
        config: cfg.clone(),
        sessions: Arc::new(CachedSessionResolver::new(redis.clone(), db.clone())),
        messages,
    };

    let presence_refresher = spawn_presence_refresher(registry, presence, cfg.presence_ttl());

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(
        %bind_addr,
        instance_id = %cfg.instance_id,
        pointer_policy = %cfg.pointer_policy,
        "starting realtime-delivery-service"
    );

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .disable_signals()
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind: {e}")))?
    .run();

    tokio::spawn(graceful_shutdown(
        bus,
        fanout,
        synchronizer,
        presence_refresher,
        server.handle(),
    ));

    server
        .await
        .map_err(|e| AppError::StartServer(format!("server: {e}")))
}
