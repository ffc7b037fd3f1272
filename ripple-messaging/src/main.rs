use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

mod cache;
mod config;
mod crypto;
mod domain;
mod events;
mod ids;
mod models;
mod repository;
mod routes;
mod schema;

use config::AppConfig;
use ripple_shared::clients::db::{create_pool, DbPool};
use ripple_shared::clients::push::PushClient;
use ripple_shared::clients::rabbitmq::BrokerClient;
use ripple_shared::clients::redis::RedisClient;

use cache::RoomCache;
use crypto::MessageCipher;
use events::dispatcher::EventDispatcher;
use events::stream::StreamManager;
use repository::{ChatRepository, PgChatRepository, ScyllaChatRepository};

const FANOUT_WORKERS: usize = 5;

pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub redis: RedisClient,
    pub broker: BrokerClient,
    pub push: PushClient,
    pub cipher: Arc<MessageCipher>,
    pub repository: Arc<dyn ChatRepository>,
    pub dispatcher: EventDispatcher,
    pub stream_manager: Arc<StreamManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ripple_shared::middleware::init_tracing("ripple-messaging");

    let config = AppConfig::load()?;
    let port = config.port;

    let db = create_pool(&config.database_url, config.db_pool_size, config.db_min_idle);
    let redis = RedisClient::connect(&config.redis_url).await?;
    let broker = BrokerClient::connect(&config.rabbitmq_url).await?;
    let push = PushClient::new(&config.notifications_url);

    let cipher = Arc::new(
        MessageCipher::new(&config.chat_master_key, &config.chat_master_iv)
            .map_err(|e| anyhow::anyhow!("invalid master key material: {e}"))?,
    );
    let cache = RoomCache::new(redis.clone());

    let pg_repository = PgChatRepository::new(db.clone(), cache.clone(), cipher.clone());
    let repository: Arc<dyn ChatRepository> = if config.use_wide_column {
        let session = ripple_shared::clients::scylla::connect(
            &config.scylla_node_list(),
            &config.scylla_keyspace,
        )
        .await?;
        Arc::new(ScyllaChatRepository::new(
            Arc::new(session),
            Arc::new(pg_repository),
            cache,
            cipher.clone(),
        ))
    } else {
        Arc::new(pg_repository)
    };

    let dispatcher = EventDispatcher::new(broker.clone(), FANOUT_WORKERS);
    let stream_manager = Arc::new(StreamManager::new());

    let state = Arc::new(AppState {
        config,
        db,
        redis,
        broker,
        push,
        cipher,
        repository,
        dispatcher,
        stream_manager,
    });

    let app = Router::new()
        // Health
        .route("/health", get(routes::health::health_check))
        // Rooms
        .route(
            "/chat/rooms",
            get(routes::rooms::get_rooms).post(routes::rooms::create_room),
        )
        .route(
            "/chat/rooms/:id",
            get(routes::rooms::get_room).put(routes::rooms::update_room),
        )
        .route("/chat/rooms/:id/leave", post(routes::rooms::leave_room))
        .route(
            "/chat/rooms/:id/participants",
            get(routes::rooms::get_room_participants)
                .post(routes::rooms::add_participant_to_room)
                .put(routes::rooms::update_participant_room),
        )
        .route("/chat/rooms/:id/pin", post(routes::rooms::pin_room))
        .route("/chat/rooms/:id/mute", post(routes::rooms::mute_room))
        .route("/chat/rooms/:id/block", post(routes::rooms::block_user))
        .route(
            "/chat/rooms/:id/messages",
            get(routes::messages::get_message_history),
        )
        // Messages
        .route(
            "/chat/messages",
            post(routes::messages::send_message).put(routes::messages::edit_message),
        )
        .route("/chat/messages/delete", post(routes::messages::delete_message))
        .route("/chat/messages/read", post(routes::messages::mark_messages_as_read))
        .route(
            "/chat/messages/reactions",
            post(routes::messages::react_to_message),
        )
        .route(
            "/chat/messages/sender/:sender_message_id",
            get(routes::messages::get_sender_message),
        )
        .route("/chat/messages/:id", get(routes::messages::get_message))
        .route(
            "/chat/messages/:id/reads",
            get(routes::messages::get_message_read),
        )
        .route(
            "/chat/messages/:id/reactions",
            get(routes::messages::get_message_reactions),
        )
        // Sync & streaming
        .route("/chat/sync", get(routes::sync::initial_sync))
        .route("/chat/stream", get(routes::stream::stream_messages))
        // Tokens
        .route("/chat/tokens", post(routes::tokens::save_token))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "ripple-messaging starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
