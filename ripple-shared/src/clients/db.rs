use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// Build the Postgres pool with the sizing the owning service configured.
/// The chat send path holds a connection through the save transaction while
/// fan-out work grabs its own, so services size this to their traffic
/// instead of a shared constant.
pub fn create_pool(database_url: &str, max_connections: u32, min_idle: u32) -> DbPool {
    let max_connections = max_connections.max(1);
    let min_idle = min_idle.min(max_connections);

    let pool = Pool::builder()
        .max_size(max_connections)
        .min_idle((min_idle > 0).then_some(min_idle))
        .test_on_check_out(true)
        .build(ConnectionManager::<PgConnection>::new(database_url))
        .expect("failed to create database pool");

    tracing::info!(max_connections, min_idle, "database connection pool created");
    pool
}
