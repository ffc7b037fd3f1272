use scylla::transport::errors::NewSessionError;
use scylla::{Session, SessionBuilder};

pub async fn connect(nodes: &[String], keyspace: &str) -> Result<Session, NewSessionError> {
    let session = SessionBuilder::new()
        .known_nodes(nodes)
        .use_keyspace(keyspace, false)
        .build()
        .await?;

    tracing::info!(nodes = ?nodes, keyspace = %keyspace, "connected to ScyllaDB");
    Ok(session)
}
