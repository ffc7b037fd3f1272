pub mod db;
pub mod push;
pub mod rabbitmq;
pub mod redis;
pub mod scylla;
