pub mod auth;
pub mod compactor;
pub mod config;
pub mod credential;
pub mod engine;
pub mod guard;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod observability;
pub mod password;
pub mod service;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
