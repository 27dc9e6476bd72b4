//! API Module
//!
//! HTTP handlers and routing for the cache server REST API.
//!
//! # Endpoints
//! - `PUT /set` - Store a value with a TTL and buckets
//! - `GET /get/:key` - Retrieve a value by key
//! - `POST /purge` - Invalidate buckets
//! - `GET /stats` - Get keyspace statistics
//! - `GET /health` - Health check endpoint
//! - `GET /gc` - Garbage collector state

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
