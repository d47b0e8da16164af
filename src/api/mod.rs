//! HTTP API Module
//!
//! Provides a REST API for pool, node and mesh management.

mod http;

pub use http::{
    ApplyErrorResponse, AssignRequest, CreatePoolRequest, ErrorResponse, HealthResponse,
    HttpServer, ReleaseResponse,
};
