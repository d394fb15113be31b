//! # Anthromux - Anthropic to OpenAI Proxy Library
//!
//! This crate provides a high-performance reverse proxy that accepts
//! requests in the Anthropic Messages API dialect and forwards them to an
//! OpenAI-compatible Chat Completions upstream, translating both
//! directions. While primarily designed as a binary application, this
//! library exposes its core functionality for programmatic use.
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use anthromux::{Config, create_app};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load configuration
//!     let config = Config::load()?;
//!
//!     // Create the application
//!     let app = create_app(config)?;
//!
//!     // Start server
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`] - Configuration management and environment variable handling
//! - [`server`] - HTTP server setup and route handlers
//! - [`converter`] - Format conversion between Anthropic and OpenAI formats
//! - [`sse`] - Anthropic SSE event stream fabrication
//! - [`upstream`] - Outbound HTTP adapter with retry/backoff
//! - [`coalesce`] - Duplicate-request coalescing
//! - [`error`] - Error types and classification

pub mod coalesce;
pub mod config;
pub mod converter;
pub mod error;
pub mod server;
pub mod sse;
pub mod upstream;

// Re-export commonly used types
pub use config::Config;
pub use error::ProxyError;

/// Creates a new Anthromux application with the given configuration.
///
/// This is a convenience function that sets up the full application stack
/// including routing and middleware.
///
/// # Arguments
///
/// * `config` - Application configuration
///
/// # Returns
///
/// Returns an Axum Router that can be served directly.
///
/// # Errors
///
/// Returns a `ProxyError` if the outbound client cannot be constructed or
/// other initialization issues occur.
///
/// # Examples
///
/// ```rust,no_run
/// use anthromux::{Config, create_app};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::load()?;
///     let app = create_app(config)?;
///
///     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
///     axum::serve(listener, app).await?;
///     Ok(())
/// }
/// ```
pub fn create_app(config: Config) -> Result<axum::Router, ProxyError> {
    use std::sync::Arc;

    use axum::Router;
    use axum::routing::{get, post};
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    let app_state = Arc::new(server::AppState::new(config)?);

    Ok(Router::new()
        .route("/v1/messages", post(server::messages))
        .route("/v1/messages/count_tokens", post(server::count_tokens))
        .route("/v1/models", get(server::models))
        .route("/health", get(server::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state))
}
