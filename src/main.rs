//! # Anthromux - Anthropic to OpenAI Proxy Server
//!
//! A high-performance reverse proxy that accepts Anthropic Messages API
//! requests and forwards them to an OpenAI-compatible Chat Completions
//! upstream, translating both directions so a client speaking Anthropic's
//! wire format can consume an OpenAI-compatible service transparently.
//!
//! ## Features
//!
//! - **Anthropic-compatible API**: Drop-in `/v1/messages` endpoint
//! - **Tool/Function Calling**: Bidirectional tool call translation,
//!   including tool calls embedded in free text
//! - **Streaming Support**: Strict Anthropic SSE event sequences fabricated
//!   from any upstream shape
//! - **Rate-limit Hygiene**: 449 and textual rate-limit signals collapsed
//!   onto 429 with retry headers, plus retry with backoff
//! - **Request Coalescing**: Duplicate non-streaming requests answered from
//!   a TTL cache
//! - **Configurable Logging**: Structured logging with tracing
//!
//! ## Quick Start
//!
//! ```bash
//! export ANTHROMUX_UPSTREAM_BASE_URL=https://api.openai.com/v1
//! export ANTHROMUX_UPSTREAM_API_KEY=sk-...
//! anthromux
//! ```
//!
//! ## API Usage
//!
//! ```bash
//! curl -X POST http://localhost:8080/v1/messages \
//!   -H "Content-Type: application/json" \
//!   -d '{
//!     "model": "claude-3-haiku-20240307",
//!     "max_tokens": 100,
//!     "messages": [{"role": "user", "content": "Hello!"}]
//!   }'
//! ```
//!
//! ## License
//!
//! Licensed under either of Apache License, Version 2.0 or MIT license at your option.
//!
//! Authors: Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp
//!

/* --- uses ------------------------------------------------------------------------------------ */

use std::env;

use tracing::info;

use anthromux::config::Config;
use anthromux::create_app;
use anthromux::error::{ProxyError, Result};

/* --- constants ------------------------------------------------------------------------------ */

/** the version as defined in cargo.toml */
const VERSION: &str = env!("CARGO_PKG_VERSION");

/* --- start of code -------------------------------------------------------------------------- */

///
/// Main application entry point for the Anthromux proxy server.
///
/// Initializes logging, loads configuration, creates the application
/// state, and starts the HTTP server with proper routing and middleware.
#[tokio::main]
async fn main() {
    // Load .env if present; optional, so failures are not fatal.
    if let Err(e) = dotenvy::dotenv() {
        if std::path::Path::new(".env").exists() {
            eprintln!("Warning: Could not load .env file: {}", e);
        }
    }

    if let Some(exit_code) = handle_cli_args() {
        std::process::exit(exit_code);
    }

    if let Err(e) = run().await {
        let error_msg = format!("{}", e);
        eprintln!("Error:");
        for line in error_msg.lines() {
            eprintln!("{}", line);
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::load()?;
    initialize_logging(&config);

    let app = create_app(config.clone())?;

    start_server(&config, app).await
}

///
/// Handle command line arguments before config loading.
///
/// This ensures these commands work even without proper configuration.
/// Returns Some(exit_code) if the program should exit, None to continue.
fn handle_cli_args() -> Option<i32> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return None;
    }

    match args[1].as_str() {
        "--version" | "-V" => {
            println!("anthromux {}", VERSION);
            Some(0)
        }
        "--help" | "-h" => {
            print_help();
            Some(0)
        }
        "validate" => Some(run_validate()),
        "example-config" => {
            print!("{}", Config::example_toml());
            Some(0)
        }
        _ => {
            if args[1].starts_with('-') {
                eprintln!("Error: Unknown option: {}", args[1]);
            } else {
                eprintln!("Error: Unknown command: {}", args[1]);
            }
            eprintln!();
            print_help();
            Some(1)
        }
    }
}

///
/// Print help information for the Anthromux CLI.
fn print_help() {
    println!("Anthromux v{}", VERSION);
    println!("Reverse proxy translating Anthropic Messages API requests to OpenAI upstreams");
    println!();
    println!("USAGE:");
    println!("    anthromux [COMMAND] [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    validate            Validate configuration and exit");
    println!("    example-config      Print an example config.toml");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help          Print help information");
    println!("    -V, --version       Print version information");
    println!();
    println!("CONFIGURATION:");
    println!("    Anthromux loads configuration from, in ascending priority:");
    println!("    1. Built-in defaults");
    println!("    2. System config file (/etc/anthromux/config.toml)");
    println!("    3. User config file (~/.config/anthromux/config.toml)");
    println!("    4. Environment variables (ANTHROMUX_* prefix)");
    println!();
    println!("ENVIRONMENT VARIABLES:");
    println!("    ANTHROMUX_CONFIG_FILE              Custom config file path (~ expands)");
    println!("    ANTHROMUX_SERVER_PORT              Server port (default: 8080)");
    println!("    ANTHROMUX_SERVER_LOG_LEVEL         trace, debug, info, warn, error");
    println!("    ANTHROMUX_UPSTREAM_BASE_URL        e.g. https://api.openai.com/v1");
    println!("    ANTHROMUX_UPSTREAM_API_KEY         Bearer key for the upstream");
    println!("    ANTHROMUX_RETRY_MAX_ATTEMPTS       Rate-limit retries (default: 3)");
    println!("    ANTHROMUX_STREAMING_PACING_DELAY_MS  Event pacing, 0-50 (default: 0)");
    println!("    ANTHROMUX_COALESCE_TTL_SECS        Duplicate-request TTL (default: 300)");
    println!();
    println!("    OPENAI_BASE_URL / OPENAI_API_KEY are honoured as legacy fallbacks.");
    println!();
    println!("EXAMPLES:");
    println!("    anthromux                   Start the proxy server");
    println!("    anthromux validate          Validate configuration and exit");
    println!("    anthromux example-config > ~/.config/anthromux/config.toml");
}

///
/// Run the validate command to validate configuration and exit.
///
/// Returns exit code 0 if valid, 1 if invalid.
fn run_validate() -> i32 {
    match Config::load() {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  Server port: {}", config.server.port);
            println!("  Log level: {:?}", config.server.log_level);
            println!("  Upstream: {}", config.upstream.base_url);
            println!("  Model mappings: {}", config.model_mappings.len());
            0
        }
        Err(e) => {
            println!("Configuration validation failed:");
            println!("{}", e);
            1
        }
    }
}

///
/// Initialize logging based on configuration settings.
///
/// # Arguments
///  * `config` - application configuration containing log level settings
fn initialize_logging(config: &Config) {
    let level = config.server.log_level.to_tracing_level();

    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();
}

///
/// Start the HTTP server and log startup information.
///
/// Binds to the configured port and starts serving requests. Logs
/// important information about the server configuration and available
/// endpoints.
///
/// # Arguments
///  * `config` - application configuration
///  * `app` - configured Axum application
///
/// # Returns
///  * `Ok(())` when server shuts down gracefully
///  * `ProxyError` if server binding or startup fails
async fn start_server(config: &Config, app: axum::Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .map_err(|e| {
            let error_msg = format!("Failed to bind to port {}: {}", config.server.port, e);

            let error_str = e.to_string();
            if error_str.to_lowercase().contains("address already in use") {
                ProxyError::Config(format!(
                    "{}\n\n\
                     Port {} is already in use. Here are some solutions:\n\n\
                     1. Close the other instance:\n\
                        • Find the process using port {}:\n\
                          lsof -i :{}\n\
                        • Kill the process:\n\
                          kill -9 <PID>\n\n\
                     2. Change the port:\n\
                        export ANTHROMUX_SERVER_PORT={}\n\
                        anthromux",
                    error_msg,
                    config.server.port,
                    config.server.port,
                    config.server.port,
                    config.server.port + 1
                ))
            } else {
                ProxyError::Config(format!(
                    "{}\n\n\
                     To fix this:\n\
                     • Check if the port is valid (1-65535)\n\
                     • Ensure you have permission to bind to the port\n\
                     • Try a different port: export ANTHROMUX_SERVER_PORT=8081",
                    error_msg
                ))
            }
        })?;

    log_startup_info(config);

    axum::serve(listener, app)
        .await
        .map_err(|e| ProxyError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

///
/// Log startup information and configuration details.
///
/// # Arguments
///  * `config` - application configuration
fn log_startup_info(config: &Config) {
    info!("Anthromux v{} running on port {}", VERSION, config.server.port);
    info!("Anthropic-compatible endpoint: http://localhost:{}/v1/messages", config.server.port);
    info!("Forwarding to upstream: {}", config.upstream.base_url);

    if config.server.log_level.is_trace_enabled() {
        info!(
            "[TRACE] Trace logging is ENABLED (log_level={:?}) - request and conversion details \
       will be logged",
            config.server.log_level
        );
    }
}
