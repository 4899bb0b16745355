//! # Log Relay
//!
//! Accepts batches of log entries over HTTP and republishes every entry as an individual message
//! onto a Google Cloud Pub/Sub topic.
//!
//! ```text
//! POST /  {"api_token": "...", "logs": [{"type": "...", "attributes": {...}}, ...]}
//! ```
//!
//! Each entry of `logs` is serialized back to JSON and published synchronously, in input order.
//! The first failure aborts the batch and is reported to the caller.
//!
//! ## Modules
//!
//! - [`config`] - Startup configuration read from the environment
//! - [`logging`] - Tracing setup
//! - [`publish`] - The [`publish::Publisher`] capability and its Pub/Sub implementation
//! - [`web`] - HTTP server plumbing and the relay route
//! - [`tools`] - Process lifecycle helpers
//!
//! ## Feature Flags
//!
//! - `pretty_logs` - Colorful console output for development
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `API_TOKEN` | Comma-separated list of accepted API tokens | (required) |
//! | `GCLOUD_PROJECT` | Project owning the destination topic | (required) |
//! | `PUBSUB_TOPIC` | Name of the destination topic | (required) |
//! | `PORT` | HTTP listener port | `8080` |
//! | `BIND_ADDRESS` | Full bind address, takes precedence over `PORT` | (optional) |
//! | `PUBLISH_TIMEOUT_SECONDS` | Timeout applied to every outbound call | `10` |
//! | `PUBSUB_EMULATOR_HOST` | Pub/Sub emulator (`host:port`), disables authentication | (optional) |
//! | `GOOGLE_APPLICATION_CREDENTIALS` | Service account key or user credentials file | (optional) |
//! | `CLOUDSDK_CONFIG` | `gcloud` configuration directory holding user credentials | `$HOME/.config/gcloud` |
//! | `GCE_METADATA_HOST` | Metadata server used when no credentials file is found | `metadata.google.internal` |
//! | `APP_NAME` | Application identifier | `LOG-RELAY` |
//! | `APP_VERSION` | Version string | `DEVELOPMENT-SNAPSHOT-VERSION` |
//! | `RUST_LOG` | Console log filter | `info` |

use std::env;
use std::sync::LazyLock;

/// Startup configuration.
pub mod config;

/// Logging and tracing infrastructure.
pub mod logging;

/// Outbound message publishing.
pub mod publish;

/// Process lifecycle helpers.
pub mod tools;

/// HTTP server and the relay route.
pub mod web;

/// Application name from `APP_NAME` environment variable.
///
/// Used in tracing spans and service identification. Defaults to `"LOG-RELAY"`.
pub static APP_NAME: LazyLock<String> =
    LazyLock::new(|| env::var("APP_NAME").unwrap_or("LOG-RELAY".to_string()));

/// Application version from `APP_VERSION` environment variable.
pub static APP_VERSION: LazyLock<String> =
    LazyLock::new(|| env::var("APP_VERSION").unwrap_or("DEVELOPMENT-SNAPSHOT-VERSION".to_string()));
