//! Catalog service host.
//!
//! ```text
//!   appsettings.json ─┐
//!   environment ──────┼─▶ config ─▶ logger ─▶ host ─▶ migrations ─▶ listen
//!   --set overrides ──┤                                              │
//!   secret store ─────┘                          PORT (HTTP/1.1 + 2) ┤
//!                                                GRPC_PORT (HTTP/2)  ┘
//! ```
//!
//! Exits with status 0 after a clean shutdown and 1 when any phase fails.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;

use catalog_host::config::loader::DEFAULT_CONFIG_FILE;
use catalog_host::config::schema::CONNECTION_STRING;
use catalog_host::lifecycle::shutdown_signal;
use catalog_host::migration::{PostgresStore, SqlScriptSeeder};
use catalog_host::{
    ApplicationIdentity, Bootstrap, BootstrapOutcome, ConfigurationResolver, MigrationTarget,
    ResolvedConfiguration, ResolverOptions,
};

const DEFAULT_NAMESPACE: &str = "Microsoft.eShopOnContainers.Services.Catalog.API";

#[derive(Parser)]
#[command(name = "catalog-host")]
#[command(about = "Catalog service host", long_about = None)]
struct Args {
    /// Directory holding configuration files and static assets
    #[arg(long, default_value = ".")]
    content_root: PathBuf,

    /// Base configuration file, relative to the content root
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Override a configuration key (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    overrides: Vec<(String, String)>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn router() -> Router {
    Router::new()
        .route("/hc", get(|| async { "Healthy" }))
        .route("/liveness", get(|| async { "Healthy" }))
}

fn catalog_migrations(config: &ResolvedConfiguration) -> Vec<MigrationTarget> {
    if config.get_non_blank(CONNECTION_STRING).is_none() {
        return Vec::new();
    }
    let catalog = Arc::new(PostgresStore::new("Migrations/Catalog"));
    let seeder = Arc::new(SqlScriptSeeder::new(Arc::clone(&catalog), "Setup/catalog.sql"));
    vec![
        MigrationTarget::new("CatalogContext", catalog).with_seeder(seeder),
        MigrationTarget::new(
            "IntegrationEventLogContext",
            Arc::new(PostgresStore::new("Migrations/IntegrationEventLog")),
        ),
    ]
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let identity = ApplicationIdentity::from_namespace(option_env!("APP_NAMESPACE").unwrap_or(DEFAULT_NAMESPACE));

    let resolver = ConfigurationResolver::new(
        ResolverOptions::new(&args.content_root).file_name(args.config_file),
    )
    .with_overrides(args.overrides);

    let outcome = Bootstrap::new(identity, resolver, router())
        .serve_web_root("/pics")
        .with_migrations(catalog_migrations)
        .run(shutdown_signal())
        .await;

    if let BootstrapOutcome::Failure(err) = &outcome {
        if !err.is_logged() {
            eprintln!("{identity}: {err}");
        }
    }
    outcome.into()
}
