use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reelgate::api::handlers::link_path;
use reelgate::cli::{self, Commands, LinkCommands, TokenCommands};
use reelgate::config::{self, Config};
use reelgate::metrics::ProxyMetrics;
use reelgate::store::SlugStore;
use reelgate::{jobs, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            let state = server::build_state(cfg).await?;
            server::run(state, port).await
        }
        Some(Commands::Link { command }) => handle_link_command(command, &cfg).await,
        Some(Commands::Token { command }) => handle_token_command(command, &cfg).await,
        None => {
            let port = cfg.port;
            let state = server::build_state(cfg).await?;
            server::run(state, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// Registry with an env filter and fmt output, plus OTLP export when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "reelgate"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "reelgate=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn handle_link_command(cmd: LinkCommands, cfg: &Config) -> anyhow::Result<()> {
    let links = SlugStore::connect(&cfg.database_url)
        .await
        .context("failed to open link store")?;

    match cmd {
        LinkCommands::Create {
            resource_id,
            file_name,
        } => {
            let slug = links.get_or_create_slug(&resource_id).await?;
            println!(
                "Link published:\n  Resource: {}\n  Slug:     {}\n  Path:     {}",
                resource_id,
                slug,
                link_path(&slug, file_name.as_deref())
            );
        }
        LinkCommands::Resolve { slug } => match links.get_record(&slug).await? {
            Some(record) => println!(
                "{}\n  Created: {}",
                record.resource_id,
                record.created_at.to_rfc3339()
            ),
            None => anyhow::bail!("no link with that slug"),
        },
        LinkCommands::Revoke { slug } => {
            if links.revoke_slug(&slug).await? {
                println!("Link revoked.");
            } else {
                println!("Link not found or already revoked.");
            }
        }
        LinkCommands::Purge { hours } => {
            let retention = hours
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
                .unwrap_or(cfg.link_retention);
            let removed = jobs::cleanup::sweep(&links, retention).await;
            println!("Removed {} expired link(s).", removed);
        }
    }
    Ok(())
}

async fn handle_token_command(cmd: TokenCommands, cfg: &Config) -> anyhow::Result<()> {
    let links = SlugStore::connect(&cfg.database_url)
        .await
        .context("failed to open link store")?;
    let tokens = server::build_token_manager(cfg, links, ProxyMetrics::new()?)?;

    match cmd {
        TokenCommands::Show => match tokens.current().await? {
            Some(token) => {
                let state = if token.is_expired_at(chrono::Utc::now()) {
                    "expired"
                } else {
                    "valid"
                };
                println!(
                    "Access token:\n  Token:   {}\n  Expires: {}\n  State:   {}",
                    token.preview(),
                    token.expires_at.to_rfc3339(),
                    state
                );
            }
            None => println!("No access token cached."),
        },
        TokenCommands::Refresh => {
            let token = tokens.force_refresh().await?;
            println!(
                "Access token refreshed:\n  Token:   {}\n  Expires: {}",
                token.preview(),
                token.expires_at.to_rfc3339()
            );
        }
    }
    Ok(())
}
