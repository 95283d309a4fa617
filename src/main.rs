use clap::Parser;
use cloudly_dev::stream::dynamodb::DynamoDbStreamSource;
use cloudly_dev::stream::StreamSource;
use cloudly_dev::{server, Cli, CommandResolver, Config, Engine, Shutdown};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::{Directive, EnvFilter, LevelFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::from_file(&cli.config).await?;

    // bind first so that the mock endpoint address is known to the child processes
    let listener = match server::bind(cli.listener()).await {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };
    let mock_endpoint = ["http://", &listener.local_addr()?.to_string()].concat();

    let resolver = CommandResolver::new(&config.root).with_mock_endpoint(mock_endpoint);
    let engine = Arc::new(Engine::new(&config, &resolver));

    let (shutdown, trigger) = Shutdown::new();

    let source: Option<Arc<dyn StreamSource>> = if engine.has_streams() {
        let source = DynamoDbStreamSource::connect(&config.stream_endpoint, &config.region).await;
        Some(Arc::new(source))
    } else {
        None
    };
    let background = engine.start_background(source, &shutdown);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => trigger.stop(),
            Err(e) => {
                // keep the trigger alive, otherwise dropping it stops the server
                error!("Cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        }
    });

    engine.serve(listener, shutdown).await;

    for task in background {
        if let Err(e) = task.await {
            error!("Background task failed: {e}");
        }
    }

    info!("Stopped");
    Ok(())
}

/// Initializes the tracing from RUST_LOG env var if present or sets minimal logging:
/// INFO for this crate, WARN for everything else.
fn init_tracing() {
    // find out the name of the binary to set the default logging filter
    let binary_name = std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().to_string()))
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned())
        // this replace is needed because tracing uses target names with underscores, e.g. `cloudly_dev`
        .replace('-', "_");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(
                    Directive::from_str(&[&binary_name, "=info"].concat())
                        .unwrap_or_else(|_| LevelFilter::INFO.into()),
                )
                .from_env_lossy(),
        )
        .with_ansi(true)
        .with_target(false)
        .compact()
        .init();
}
