use anyhow::{Context, Result};
use clap::Parser;
use server::{
    app::{build_router, RouterCtx},
    conf::Conf,
    setup::{init_tracing, setup_database, setup_services, ServiceContext},
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value = "config.toml")]
    pub config_file: Vec<String>,

    #[arg(long, default_value = "false")]
    pub clean_db: bool,

    /// Run without Postgres, bridge aggregator or identity service.
    #[arg(long, default_value = "false")]
    pub offline: bool,

    /// Do not start the deadline scheduler even when the chain is configured.
    #[arg(long, default_value = "false")]
    pub no_scheduler: bool,

    /// Server port (overrides config)
    #[arg(long)]
    pub server_port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Conf::new(args.config_file.clone()).context("reading config file")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(actual_main(args, config))
}

async fn actual_main(args: Args, config: Conf) -> Result<()> {
    init_tracing(&config.log_format);

    info!("Starting escrow coordinator with config: {:?}", &config.id);
    info!("Args: {:?}", args);

    let pool = if args.offline {
        None
    } else {
        Some(setup_database(&config, args.clean_db).await?)
    };

    let ServiceContext {
        store: _,
        users: _,
        verifier,
        engine,
        deal_service,
        scheduler,
    } = setup_services(&config, pool).await?;

    match (&scheduler, args.no_scheduler) {
        (Some(scheduler), false) => {
            info!(
                interval_secs = config.scheduler.deadline_check_interval_secs,
                "Starting deadline scheduler"
            );
            let _ = scheduler.start();
        }
        (Some(_), true) => warn!("Deadline scheduler disabled by flag"),
        (None, _) => warn!("Deadline scheduler disabled: chain client not configured"),
    }

    let router = build_router(RouterCtx {
        deal_service,
        engine,
        verifier,
    });

    let port = args.server_port.unwrap_or(config.rest_server_port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "Escrow coordinator listening");

    axum::serve(listener, router)
        .await
        .context("serving API")?;

    Ok(())
}
