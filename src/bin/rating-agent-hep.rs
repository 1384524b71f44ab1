use anyhow::Result;
use clap::{Parser, Subcommand};
use rating_agent_hep::{app::AppBuilder, config::Config, preflight, version};
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "rating-agent-hep.toml";

#[derive(Parser, Debug)]
#[command(
    author,
    version = version::get_short_version(),
    about = "Correlates HEP-captured SIP calls into begin/end rating transactions",
    long_about = version::get_version_info()
)]
struct Cli {
    /// Path to the configuration file
    #[clap(
        long,
        global = true,
        help = "Path to the configuration file (TOML format)"
    )]
    conf: Option<String>,
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and exit without starting the agent
    CheckConfig,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            println!("Loading config from: {}", path);
            Config::load(path)?
        }
        None if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
            println!("Loading config from: {}", DEFAULT_CONFIG_PATH);
            Config::load(DEFAULT_CONFIG_PATH)?
        }
        None => {
            println!("Loading default config");
            Config::default()
        }
    };
    config.apply_env()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.conf.as_deref())?;

    if matches!(cli.command, Some(Commands::CheckConfig)) {
        match preflight::validate_start(&config).await {
            Ok(_) => {
                println!("Configuration is valid; all listen addresses are available.");
                return Ok(());
            }
            Err(err) => {
                eprintln!("Configuration validation failed:");
                for issue in err.issues {
                    eprintln!("- {}: {}", issue.field, issue.message);
                }
                std::process::exit(1);
            }
        }
    }

    let mut env_filter = EnvFilter::from_default_env();
    if let Some(Ok(level)) = config
        .log_level
        .as_ref()
        .map(|level| level.parse::<LevelFilter>())
    {
        env_filter = env_filter.add_directive(level.into());
    }

    let mut guard_holder = None;
    if let Some(ref log_file) = config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| anyhow::anyhow!("failed to open log file {}: {}", log_file, e))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        guard_holder = Some(guard);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
    }
    let _ = guard_holder; // keep the guard alive

    info!("{}", version::get_version_info().replace('\n', ", "));

    let token = CancellationToken::new();
    let app = AppBuilder::new()
        .with_config(config)
        .with_cancel_token(token.clone())
        .build()
        .await?;

    let mut app_future = Box::pin(app.run());

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm_stream = signal(SignalKind::terminate())?;
        tokio::select! {
            result = &mut app_future => return result,
            _ = tokio::signal::ctrl_c() => {
                info!("received CTRL+C, shutting down");
            }
            _ = sigterm_stream.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = &mut app_future => return result,
            _ = tokio::signal::ctrl_c() => {
                info!("received CTRL+C, shutting down");
            }
        }
    }

    token.cancel();
    app_future.await
}
