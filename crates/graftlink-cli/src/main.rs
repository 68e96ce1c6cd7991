use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use graftlink_core::checker;
use graftlink_core::config::{Config, ConfigError, UpstreamConfig};
use graftlink_core::mapping::AddressTable;
use graftlink_core::upstream;
use graftlink_redirect::{RedirectSettings, Redirector};
use graftlink_tracer::{RewritePolicy, TraceError, Tracer};

#[derive(Parser)]
#[command(name = "graftlink")]
#[command(about = "Run a program with its TCP and UDP traffic sent through an upstream proxy")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log file directory (enables file logging)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program with its traffic redirected
    Run(RunArgs),
    /// Validate the configuration file
    Validate,
    /// Generate a default configuration file
    Init,
    /// Check that the upstream proxy works
    CheckUpstream {
        /// Timeout in seconds for the check
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Only DNS goes over UDP through graftlink; other UDP leaves directly
    #[arg(long)]
    no_udp: bool,

    /// Upstream to use instead of the configured one (socks5://host:port or direct)
    #[arg(long)]
    upstream: Option<String>,

    /// Skip the upstream connectivity test
    #[arg(long)]
    no_test: bool,

    /// Program and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Init => None,
        Commands::Run(_) => Some(load_or_default(&cli.config)?),
        _ => Some(Config::load(&cli.config)?),
    };
    let configured = config.as_ref().map(|c| c.general.log_level.as_str());
    let guard = init_logging(log_level(cli.verbose, configured), cli.log_dir.as_deref())?;

    match (cli.command, config) {
        (Commands::Run(args), Some(config)) => {
            let code = cmd_run(config, args).await?;
            drop(guard);
            std::process::exit(code);
        }
        (Commands::Validate, Some(config)) => cmd_validate(&config),
        (Commands::CheckUpstream { timeout }, Some(config)) => cmd_check_upstream(&config, timeout).await,
        (Commands::Init, _) => cmd_init(&cli.config),
        (_, None) => unreachable!("configuration is loaded for every command but init"),
    }
}

/// `run` works without a configuration file.
fn load_or_default(path: &Path) -> Result<Config> {
    match Config::load(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            Ok(Config::default_config())
        }
        Err(e) => Err(e.into()),
    }
}

fn log_level(verbose: u8, configured: Option<&str>) -> String {
    match verbose {
        0 => configured.unwrap_or("warn").to_string(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn init_logging(level: String, log_dir: Option<&Path>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let env_filter = EnvFilter::from_default_env().add_directive(format!("graftlink={}", level).parse()?);

    // stdout belongs to the traced program
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    let guard = if let Some(log_dir) = log_dir {
        let file_appender = tracing_appender::rolling::daily(log_dir, "graftlink.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    };
    Ok(guard)
}

async fn cmd_run(mut config: Config, args: RunArgs) -> Result<i32> {
    if let Some(url) = &args.upstream {
        config.upstream = UpstreamConfig::from_url(url)?;
    }
    config.general.no_udp |= args.no_udp;
    if args.no_test {
        config.general.test_upstream = false;
    }
    config.validate()?;

    graftlink_tracer::capability::check()?;

    let upstream = upstream::from_config(&config.upstream)?;
    if config.general.test_upstream {
        let timeout = Duration::from_secs(config.general.test_timeout_secs);
        let result = checker::probe(upstream.as_ref(), &config.general.test_url, timeout).await;
        if !result.reachable {
            anyhow::bail!(
                "upstream {} failed the connectivity test: {}",
                result.upstream,
                result.error.as_deref().unwrap_or("unexpected response")
            );
        }
        tracing::info!(upstream = %result.upstream, latency_ms = ?result.latency_ms, "upstream reachable");
    }

    let table = Arc::new(AddressTable::new());
    let redirector = Redirector::bind(table.clone(), upstream, RedirectSettings::from_config(&config)).await?;
    let ports = redirector.ports();
    let policy = RewritePolicy {
        tcp_port: ports.tcp,
        udp_port: ports.udp,
        no_udp: !redirector.udp_enabled(),
    };

    let cancel = CancellationToken::new();
    let redirect_task = tokio::spawn(redirector.run(cancel.clone()));

    let (program, program_args) = args.command.split_first().context("no program given")?;
    let tracer = Tracer::new(program, program_args, table, policy);
    let stop_tracer = tracer.cancel_handle();
    let thread = tracer.spawn().context("failed to start the tracing thread")?;

    let join = tokio::task::spawn_blocking(move || thread.join());
    tokio::pin!(join);
    let joined = tokio::select! {
        joined = &mut join => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping");
            stop_tracer.cancel();
            (&mut join).await
        }
    };

    cancel.cancel();
    let _ = redirect_task.await;

    let outcome = joined
        .context("tracing task failed")?
        .map_err(|_| anyhow::anyhow!("tracing thread panicked"))?;
    match outcome {
        Ok(code) => Ok(code),
        Err(TraceError::Cancelled) => Ok(1),
        Err(e) => Err(e).context(format!("failed to trace {}", program)),
    }
}

fn cmd_validate(config: &Config) -> Result<()> {
    println!("Configuration is valid.");
    println!("  Upstream: {:?} {}", config.upstream.protocol, config.upstream.address.as_deref().unwrap_or("-"));
    println!("  UDP: {}", if config.general.no_udp { "DNS only" } else { "enabled" });
    println!("  Real resolver: {}", config.dns.real_resolver);
    println!("  Fallback resolver: {}", config.dns.fallback_resolver);
    println!("  Upstream test: {}", if config.general.test_upstream { &config.general.test_url } else { "disabled" });
    Ok(())
}

fn cmd_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("config file already exists: {}", config_path.display());
    }

    let config = Config::default_config();
    let yaml = serde_yaml::to_string(&config)?;
    std::fs::write(config_path, yaml)?;
    println!("Default config written to {}", config_path.display());
    Ok(())
}

async fn cmd_check_upstream(config: &Config, timeout_secs: u64) -> Result<()> {
    let upstream = upstream::from_config(&config.upstream)?;
    let timeout = Duration::from_secs(timeout_secs);

    println!("Checking {}...\n", upstream.name());
    let result = checker::probe(upstream.as_ref(), &config.general.test_url, timeout).await;

    if result.reachable {
        println!("  [OK] {} - {}ms", result.upstream, result.latency_ms.unwrap_or(0));
        Ok(())
    } else {
        println!(
            "  [FAIL] {} - {}",
            result.upstream,
            result.error.as_deref().unwrap_or("unexpected response")
        );
        anyhow::bail!("upstream unreachable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_verbosity() {
        assert_eq!(log_level(0, Some("error")), "error");
        assert_eq!(log_level(0, None), "warn");
        assert_eq!(log_level(1, Some("error")), "info");
        assert_eq!(log_level(5, None), "trace");
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "graftlink", "-vv", "run", "--no-udp", "--upstream", "direct", "--", "curl", "-sS", "https://example.com",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run(args) => {
                assert!(args.no_udp);
                assert_eq!(args.upstream.as_deref(), Some("direct"));
                assert_eq!(args.command, ["curl", "-sS", "https://example.com"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_requires_a_program() {
        assert!(Cli::try_parse_from(["graftlink", "run"]).is_err());
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let config = load_or_default(Path::new("/nonexistent/graftlink.yaml")).unwrap();
        assert!(config.general.test_upstream);
    }
}
