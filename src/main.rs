use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotaguard::config::QuotaGuardConfig;
use quotaguard::geo::{GeoOptions, GeoResolver};
use quotaguard::ratelimit::{AdmissionEngine, RequestMeta};

/// Request admission control against a configured quota store.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Cli {
    /// Configuration file (YAML). `QUOTAGUARD__*` variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission checks for a synthetic request and print each verdict
    Check {
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long, default_value = "/")]
        path: String,
        /// Route template used in place of the path for keying
        #[arg(long)]
        route: Option<String>,
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Send all requests at once instead of one after another
        #[arg(long)]
        concurrent: bool,
    },
    /// Resolve an address and evaluate the configured country lists
    Geo {
        ip: String,
        /// Provider name, overriding configuration
        #[arg(long)]
        provider: Option<String>,
    },
    /// Drop counters
    Reset {
        /// Key to reset; all keys when omitted
        #[arg(long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = QuotaGuardConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Check {
            method,
            path,
            route,
            ip,
            count,
            concurrent,
        } => {
            let engine = AdmissionEngine::from_config(&config).await?;
            let mut request = RequestMeta::new(method, path).with_ip(ip);
            request.route = route;

            let verdicts = if concurrent {
                futures::future::join_all((0..count).map(|_| engine.check(&request))).await
            } else {
                let mut verdicts = Vec::with_capacity(count);
                for _ in 0..count {
                    verdicts.push(engine.check(&request).await);
                }
                verdicts
            };

            for verdict in &verdicts {
                println!("{}", serde_json::to_string(verdict)?);
            }

            let admitted = verdicts.iter().filter(|v| v.is_allowed()).count();
            info!(admitted, denied = verdicts.len() - admitted, "Checks complete");

            engine.shutdown().await;
        }
        Command::Geo { ip, provider } => {
            let options = config.geo.clone().unwrap_or_else(GeoOptions::default);
            let resolver = GeoResolver::new(&options)?;
            if let Some(name) = provider {
                resolver.set_provider_by_name(&name)?;
            }

            let result = resolver.lookup(&ip).await?;
            let decision = resolver
                .is_country_allowed(&ip, &options.allowed_countries, &options.blocked_countries)
                .await?;

            println!(
                "{}",
                serde_json::json!({
                    "ip": ip,
                    "provider": format!("{:?}", resolver.current_kind()),
                    "result": result,
                    "decision": decision,
                })
            );
        }
        Command::Reset { key } => {
            let engine = AdmissionEngine::from_config(&config).await?;
            match key {
                Some(key) => {
                    engine.reset_key(&key).await?;
                    info!(key = %key, "Counter reset");
                }
                None => {
                    engine.reset_all().await?;
                    info!("All counters reset");
                }
            }
            engine.shutdown().await;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
