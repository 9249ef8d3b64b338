//! haproxy-rs: render an HAProxy configuration from a deployment file

use clap::Parser;
use haproxy_rs::config::CONFIG_PATH;
use haproxy_rs::network::expose_publicly;
use haproxy_rs::template::Template;
use haproxy_rs::topology::builtin_template;
use haproxy_rs::{deploy_with_template, DeploymentConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Deployment file (TOML). Development defaults are used when omitted.
    config: Option<PathBuf>,

    /// Write the configuration under this directory instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the proxy unit and its network rules as JSON
    #[arg(long)]
    json: bool,

    /// Also allow the public internet to reach the exposed ports
    #[arg(long)]
    public: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so rendered output can be piped
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haproxy_rs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let deployment = match &args.config {
        Some(path) => {
            info!("Loading deployment from {}", path.display());
            DeploymentConfig::from_file(path)?
        }
        None => {
            info!("No deployment file specified, using development defaults");
            DeploymentConfig::development()
        }
    };
    deployment.validate()?;

    let options = deployment.options()?;
    let topology = deployment.topology()?;
    let orchestrator = deployment.orchestrator();

    let template = match &deployment.proxy.template {
        Some(path) => Template::from_file(path)?,
        None => builtin_template(&options),
    };

    let deployed = deploy_with_template(&orchestrator, &topology, &options, &template).await?;
    let unit = deployed.unit;
    let mut rules = deployed.rules;
    if args.public {
        rules.extend(expose_publicly(&orchestrator, &unit)?);
    }

    let config = unit
        .config()
        .ok_or_else(|| anyhow::anyhow!("Proxy unit carries no {}", CONFIG_PATH))?;

    if let Some(dir) = &args.output {
        let path = dir.join(CONFIG_PATH.trim_start_matches('/'));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, config)?;
        info!("Wrote {}", path.display());
    }

    if args.json {
        let report = serde_json::json!({ "unit": unit, "rules": rules });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if args.output.is_none() {
        print!("{}", config);
    }

    Ok(())
}
