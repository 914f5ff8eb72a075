use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ai_router::app::RouterConfig;
use ai_router::models::ProcessingRequest;
use ai_router::platform::{credentials, RouterPaths};
use ai_router::Router;

mod cli;

use cli::{Cli, Commands, RequestArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug { "ai_router=debug" } else { "ai_router=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .with_writer(std::io::stderr)
        .init();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => RouterPaths::new()?.config_file(),
    };

    match cli.command {
        Commands::Init { force } => init(config_path, force).await,
        Commands::Validate => {
            let config = RouterConfig::load(&config_path)?;
            println!(
                "{} is valid: {} backend(s), {} history record(s)",
                config_path.display(),
                config.backends.len(),
                config.history.len()
            );
            Ok(())
        }
        Commands::Status => {
            let router = build_router(&config_path).await?;
            let status = router.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Rank { request } => {
            let router = build_router(&config_path).await?;
            let request = build_request(request)?;
            let ranked: Vec<_> = router.rank(&request).iter().map(|c| c.summary()).collect();
            if ranked.is_empty() {
                bail!("no backend can serve {}", request.operation);
            }
            println!("{}", serde_json::to_string_pretty(&ranked)?);
            Ok(())
        }
        Commands::Process {
            request,
            no_fallback,
            timeout_ms,
        } => {
            let router = build_router(&config_path).await?;
            let mut request = build_request(request)?;
            if no_fallback {
                request = request.without_fallback();
            }
            request.options.timeout_ms = timeout_ms;

            let result = router.process(request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Secret { service, account, set } => {
            credentials::store(&service, &account, &set)?;
            println!("Stored secret for keyring:{}/{}", service, account);
            Ok(())
        }
    }
}

async fn init(path: PathBuf, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    RouterConfig::sample().save(&path).await?;
    println!("Wrote starter configuration to {}", path.display());
    Ok(())
}

async fn build_router(path: &std::path::Path) -> anyhow::Result<Router> {
    let config = RouterConfig::load(path)?;
    if config.backends.is_empty() {
        bail!("no backends configured in {} (run `ai-router init`)", path.display());
    }
    info!("Starting router from {}", path.display());
    Ok(Router::from_config(config).await?)
}

fn build_request(args: RequestArgs) -> anyhow::Result<ProcessingRequest> {
    let mut request = ProcessingRequest::new(args.operation, args.text);
    if let Some(context) = args.context {
        let context = serde_json::from_str(&context).context("--context must be valid JSON")?;
        request = request.with_context(context);
    }
    if let Some(backend) = args.backend {
        request = request.with_preferred_backend(backend);
    }
    if let Some(model) = args.model {
        request = request.with_preferred_model(model);
    }
    if let Some(max_tokens) = args.max_tokens {
        request = request.with_max_output_tokens(max_tokens);
    }
    Ok(request)
}
