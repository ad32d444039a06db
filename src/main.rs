use std::env;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use orgauth::{Config, Context, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|arg| arg == "-help" || arg == "--help") {
        println!("Usage: orgauth [OPTIONS]");
        println!("Options:");
        println!("  -config <path>  Path to configuration file (default: ./etc/orgauth.toml)");
        println!("  -tenant <id>    Tenant whose trees are printed (default: 1)");
        println!("  -help, --help   Print this help message");
        return Ok(());
    }

    let flag = |name: &str| {
        args.iter()
            .skip_while(|arg| arg.as_str() != name)
            .nth(1)
            .map(|s| s.to_string())
    };
    let config_path = flag("-config").unwrap_or_else(|| "./etc/orgauth.toml".to_string());
    let tenant_id: i64 = match flag("-tenant") {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid tenant id: {}", raw))?,
        None => 1,
    };

    // Load configuration first (before logging init)
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Could not load config file: {}, using defaults", e);
        Config::default()
    });

    // Priority: RUST_LOG env var > config file > default "info"
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting orgauth...");
    info!("Loading configuration from: {}", config_path);

    let engine = Engine::connect(config).await.map_err(|e| {
        tracing::error!("Engine initialization failed: {}", e);
        anyhow::anyhow!("Engine initialization failed: {}", e)
    })?;

    let ctx = Context::system(tenant_id);
    let departments = engine.departments.get_tree(&ctx, None).await?;
    let permissions = engine.permissions.get_tree(&ctx).await?;
    let report = serde_json::json!({
        "tenant_id": tenant_id,
        "departments": departments,
        "permissions": permissions,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
