//! # Stitch CLI Entry Point
//!
//! Main binary for the stitch service mesh. Runs the registry service,
//! announces a service instance, and performs one-shot discovery or resilient
//! calls from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Run the registry
//! stitch registry -b 0.0.0.0:3000
//!
//! # Announce this process as an instance (heartbeats until ctrl-c)
//! stitch announce --name speakers --version 1.2.0 --port 9001
//!
//! # Discover one live instance (outputs raw JSON)
//! stitch find speakers '^1.0.0'
//!
//! # Call a service through the breaker and cache (outputs raw JSON)
//! stitch call --service speakers --range '^1.0.0' /list
//! ```
//!
//! The registry URL for the client commands comes from `--registry`, falling
//! back to the `STITCH_REGISTRY` environment variable, then
//! `http://127.0.0.1:3000`. URLs must include the `http://` or `https://`
//! prefix.

use anyhow::Result;
use argh::FromArgs;
use std::net::SocketAddr;
use std::sync::Arc;

use stitch_client::{
    AnnounceConfig, Announcer, Payload, RegistryClient, ReplyOrigin, ServiceClient,
};
use stitch_registry::{Registry, RegistryConfig, RegistryServer};

/// Validates that a URL parses and uses the http or https scheme.
///
/// # Arguments
/// * `raw` - The URL string to validate
/// * `description` - What the URL is for, used in the error message
fn validate_http_url(raw: &str, description: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| anyhow::anyhow!("Invalid {}: '{}': {}", description, raw, e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(anyhow::anyhow!(
            "Invalid {}: '{}' must use http:// or https://, not {}://",
            description,
            raw,
            scheme
        )),
    }
}

/// Default registry URL: `STITCH_REGISTRY` if set, else local.
fn default_registry() -> String {
    std::env::var("STITCH_REGISTRY").unwrap_or_else(|_| "http://127.0.0.1:3000".to_string())
}

#[derive(FromArgs)]
/// Stitch - minimal service-mesh substrate
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Registry**: run the registry service
/// - **Announce**: keep this process registered as a service instance
/// - **Find**: one-shot discovery (unix-friendly JSON output)
/// - **Call**: resilient call through the breaker and cache
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Registry(RegistryArgs),
    Announce(AnnounceArgs),
    Find(FindArgs),
    Call(CallArgs),
}

/// Arguments for running the registry service.
///
/// The registry holds instance records in memory only; on restart, services
/// re-register themselves via their heartbeat loops.
#[derive(FromArgs)]
#[argh(subcommand, name = "registry")]
/// run the stitch registry service
struct RegistryArgs {
    /// address to bind the registry's HTTP server to
    ///
    /// Defaults to "0.0.0.0:3000".
    #[argh(option, short = 'b', default = "\"0.0.0.0:3000\".into()")]
    bind: String,

    /// seconds a registration stays live without renewal
    ///
    /// Instances that miss this window are dropped from discovery until
    /// their next heartbeat. Defaults to 30.
    #[argh(option, long = "timeout", default = "30")]
    timeout_secs: u64,
}

/// Arguments for announcing a service instance.
///
/// Registers `(name, version, port)` with the registry and renews the
/// registration on a fixed interval until ctrl-c, then unregisters. The
/// registry records the host from the connection's peer address.
#[derive(FromArgs)]
#[argh(subcommand, name = "announce")]
/// announce a service instance to the registry
struct AnnounceArgs {
    /// registry URL
    ///
    /// Defaults to $STITCH_REGISTRY, then http://127.0.0.1:3000.
    #[argh(option, long = "registry", default = "default_registry()")]
    registry: String,

    /// service name to register under
    #[argh(option, long = "name")]
    name: String,

    /// semantic version this instance implements (e.g. 1.2.0)
    #[argh(option, long = "version")]
    version: String,

    /// port the instance accepts requests on
    #[argh(option, long = "port")]
    port: u16,

    /// seconds between heartbeat renewals
    ///
    /// Must stay under the registry's expiry timeout. Defaults to 20.
    #[argh(option, long = "interval", default = "20")]
    interval_secs: u64,
}

/// Arguments for one-shot discovery.
///
/// Prints the selected instance as raw JSON to stdout, suitable for piping
/// to `jq`. Exits non-zero when no live instance matches.
#[derive(FromArgs)]
#[argh(subcommand, name = "find")]
/// find one live instance of a service
struct FindArgs {
    /// registry URL
    ///
    /// Defaults to $STITCH_REGISTRY, then http://127.0.0.1:3000.
    #[argh(option, long = "registry", default = "default_registry()")]
    registry: String,

    /// service name to look up
    #[argh(positional)]
    name: String,

    /// semver range the instance must satisfy (e.g. '^1.2.0')
    #[argh(positional)]
    range: String,
}

/// Arguments for a resilient call.
///
/// Discovers an instance, performs `GET path` through the circuit breaker,
/// and prints the JSON response to stdout. When the live path is blocked or
/// failing and a cached response exists, that is printed instead and the
/// degradation is noted on stderr. Exits non-zero only when neither a live
/// nor a cached response is available.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a service through the breaker and cache
struct CallArgs {
    /// registry URL
    ///
    /// Defaults to $STITCH_REGISTRY, then http://127.0.0.1:3000.
    #[argh(option, long = "registry", default = "default_registry()")]
    registry: String,

    /// service name to call
    #[argh(option, long = "service")]
    service: String,

    /// semver range the instance must satisfy
    ///
    /// Defaults to '*', any version.
    #[argh(option, long = "range", default = "\"*\".into()")]
    range: String,

    /// path to request on the instance (e.g. /list)
    #[argh(positional)]
    path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep stdout clean for the scriptable commands; find and call emit raw
    // JSON for piping to jq and friends.
    if !matches!(cli.command, Commands::Find(_) | Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Registry(args) => run_registry(args).await,
        Commands::Announce(args) => run_announce(args).await,
        Commands::Find(args) => run_find(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_registry(args: RegistryArgs) -> Result<()> {
    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;

    tracing::info!(
        "Starting stitch registry (heartbeat timeout {}s)",
        args.timeout_secs
    );

    let registry = Arc::new(Registry::new(RegistryConfig {
        timeout_secs: args.timeout_secs,
    }));
    RegistryServer::new(registry).run(addr).await?;
    Ok(())
}

async fn run_announce(args: AnnounceArgs) -> Result<()> {
    validate_http_url(&args.registry, "registry URL")?;
    let version: semver::Version = args
        .version
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid version '{}': {}", args.version, e))?;

    let mut config = AnnounceConfig::new(&args.name, version, args.port);
    config.interval = std::time::Duration::from_secs(args.interval_secs);

    tracing::info!(
        "Announcing {} v{} on port {} to {} every {}s",
        args.name,
        args.version,
        args.port,
        args.registry,
        args.interval_secs
    );

    let announcer = Announcer::new(RegistryClient::new(&args.registry), config);
    let heartbeat = announcer.clone().spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down, withdrawing registration");
    heartbeat.abort();
    if let Err(e) = announcer.withdraw().await {
        tracing::warn!("Failed to unregister: {}", e);
    }
    Ok(())
}

async fn run_find(args: FindArgs) -> Result<()> {
    validate_http_url(&args.registry, "registry URL")?;
    let range: semver::VersionReq = args
        .range
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid version range '{}': {}", args.range, e))?;

    let registry = RegistryClient::new(&args.registry);
    match registry.find(&args.name, &range).await? {
        Some(instance) => {
            println!("{}", serde_json::to_string(&instance)?);
            Ok(())
        }
        None => Err(anyhow::anyhow!(
            "No live instance of '{}' matching '{}'",
            args.name,
            args.range
        )),
    }
}

async fn run_call(args: CallArgs) -> Result<()> {
    validate_http_url(&args.registry, "registry URL")?;
    let range: semver::VersionReq = args
        .range
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid version range '{}': {}", args.range, e))?;
    if !args.path.starts_with('/') {
        return Err(anyhow::anyhow!(
            "Invalid path '{}': must start with /",
            args.path
        ));
    }

    let client = ServiceClient::new(RegistryClient::new(&args.registry), &args.service, range);
    let reply = client.get(&args.path).await?;

    if let ReplyOrigin::Cached { age_secs } = reply.origin {
        match age_secs {
            Some(age) => eprintln!(
                "warning: '{}' degraded, serving response cached {}s ago",
                args.service, age
            ),
            None => eprintln!("warning: '{}' degraded, serving cached response", args.service),
        }
    }

    match reply.payload {
        Payload::Value(value) => println!("{}", serde_json::to_string(&value)?),
        Payload::Stream(_) => {
            return Err(anyhow::anyhow!(
                "Service '{}' answered '{}' with a byte stream, not JSON",
                args.service,
                args.path
            ))
        }
    }
    Ok(())
}
