//! dshare - dataset sharing node
//!
//! `publish` serves a directory as a root, `subscribe` mirrors roots into a
//! local cache and serves reads from it, `info` reports what the cache holds.

mod read_api;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use dshare_publish::{PublisherConfig, PublisherHandler};
use dshare_subscriber::{SubscriberConfig, SubscriberContext};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use read_api::ReadApi;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dshare")]
#[command(author = "dshare Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Share chunked datasets between publishers and subscribers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve a directory as a root
    Publish {
        /// Root name
        #[arg(short, long)]
        name: Option<String>,

        /// Directory to publish
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Publisher configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Mirror roots and serve reads from the local cache
    Subscribe {
        /// Subscriber configuration file (TOML)
        #[arg(short, long, default_value = "dshare.toml")]
        config: PathBuf,

        /// Broker base URL
        #[arg(short, long)]
        broker: Option<String>,

        /// Chunk cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// State directory (etag and root tables)
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Listen address of the read API
        #[arg(short, long)]
        listen: Option<String>,

        /// Publisher of a root, as NAME=URL (repeatable)
        #[arg(long = "root", value_name = "NAME=URL")]
        roots: Vec<String>,

        /// Root to subscribe to (repeatable)
        #[arg(short, long = "subscribe", value_name = "NAME")]
        subscribe: Vec<String>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Show the roots and cached datasets of a subscriber
    Info {
        /// Subscriber configuration file (TOML)
        #[arg(short, long, default_value = "dshare.toml")]
        config: PathBuf,

        /// Only show this root
        root: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Publish {
            name,
            dir,
            listen,
            config,
            debug,
        } => {
            init_tracing(debug);
            let config = publisher_config(name, dir, listen, config)?;
            run_publisher(config).await?;
        }

        Commands::Subscribe {
            config,
            broker,
            cache_dir,
            state_dir,
            listen,
            roots,
            subscribe,
            debug,
        } => {
            init_tracing(debug);
            let mut config = SubscriberConfig::load(&config)?;
            if broker.is_some() {
                config.broker = broker;
            }
            if let Some(dir) = cache_dir {
                config.cache_dir = dir;
            }
            if let Some(dir) = state_dir {
                config.state_dir = dir;
            }
            if let Some(addr) = listen {
                config.listen = addr;
            }
            run_subscriber(config, &roots, &subscribe).await?;
        }

        Commands::Info { config, root } => {
            let config = SubscriberConfig::load(&config)?;
            print_info(config, root.as_deref())?;
        }
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

fn publisher_config(
    name: Option<String>,
    dir: Option<PathBuf>,
    listen: Option<String>,
    file: Option<PathBuf>,
) -> Result<PublisherConfig> {
    let mut config = match file {
        Some(file) => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            toml::from_str::<PublisherConfig>(&text)
                .with_context(|| format!("parsing {}", file.display()))?
        }
        None => {
            let (Some(name), Some(root_dir)) = (name.clone(), dir.clone()) else {
                bail!("publish needs --name and --dir, or --config");
            };
            PublisherConfig {
                name,
                root_dir,
                listen: "127.0.0.1:8002".to_string(),
            }
        }
    };
    if let Some(name) = name {
        config.name = name;
    }
    if let Some(dir) = dir {
        config.root_dir = dir;
    }
    if let Some(addr) = listen {
        config.listen = addr;
    }
    Ok(config)
}

async fn run_publisher(config: PublisherConfig) -> Result<()> {
    if !config.root_dir.is_dir() {
        bail!("{} is not a directory", config.root_dir.display());
    }
    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen))?;
    let listener = TcpListener::bind(addr).await?;

    info!("Publishing root {} from {:?}", config.name, config.root_dir);
    info!("Publisher listening on {}", addr);

    let handler = Arc::new(PublisherHandler::new(config));
    let service = move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move { handler.handle(req).await }
    };
    serve(listener, service, shutdown_signal()).await;
    Ok(())
}

async fn run_subscriber(config: SubscriberConfig, roots: &[String], subscribe: &[String]) -> Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen))?;
    let ctx = SubscriberContext::create(config)?;

    for spec in roots {
        let Some((name, url)) = spec.split_once('=') else {
            bail!("--root expects NAME=URL, got {}", spec);
        };
        ctx.add_root(name, url)?;
    }
    ctx.start().await?;
    for name in subscribe {
        let report = ctx
            .subscribe_root(name)
            .await
            .with_context(|| format!("subscribing to {}", name))?;
        info!(
            "{}: {} refreshed, {} unchanged, {} removed, {} skipped",
            report.root, report.refreshed, report.unchanged, report.removed, report.skipped
        );
    }

    let listener = TcpListener::bind(addr).await?;
    info!("Read API listening on {}", addr);

    let api = Arc::new(ReadApi::new(ctx.clone()));
    let service = move |req: Request<Incoming>| {
        let api = api.clone();
        async move { api.handle(req).await }
    };
    serve(listener, service, shutdown_signal()).await;

    ctx.shutdown().await;
    Ok(())
}

fn print_info(config: SubscriberConfig, only: Option<&str>) -> Result<()> {
    let ctx = SubscriberContext::create(config)?;
    let mut roots = ctx.roots();
    roots.retain(|r| only.is_none_or(|name| r.name == name));
    if roots.is_empty() {
        println!("No roots");
    }

    for root in roots {
        let marker = if root.subscribed { "subscribed" } else { "known" };
        println!("{} ({}) {}", root.name, marker, root.endpoint);
        for rel in ctx.list_known_datasets(&root.name)? {
            let path = dshare_core::DatasetPath::new(&root.name, &rel)?;
            let etag = ctx.mirror().etags().get(&root.name, &rel).unwrap_or_default();
            match ctx.store().open(&path) {
                Ok(container) => {
                    let total = container.total_chunks();
                    let present = total - container.missing_chunks()?.len() as u64;
                    println!(
                        "  {:<40} {:<12} {:>6}/{:<6} {}",
                        rel,
                        container.meta().kind_name(),
                        present,
                        total,
                        etag
                    );
                }
                Err(_) => println!("  {:<40} {:<12} {:>13} {}", rel, "-", "-", etag),
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Accept HTTP/1 connections until `shutdown` resolves
async fn serve<F, Fut>(listener: TcpListener, service: F, shutdown: impl Future<Output = ()>)
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    tokio::pin!(shutdown);
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };
        let service = service.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| handle_request(req, service.clone())))
                .await
            {
                error!("Error serving connection: {:?}", e);
            }
        });
    }
}

/// Handle incoming HTTP request
async fn handle_request<F, Fut>(req: Request<Incoming>, service: F) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    F: Fn(Request<Incoming>) -> Fut,
    Fut: Future<Output = Response<Full<Bytes>>>,
{
    info!("Request: {} {}", req.method(), req.uri());
    let response = service(req).await;
    info!("Response: {}", response.status());
    Ok(response)
}
