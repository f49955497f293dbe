use clap::Parser;
use log::{error, info};
use std::{error::Error, path::Path};
use tether::{
    config::{ListenerConfig, ServerConfig},
    async_callback, HandlerError, Request, Server,
};
use tokio::runtime::Handle;

#[derive(Parser)]
#[command(
    name = "tether",
    about = "tether - answers every request with a summary of what it received",
    long_about = r#"
tether - answers every request with a summary of what it received

Usage:
    tether [OPTIONS]

Options:
    -h, --help       Print help information
    -V, --version    Print version information
    -c, --config     <CONFIG>
                     YAML config file to use
"#
)]
struct Args {
    #[arg(short, long, required = false, help = "Config file to use.")]
    config: Option<String>,
}

fn load_config(args: &Args) -> Result<ServerConfig, Box<dyn Error>> {
    if let Some(config) = &args.config {
        if !Path::new(config).exists() {
            return Err(format!("config file {} not found", config).into());
        }
        return Ok(ServerConfig::from_file(config)?);
    }

    let listener = ListenerConfig::builder()
        .interface("127.0.0.1")
        .port(8080)
        .build()?;

    Ok(ServerConfig::builder()
        .add_listener(listener)
        .build()?)
}

fn summary(request: &Request) -> Result<String, HandlerError> {
    let (major, minor) = request.version()?;
    let mut summary = format!(
        "{} {} HTTP/{}.{}\nhost: {}\n",
        request.method()?,
        request.path()?,
        major,
        minor,
        request.host()?
    );
    if let Some(upgrade) = request.upgrade()? {
        summary.push_str(&format!("upgrade: {}\n", upgrade));
    }
    for (name, value) in request.headers()? {
        summary.push_str(&format!("  {}: {}\n", name, value));
    }
    for path in request.requests()? {
        summary.push_str(&format!("push hint: {}\n", path));
    }
    match request.payload()? {
        Some(payload) => summary.push_str(&format!("body: {} bytes\n", payload.len())),
        None => summary.push_str("body: none\n"),
    }
    Ok(summary)
}

async fn demo(mut request: Request) -> Result<(), HandlerError> {
    let body = summary(&request)?;
    request.respond(200, &[("content-type", "text/plain; charset=utf-8")], body)?;
    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let server = Server::from_config(&config, &Handle::current(), async_callback(demo))?;
    for addr in server.local_addrs() {
        info!("Serving on {}", addr);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.close();
    server
        .wait_closed()
        .await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run().await {
        error!("Failed to start server: {}", e);
    }
    Ok(())
}
