//! Tether probe - issue one call against a tether server and watch its pushes.
//!
//! Connects through the framed TCP transport, sends `method` with JSON
//! arguments, prints the response, then optionally keeps listening for push
//! messages.

use anyhow::{bail, Result};
use clap::Parser;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tether_core::transport::{StaticResolver, TcpTransportFactory};
use tether_core::{Comm, CommConfig, DestinationKey, PushKind};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether-probe")]
#[command(about = "Call a method on a tether server and print push messages")]
struct Args {
    /// Default server address
    #[arg(long, default_value = "127.0.0.1:8484")]
    addr: SocketAddr,

    /// Destination (document id) to open; omit for a single shared server
    #[arg(long)]
    destination: Option<String>,

    /// Route a destination to its own server, as DEST=ADDR (repeatable)
    #[arg(long = "route", value_parser = parse_route)]
    routes: Vec<(String, SocketAddr)>,

    /// Bind the call to this session id
    #[arg(long)]
    session: Option<String>,

    /// Seconds to wait for the response
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    /// Keep printing push messages for this many seconds after the call
    #[arg(long, default_value = "0")]
    listen_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Method to call; omit to only listen
    method: Option<String>,

    /// Arguments, each parsed as JSON (bare words are sent as strings)
    args: Vec<String>,
}

fn parse_route(s: &str) -> std::result::Result<(String, SocketAddr), String> {
    let (destination, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected DEST=ADDR, got '{}'", s))?;
    if destination.is_empty() {
        return Err(format!("empty destination in '{}'", s));
    }
    let addr = addr
        .parse()
        .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
    Ok((destination.to_string(), addr))
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let mut resolver = StaticResolver::new(args.addr);
    for (destination, addr) in &args.routes {
        resolver = resolver.with_route(destination.clone(), *addr);
    }

    let comm = Comm::new(
        CommConfig::from_assignment(args.destination.clone()),
        TcpTransportFactory::new(resolver),
    )
    .with_recovery(|lost| warn!("View access lost on {} ({}): {}", lost.method, lost.destination, lost.message));
    if comm.spawn_dispatcher().is_none() {
        bail!("failed to start event dispatcher");
    }

    let destination = DestinationKey::from_option(args.destination.clone());
    comm.use_destination(&destination)?;
    info!("Probing {} via {:?}", destination, comm.endpoint(&destination)?);

    let _subscriptions: Vec<_> = PushKind::ALL
        .iter()
        .map(|kind| {
            comm.subscribe(*kind, |msg| match serde_json::to_string(msg) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Cannot print {} push: {}", msg.kind, e),
            })
        })
        .collect();

    let mut outcome = Ok(());
    if let Some(method) = &args.method {
        let call_args: Vec<Value> = args.args.iter().map(|raw| parse_arg(raw)).collect();
        let future = comm.call(args.session.as_deref(), &destination, method, call_args);

        match tokio::time::timeout(Duration::from_secs(args.timeout_secs), future).await {
            Ok(Ok(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
            Ok(Err(e)) => outcome = Err(anyhow::Error::new(e).context(format!("{} failed", method))),
            Err(_) => outcome = Err(anyhow::anyhow!("{} timed out after {}s", method, args.timeout_secs)),
        }
    }

    if args.listen_secs > 0 {
        info!("Listening for pushes for {}s", args.listen_secs);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.listen_secs)) => {}
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        }
    }

    comm.release(&destination);
    comm.dispose();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        let (dest, addr) = parse_route("doc2=127.0.0.1:9002").unwrap();
        assert_eq!(dest, "doc2");
        assert_eq!(addr, "127.0.0.1:9002".parse::<SocketAddr>().unwrap());

        assert!(parse_route("doc2").is_err());
        assert!(parse_route("=127.0.0.1:1").is_err());
        assert!(parse_route("doc2=nowhere").is_err());
    }

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("42"), serde_json::json!(42));
        assert_eq!(parse_arg(r#"{"a":1}"#), serde_json::json!({"a": 1}));
        assert_eq!(parse_arg("Table1"), Value::String("Table1".into()));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "tether-probe",
            "--destination",
            "doc1",
            "--route",
            "doc1=127.0.0.1:9001",
            "fetchTable",
            "Table1",
        ])
        .unwrap();
        assert_eq!(args.destination.as_deref(), Some("doc1"));
        assert_eq!(args.routes.len(), 1);
        assert_eq!(args.method.as_deref(), Some("fetchTable"));
        assert_eq!(args.args, vec!["Table1".to_string()]);
    }
}
