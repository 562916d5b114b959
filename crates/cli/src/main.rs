use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use kmirror::{Mirror, SyncedReader};
use kmirror_core::Selector;
use kube::core::DynamicObject;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kmirrorctl", version, about = "Mirror Kubernetes resources into memory via list+watch")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector, e.g. "tier=kube-system,app in (dns,proxy)"
    #[arg(short = 'l', long = "selector", global = true, default_value = "")]
    selector: String,

    /// Seconds to wait for the first sync before printing whatever is mirrored
    #[arg(long = "wait-secs", global = true, env = "KMIRROR_WAIT_SECS", default_value_t = 8)]
    wait_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror a kind, wait for sync and print it
    Ls {
        /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
        gvk: String,
    },
    /// Mirror a kind and report every store update until Ctrl-C
    Watch {
        /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
        gvk: String,
    },
    /// Nodes, pods in kube-system and pods in all namespaces, each from its own mirror
    Demo,
}

/// Log to stderr, filtered by `KMIRROR_LOG` (default `info`).
fn init_tracing() {
    let directives = std::env::var("KMIRROR_LOG").unwrap_or_else(|_| "info".to_string());
    let (filter, rejected) = match EnvFilter::try_new(&directives) {
        Ok(f) => (f, None),
        Err(e) => (EnvFilter::new("info"), Some(e)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
    if let Some(e) = rejected {
        warn!(KMIRROR_LOG = %directives, error = %e, "unusable log filter; logging at info");
    }
}

/// Serve Prometheus metrics on `KMIRROR_METRICS_ADDR` when it is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("KMIRROR_METRICS_ADDR") else { return };
    let sock = match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => sock,
        Err(e) => {
            warn!(KMIRROR_METRICS_ADDR = %addr, error = %e, "expected host:port; metrics disabled");
            return;
        }
    };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(addr = %sock, "serving mirror metrics"),
        Err(e) => warn!(error = %e, "metrics exporter not installed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let selector = Selector::parse(&cli.selector).with_context(|| format!("parsing selector {:?}", cli.selector))?;
    let wait = Duration::from_secs(cli.wait_secs);

    match cli.command {
        Commands::Ls { ref gvk } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, selector = %selector, "ls invoked");
            let mirror = kmirror_kubehub::mirror_for(gvk, ns, selector.clone()).await?;
            let items = synced_items(&mirror, &selector, wait).await;
            print_items(cli.output, &items)?;
        }
        Commands::Watch { ref gvk } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, selector = %selector, "watch invoked");
            let mirror = kmirror_kubehub::mirror_for(gvk, ns, selector.clone()).await?;
            let reader = mirror.reader();
            let handle = mirror.start();
            if !reader.wait_for_sync(wait).await {
                warn!(mirror = %mirror.name(), "not synced yet; reporting partial data");
            }
            watch_loop(&reader, cli.output).await?;
            handle.shutdown().await;
            warn!("watch loop ended (graceful shutdown)");
        }
        Commands::Demo => {
            let sections = [
                ("All nodes:", "v1/Node", None),
                ("Pods in `kube-system` namespace:", "v1/Pod", Some("kube-system")),
                ("Pods in all the namespaces:", "v1/Pod", None),
            ];
            for (title, gvk, ns) in sections {
                let mirror = kmirror_kubehub::mirror_for(gvk, ns, selector.clone()).await?;
                let items = synced_items(&mirror, &selector, wait).await;
                println!();
                println!("{}", title);
                println!("{}", "-".repeat(title.len()));
                for o in &items {
                    println!("{}", o.metadata.name.as_deref().unwrap_or(""));
                }
                println!();
            }
        }
    }

    Ok(())
}

/// Start `mirror`, wait for its first sync, take a sorted read and stop it again.
async fn synced_items(mirror: &Mirror<DynamicObject>, selector: &Selector, wait: Duration) -> Vec<Arc<DynamicObject>> {
    let reader = mirror.reader();
    let handle = mirror.start();
    if !reader.wait_for_sync(wait).await {
        warn!(mirror = %mirror.name(), wait_secs = wait.as_secs(), "couldn't sync cache; output may be incomplete");
    }
    let items = reader.list_sorted(selector);
    handle.shutdown().await;
    items
}

async fn watch_loop(reader: &SyncedReader<DynamicObject>, output: Output) -> Result<()> {
    let mut epochs = reader.subscribe_epoch();
    loop {
        tokio::select! {
            changed = epochs.changed() => {
                if changed.is_err() {
                    warn!("store closed; exiting watch loop");
                    return Ok(());
                }
                let snap = reader.snapshot();
                match output {
                    Output::Human => println!(
                        "epoch {}: {} items (rv {})",
                        snap.epoch,
                        snap.len(),
                        snap.resource_version.as_deref().unwrap_or("-")
                    ),
                    Output::Json => println!(
                        "{}",
                        serde_json::json!({
                            "epoch": snap.epoch,
                            "items": snap.len(),
                            "resourceVersion": snap.resource_version,
                        })
                    ),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                return Ok(());
            }
        }
    }
}

fn print_items(output: Output, items: &[Arc<DynamicObject>]) -> Result<()> {
    print!("{}", render_items(output, items, chrono::Utc::now())?);
    Ok(())
}

fn render_items(output: Output, items: &[Arc<DynamicObject>], now: DateTime<Utc>) -> Result<String> {
    let mut out = String::new();
    match output {
        Output::Human => {
            writeln!(out, "{:<20} {:<40} AGE", "NAMESPACE", "NAME")?;
            for o in items {
                let ns_col = o.metadata.namespace.as_deref().unwrap_or("-");
                let name = o.metadata.name.as_deref().unwrap_or("");
                let age = render_age(o.metadata.creation_timestamp.as_ref().map(|t| t.0), now);
                writeln!(out, "{:<20} {:<40} {}", ns_col, name, age)?;
            }
        }
        Output::Json => {
            let objs: Vec<&DynamicObject> = items.iter().map(|o| o.as_ref()).collect();
            writeln!(out, "{}", serde_json::to_string_pretty(&objs)?)?;
        }
    }
    Ok(out)
}

/// Coarsest two units of the elapsed time, kubectl style.
fn render_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let age = (now - created).num_seconds().max(0);
    let (days, hours, mins) = (age / 86_400, age % 86_400 / 3600, age % 3600 / 60);
    match (days, hours, mins) {
        (0, 0, 0) => format!("{}s", age),
        (0, 0, m) => format!("{}m", m),
        (0, h, m) => format!("{}h{}m", h, m),
        (d, h, _) => format!("{}d{}h", d, h),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(ns: &str, name: &str, created: &str) -> Arc<DynamicObject> {
        let raw = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": ns, "creationTimestamp": created},
        });
        Arc::new(serde_json::from_value(raw).unwrap())
    }

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn json_output_is_an_array_of_objects() {
        let items = vec![pod("kube-system", "coredns", "2024-01-01T00:00:00Z"), pod("default", "web", "2024-01-01T00:00:00Z")];
        let out = render_items(Output::Json, &items, at("2024-01-02T00:00:00Z")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        let names: Vec<&str> = parsed.as_array().unwrap().iter().map(|o| o["metadata"]["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["coredns", "web"]);
    }

    #[test]
    fn human_output_has_a_row_per_item() {
        let items = vec![pod("kube-system", "coredns", "2024-01-01T00:00:00Z")];
        let out = render_items(Output::Human, &items, at("2024-01-01T03:05:00Z")).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("NAMESPACE"));
        assert!(lines[1].starts_with("kube-system"));
        assert!(lines[1].ends_with("3h5m"));
    }

    #[test]
    fn ages_use_two_coarsest_units() {
        let now = at("2024-01-10T12:00:00Z");
        assert_eq!(render_age(None, now), "-");
        assert_eq!(render_age(Some(at("2024-01-10T11:59:30Z")), now), "30s");
        assert_eq!(render_age(Some(at("2024-01-10T11:45:00Z")), now), "15m");
        assert_eq!(render_age(Some(at("2024-01-08T10:00:00Z")), now), "2d2h");
        // clock skew never yields a negative age
        assert_eq!(render_age(Some(at("2024-01-10T12:00:05Z")), now), "0s");
    }
}
