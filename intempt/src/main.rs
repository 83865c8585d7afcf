//! intempt - command-line client for the Intempt analytics platform
//!
//! This tool provides commands for:
//! - Checking configuration and local state
//! - Printing the durable visitor id of this machine
//! - Sending `track` and `identify` events and waiting for delivery
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/intempt/store.db (~/.local/share/intempt/store.db)
//! - Config: $XDG_CONFIG_HOME/intempt/config.toml (~/.config/intempt/config.toml)

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use intempt_core::identity::VisitorIdentityStore;
use intempt_core::{Config, IntemptClient, Properties, SqliteStore, SDK_VERSION};
use serde_json::Value;
use std::sync::{mpsc, Arc};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "intempt")]
#[command(about = "Send events to Intempt from the command line")]
#[command(version)]
struct Args {
    /// Write debug logs to the state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs)]
struct Credentials {
    /// Organization id (default: [client] org_id from config)
    #[arg(long)]
    org: Option<String>,

    /// Tracker id (default: [client] tracker_id from config)
    #[arg(long)]
    tracker: Option<String>,

    /// Tracker token (default: [client] token from config)
    #[arg(long)]
    token: Option<String>,

    /// Seconds to wait for the delivery outcome
    #[arg(long, default_value_t = 30)]
    wait: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and local state
    Status,

    /// Print the visitor id, generating one on first use
    Visitor,

    /// Send an event to a collection
    Track {
        /// Collection name
        collection: String,

        /// Property as key=value; values are parsed as JSON when possible
        #[arg(short, long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,

        /// Positional values matching the collection schema instead of keyed properties
        #[arg(long, conflicts_with = "properties", num_args = 1..)]
        values: Vec<String>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Attach an external identity to this visitor
    Identify {
        /// External identity, e.g. an email address
        identity: String,

        /// Profile property as key=value
        #[arg(short, long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Print the SDK version
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        let guard =
            intempt_core::logging::init(&config.logging).context("failed to initialize logging")?;
        intempt_core::enable_logging();
        Some(guard)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Visitor => cmd_visitor(),
        Command::Track {
            collection,
            properties,
            values,
            credentials,
        } => cmd_track(&config, &collection, &properties, &values, &credentials),
        Command::Identify {
            identity,
            properties,
            credentials,
        } => cmd_identify(&config, &identity, &properties, &credentials),
        Command::Version => {
            println!("intempt {}", SDK_VERSION);
            Ok(())
        }
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Intempt Configuration");
    println!("=====================");
    println!();
    println!("Config file:     {}", Config::config_path().display());
    println!("Store:           {}", Config::store_path().display());
    println!("Log file:        {}", Config::log_path().display());
    println!();

    match config.client.credentials() {
        Some((org_id, tracker_id, token)) => {
            println!("Credentials:     configured");
            println!("Organization:    {}", org_id);
            println!("Tracker:         {}", tracker_id);
            println!("Token:           {}", mask(token));
        }
        None => {
            println!("Credentials:     not configured");
            println!();
            println!("Add them to config.toml:");
            println!();
            println!("  [client]");
            println!("  org_id = \"your-org\"");
            println!("  tracker_id = \"your-tracker\"");
            println!("  token = \"your-token\"");
        }
    }

    let delivery = &config.delivery;
    println!();
    println!("Endpoint:        {}", delivery.endpoint);
    println!("Batch size:      {}", delivery.batch_size);
    println!("Queue capacity:  {}", delivery.queue_capacity);
    println!("Max retries:     {}", delivery.max_retries);
    println!("Persist queue:   {}", delivery.persist_queue);
    println!();
    println!("SDK version:     {}", SDK_VERSION);

    Ok(())
}

fn cmd_visitor() -> Result<()> {
    let path = Config::store_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    let identity = VisitorIdentityStore::new(Arc::new(store));

    let visitor_id = identity
        .try_visitor_id()
        .context("failed to load visitor id")?;
    println!("{}", visitor_id);
    if let Some(external) = identity.external_identity() {
        println!("identified as {}", external);
    }
    Ok(())
}

fn cmd_track(
    config: &Config,
    collection: &str,
    properties: &[String],
    values: &[String],
    credentials: &Credentials,
) -> Result<()> {
    let client = build_client(config, credentials)?;
    let (tx, rx) = mpsc::channel();

    if values.is_empty() {
        let properties = Properties::Keyed(parse_properties(properties)?);
        client.add_event_with_completion(properties, collection, move |outcome| {
            let _ = tx.send(outcome);
        })?;
    } else {
        let values = values.iter().map(|v| parse_value(v)).collect();
        client.track_with_completion(collection, values, move |outcome| {
            let _ = tx.send(outcome);
        })?;
    }

    wait_for_delivery(&rx, credentials.wait)?;
    println!("Delivered event to '{}'", collection);
    Ok(())
}

fn cmd_identify(
    config: &Config,
    identity: &str,
    properties: &[String],
    credentials: &Credentials,
) -> Result<()> {
    let client = build_client(config, credentials)?;
    let properties = parse_properties(properties)?;
    let (tx, rx) = mpsc::channel();

    client.identify_with_completion(identity, properties, move |outcome| {
        let _ = tx.send(outcome);
    })?;

    wait_for_delivery(&rx, credentials.wait)?;
    println!("Identified visitor {} as {}", client.visitor_id(), identity);
    Ok(())
}

/// Build a client from flags, falling back to the `[client]` config section
fn build_client(config: &Config, credentials: &Credentials) -> Result<IntemptClient> {
    let configured = &config.client;
    let org = credentials.org.clone().or_else(|| configured.org_id.clone());
    let tracker = credentials
        .tracker
        .clone()
        .or_else(|| configured.tracker_id.clone());
    let token = credentials.token.clone().or_else(|| configured.token.clone());

    let (Some(org), Some(tracker), Some(token)) = (org, tracker, token) else {
        bail!(
            "missing credentials: pass --org, --tracker and --token or set them in {}",
            Config::config_path().display()
        );
    };

    tracing::info!(org_id = %org, tracker_id = %tracker, "Starting client");
    IntemptClient::builder(org, tracker, token)
        .config(config.clone())
        .build()
        .context("failed to start client")
}

fn wait_for_delivery(rx: &mpsc::Receiver<intempt_core::Result<()>>, wait_secs: u64) -> Result<()> {
    match rx.recv_timeout(Duration::from_secs(wait_secs)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow!(e).context("delivery failed")),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            bail!("no delivery outcome after {}s, event left queued", wait_secs)
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => bail!("client stopped before delivery"),
    }
}

fn parse_properties(raw: &[String]) -> Result<Vec<(String, Value)>> {
    raw.iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("property '{}' is not KEY=VALUE", pair))?;
            if key.trim().is_empty() {
                bail!("property '{}' has an empty key", pair);
            }
            Ok((key.trim().to_string(), parse_value(value)))
        })
        .collect()
}

/// JSON if it parses, otherwise a plain string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn mask(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{}…", visible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_properties() {
        let parsed = parse_properties(&[
            "plan=pro".to_string(),
            "seats=3".to_string(),
            "trial=false".to_string(),
            "note=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                ("plan".to_string(), json!("pro")),
                ("seats".to_string(), json!(3)),
                ("trial".to_string(), json!(false)),
                ("note".to_string(), json!("a=b")),
            ]
        );
    }

    #[test]
    fn test_parse_properties_rejects_malformed() {
        assert!(parse_properties(&["novalue".to_string()]).is_err());
        assert!(parse_properties(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask("secret-token"), "secr…");
        assert_eq!(mask("ab"), "ab…");
    }
}
