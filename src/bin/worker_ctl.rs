use clap::Parser;
use serde_json::{Map, Value};
use worker_control::{ControlClient, ControlConfig, ControlError, Result, WebSocketConnector};

#[derive(Parser)]
#[command(
    name = "worker-ctl",
    about = "Send a single command to a worker over the control channel"
)]
struct Cli {
    /// Control endpoint (defaults to AGENT_CONTROL_URL / _HOST / _PORT)
    #[arg(long)]
    url: Option<String>,

    /// Connection timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Command action, e.g. play, skip, stop
    action: String,

    /// Payload fields: key=string or key:=json
    fields: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(0) => {}
        Ok(lost) => {
            eprintln!("worker-ctl: {lost} command(s) not delivered");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("worker-ctl: {e}");
            std::process::exit(1);
        }
    }
}

/// Dispatch the command and return how many envelopes were dead-lettered
async fn run(cli: Cli) -> Result<usize> {
    let mut config = ControlConfig::from_env()?;
    if let Some(url) = cli.url {
        config.url = Some(url);
    }
    if let Some(ms) = cli.timeout_ms {
        config.connect_timeout_ms = Some(ms);
    }
    config.validate()?;

    let fields = parse_fields(&cli.fields)?;
    let client = ControlClient::new(config, WebSocketConnector::new());

    client.dispatch(&cli.action, fields).await?;
    client.shutdown().await;

    let letters = client.dlq().list(usize::MAX).await?;
    for letter in &letters {
        eprintln!(
            "dead letter: action={} id={} reason={}",
            letter.envelope.action().unwrap_or("-"),
            letter.envelope.id().unwrap_or("-"),
            letter.reason
        );
    }
    Ok(letters.len())
}

/// `key=value` gives a string, `key:=value` a raw JSON value
fn parse_fields(raw: &[String]) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for pair in raw {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            ControlError::Config(format!("Expected key=value or key:=json, got '{}'", pair))
        })?;

        let (key, value) = match key.strip_suffix(':') {
            Some(key) => {
                let value: Value = serde_json::from_str(value).map_err(|e| {
                    ControlError::Config(format!("Invalid JSON for '{}': {}", key, e))
                })?;
                (key, value)
            }
            None => (key, Value::String(value.to_string())),
        };

        if key.is_empty() {
            return Err(ControlError::Config(format!(
                "Empty field name in '{}'",
                pair
            )));
        }
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}
