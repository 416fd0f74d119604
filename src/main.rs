use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing_subscriber::EnvFilter;

use rolefit_client::{
  ApiClient, CacheStore, Config, Environment, NetworkTransport, Payload, ReqwestHttp,
  RequestOptions, StorageTier,
};
use rolefit_client::net::HEALTH_CHECK_INTERVAL;

#[derive(Parser, Debug)]
#[command(name = "rolefit")]
#[command(about = "Command-line client for the RoleFit API, with offline caching")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rolefit/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Issue a GET request against the configured API
  Get {
    /// Endpoint path, e.g. /api/user/credits
    endpoint: String,
    /// Query parameters as key=value
    #[arg(short, long = "param", value_parser = parse_key_val)]
    params: Vec<(String, String)>,
  },
  /// Issue a POST request with a JSON body
  Post {
    endpoint: String,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Show cache entry counts per tier
  Stats,
  /// Purge the cache, optionally a single tier
  Clear {
    /// One of: memory, local, session, database
    tier: Option<String>,
  },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
  match s.split_once('=') {
    Some((key, value)) => Ok((key.to_string(), value.to_string())),
    None => Err(format!("expected key=value, got '{}'", s)),
  }
}

fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .map(|d| d.join("rolefit"))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;
  std::fs::create_dir_all(&log_dir)?;

  let file_appender = tracing_appender::rolling::daily(log_dir, "rolefit.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing()?;

  let config = Config::load(args.config.as_deref())?;

  let env = Environment::in_memory();
  if let Ok(token) = Config::get_api_token() {
    env
      .set_auth_token(&token)
      .map_err(|e| eyre!("Failed to store API token: {}", e))?;
  }

  let cache = CacheStore::new(&env, config.policy_table()?);
  let transport = NetworkTransport::new(Arc::new(ReqwestHttp::new()?));
  let _health_monitor = config
    .api
    .health_url
    .clone()
    .map(|health_url| transport.spawn_health_monitor(health_url, HEALTH_CHECK_INTERVAL));

  let client = ApiClient::new(
    transport,
    cache.clone(),
    env,
    config.api.base_url.clone(),
    config.fetch_options(),
  );

  match args.command {
    Command::Get { endpoint, params } => {
      let mut options = RequestOptions::default();
      for (key, value) in params {
        options.params.insert(key, value);
      }
      let response = client.get(&endpoint, options).await?;
      print_payload(&response.data)?;
      if response.from_cache {
        eprintln!("(served from cache, cached at {})", response.timestamp);
      }
    }
    Command::Post { endpoint, data } => {
      let mut options = RequestOptions::default();
      if let Some(raw) = data {
        let body: serde_json::Value =
          serde_json::from_str(&raw).map_err(|e| eyre!("Invalid JSON body: {}", e))?;
        options.data = Some(body);
      }
      let response = client.post(&endpoint, options).await?;
      print_payload(&response.data)?;
    }
    Command::Stats => {
      let stats = cache.stats();
      println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Command::Clear { tier } => {
      let tier = match tier.as_deref() {
        Some("memory") => Some(StorageTier::Memory),
        Some("local") => Some(StorageTier::Local),
        Some("session") => Some(StorageTier::Session),
        Some("database") => Some(StorageTier::Database),
        Some(other) => return Err(eyre!("Unknown tier '{}'", other)),
        None => None,
      };
      cache.clear(tier);
      println!("cache cleared");
    }
  }

  Ok(())
}

fn print_payload(payload: &Payload) -> Result<()> {
  match payload {
    Payload::Json(value) => println!("{}", serde_json::to_string_pretty(value)?),
    Payload::Text(text) => println!("{}", text),
    Payload::Bytes(bytes) => println!("({} bytes of binary data)", bytes.len()),
  }
  Ok(())
}
