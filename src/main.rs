use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use storefront_cache::cache::{ParamValue, Params};
use storefront_cache::{build_key, Config, HttpClient};

#[derive(Parser, Debug)]
#[command(name = "sfcache")]
#[command(about = "Cached, coalescing reads against the storefront API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-cache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// API base URL, overrides the config file
  #[arg(long, global = true)]
  base_url: Option<String>,

  /// Write logs to a daily file in this directory instead of stderr
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a resource, optionally many times concurrently
  Get {
    path: String,

    /// Query parameter as name=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, ParamValue)>,

    /// Number of concurrent reads to issue
    #[arg(short, long, default_value_t = 1)]
    repeat: usize,
  },

  /// Print the cache key for a read
  Key {
    path: String,

    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, ParamValue)>,
  },

  /// Print the TTL assigned to each path
  Policy {
    #[arg(required = true)]
    paths: Vec<String>,
  },
}

fn parse_param(raw: &str) -> std::result::Result<(String, ParamValue), String> {
  let (name, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected name=value, got '{}'", raw))?;
  if name.is_empty() {
    return Err(format!("empty parameter name in '{}'", raw));
  }
  Ok((name.to_string(), ParamValue::parse_literal(value)))
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("storefront_cache=info"));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "sfcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_dir.as_deref());

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override base URL if specified on command line
  if let Some(base_url) = args.base_url {
    config.api.base_url = base_url;
  }

  match args.command {
    Command::Get {
      path,
      params,
      repeat,
    } => get(&config, &path, params.into_iter().collect(), repeat).await,
    Command::Key { path, params } => {
      let params: Params = params.into_iter().collect();
      println!("{}", build_key(&path, Some(&params)));
      Ok(())
    }
    Command::Policy { paths } => {
      let policy = config.cache.policy()?;
      for path in paths {
        println!("{}\t{}s", path, policy.ttl_for(&path).as_secs());
      }
      Ok(())
    }
  }
}

async fn get(config: &Config, path: &str, params: Params, repeat: usize) -> Result<()> {
  if repeat == 0 {
    return Err(eyre!("--repeat must be at least 1"));
  }

  let client = HttpClient::from_config(config)?;

  let reads = (0..repeat).map(|_| client.read_with_source::<Value>(path, Some(&params)));
  let results = futures::future::join_all(reads).await;

  let mut printed = false;
  for (i, result) in results.into_iter().enumerate() {
    let result = result.map_err(|e| eyre!("Read {} of {} failed: {}", i + 1, path, e))?;
    eprintln!("read {}: {}", i + 1, result.source);
    if !printed {
      println!("{}", serde_json::to_string_pretty(&result.data)?);
      printed = true;
    }
  }

  let stats = client.stats();
  eprintln!(
    "network calls: {}, coalesced: {}, hits: {}, misses: {}",
    stats.network_calls, stats.coalesced, stats.hits, stats.misses
  );

  Ok(())
}
