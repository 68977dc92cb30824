//! Command-line control-plane query tool.
//!
//! Prints the answer on stdout and exits 0. On failure the diagnostic goes to
//! stderr and the exit status identifies the error class: 2 unknown query,
//! 3 unreachable, 4 consistency violation, 1 anything else.

use clap::Parser;
use clusterweave::endpoint::{QueryClient, RetryPolicy};
use clusterweave::error::QueryError;
use clusterweave::query::OutputFormat;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;

/// Query a cluster worker's control plane
#[derive(Debug, Parser)]
#[command(name = "clusterweave-query", version)]
struct Args {
  /// Control-plane address of any worker (host:port)
  #[arg(long)]
  external: SocketAddr,

  /// Query kind, e.g. partition-query or cluster-status-query
  #[arg(long = "type", value_name = "KIND")]
  kind: String,

  /// Print the answer as JSON instead of indented text
  #[arg(long)]
  json: bool,

  /// Attempts before giving up on an unreachable control plane
  #[arg(long, default_value_t = 3)]
  retries: u32,

  /// Per-attempt timeout in milliseconds
  #[arg(long, default_value_t = 10_000)]
  timeout_ms: u64,
}

fn exit_code(err: &QueryError) -> u8 {
  match err {
    QueryError::UnknownQuery(_) => 2,
    QueryError::QueryUnreachable { .. } => 3,
    QueryError::ConsistencyViolation(_) => 4,
    QueryError::Protocol(_) => 1,
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt().with_writer(std::io::stderr).init();
  let args = Args::parse();

  let format = if args.json {
    OutputFormat::Json
  } else {
    OutputFormat::Human
  };
  let client = QueryClient::new(args.external)
    .with_timeout(Duration::from_millis(args.timeout_ms))
    .with_retry(RetryPolicy::new(args.retries, Duration::from_millis(100)));

  match client.query(&args.kind, format).await {
    Ok(body) => {
      println!("{}", body.trim_end());
      ExitCode::SUCCESS
    }
    Err(e) => {
      error!(address = %args.external, kind = %args.kind, error = %e, "Query failed");
      eprintln!("{e}");
      ExitCode::from(exit_code(&e))
    }
  }
}
