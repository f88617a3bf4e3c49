use async_trait::async_trait;
use clap::Parser;
use nxsugar_core::error::ERR_INVALID_PARAMS;
use nxsugar_core::mem::{MemBroker, Reply};
use nxsugar_service::{
    handler_fn, Handler, JsonRpcError, Method, MethodOptions, MethodResult, MethodSchema, Pact,
    ServerConfig, Service, ServiceConfig, ServiceState, Task,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_PATH: &str = "test.nxsugar.fibsrv";

#[derive(Parser, Debug)]
#[command(name = "nxsugar-fibsrv")]
#[command(about = "Fibonacci service over an in-process broker", long_about = None)]
struct Args {
    /// Path to configuration file (uses its `fibsrv` service entry)
    #[arg(long)]
    config: Option<String>,

    /// Broker path to serve [default: test.nxsugar.fibsrv]
    #[arg(long)]
    path: Option<String>,

    /// Number of pull workers, overrides the config file
    #[arg(long)]
    pulls: Option<usize>,

    /// Maximum number of tasks served at once, overrides the config file
    #[arg(long)]
    max_threads: Option<usize>,

    /// Log as JSON
    #[arg(long)]
    production: bool,
}

/// A request read from stdin: `{"method": "fib", "params": {"v": 10}}`.
#[derive(Debug, Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct FibParams {
    v: u64,
    /// Seconds to sleep before answering.
    #[serde(default)]
    t: f64,
}

struct Fib;

#[async_trait]
impl Handler for Fib {
    async fn call(&self, task: &mut Task) -> MethodResult {
        let params: FibParams = serde_json::from_value(task.params.clone()).map_err(|e| {
            JsonRpcError::new(ERR_INVALID_PARAMS, format!("invalid params: {}", e), None)
        })?;
        if params.t > 0.0 {
            let pause = Duration::try_from_secs_f64(params.t).map_err(|e| {
                JsonRpcError::new(ERR_INVALID_PARAMS, format!("invalid t: {}", e), None)
            })?;
            tokio::time::sleep(pause).await;
        }
        fib(params.v)
            .map(|n| json!(n))
            .ok_or_else(|| JsonRpcError::new(ERR_INVALID_PARAMS, "v is too large", None))
    }
}

fn fib(n: u64) -> Option<u64> {
    if n == 0 {
        return Some(0);
    }
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 1..n {
        let next = a.checked_add(b)?;
        a = b;
        b = next;
    }
    Some(b)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (config, level) = load_config(&args)?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    if args.production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }

    let path = config.path.clone();
    let service = Service::new(config);
    service.add_method_with(
        "fib",
        Method::new(Fib)
            .with_test_handler(handler_fn(|_: &Task| Ok(json!(0))))
            .with_schema(MethodSchema {
                input: Some(json!({"type": "object", "required": ["v"]})),
                result: Some(json!({"type": "integer"})),
                pacts: vec![Pact::new(json!({"v": 10}), json!(55))],
                ..Default::default()
            })
            .with_options(MethodOptions {
                enable_response_error_log: true,
                ..Default::default()
            }),
    )?;
    tracing::info!("Registered methods: {:?}", service.methods());

    let broker = MemBroker::new();
    tokio::spawn(feed_stdin(broker.clone(), path, service.clone()));

    // Handle shutdown signals: graceful first, hard stop on the second one
    let stoppables = vec![service.clone()];
    tokio::spawn(async move {
        let mut received = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            received += 1;
            for s in &stoppables {
                if received == 1 {
                    tracing::info!("Received shutdown signal, stopping gracefully");
                    s.graceful_stop();
                } else {
                    tracing::info!("Received second shutdown signal, stopping now");
                    s.stop();
                }
            }
        }
    });

    service.serve(&broker).await?;

    Ok(())
}

/// Service config and log level: the config file's `fibsrv` entry when given,
/// with explicit command line values on top.
fn load_config(args: &Args) -> anyhow::Result<(ServiceConfig, String)> {
    let (mut config, level) = if let Some(path) = &args.config {
        let file = ServerConfig::from_file(path)?;
        let level = file.server.tracing_level()?;
        (file.service("fibsrv")?, level.to_string().to_lowercase())
    } else {
        (
            ServiceConfig::new("fibsrv", DEFAULT_PATH),
            "info".to_string(),
        )
    };

    if let Some(path) = &args.path {
        config.path = path.clone();
    }
    if let Some(pulls) = args.pulls {
        config.pulls = pulls;
    }
    if let Some(max_threads) = args.max_threads {
        config.max_threads = max_threads;
    }
    Ok((config, level))
}

/// Push one task per stdin line and print each reply. EOF stops the service gracefully.
async fn feed_stdin(broker: MemBroker, path: String, service: Service) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = Vec::new();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Skipping malformed request: {}", e);
                continue;
            }
        };

        let reply = broker.push(&format!("{}.{}", path, request.method), request.params);
        pending.push(tokio::spawn(async move {
            let out = match reply.wait().await {
                Some(Reply::Result(result)) => json!({"method": request.method, "result": result}),
                Some(Reply::Error(error)) => json!({"method": request.method, "error": error}),
                Some(Reply::Accepted) => json!({"method": request.method, "accepted": true}),
                None => json!({"method": request.method, "error": "no reply"}),
            };
            println!("{}", out);
        }));
    }

    for reply in pending {
        let _ = reply.await;
    }
    while service.state() == Some(ServiceState::Initializing)
        || service.state() == Some(ServiceState::Connecting)
        || service.state().is_none()
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    service.graceful_stop();
}
