use std::path::PathBuf;

use dispatchertron_lib::bus::{DispatchError, DispatchOutcome, Dispatcher};
use dispatchertron_lib::config::DispatcherConfig;
use dispatchertron_lib::ipc::{connect_parent, inbound_channel, spawn_worker, MessagePump};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Coordinator,
    Worker,
}

impl Role {
    fn from_arg(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "coordinator" => Ok(Self::Coordinator),
            "worker" => Ok(Self::Worker),
            _ => Err(format!(
                "unsupported role '{value}'. Use coordinator or worker"
            )),
        }
    }
}

#[derive(Debug)]
struct Options {
    role: Role,
    workers: usize,
    listeners: usize,
    worker_listeners: usize,
    payload: Value,
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    dispatchertron_lib::init_tracing();

    if let Err(error) = run().await {
        eprintln!("dispatchertron failed: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let Some(options) = parse_args()? else {
        return Ok(());
    };

    let config = match &options.env_file {
        Some(path) => DispatcherConfig::from_env_file(path).map_err(|e| e.to_string())?,
        None => DispatcherConfig::from_env(),
    };

    match options.role {
        Role::Coordinator => run_coordinator(config, &options).await,
        Role::Worker => run_worker(config, options.listeners).await,
    }
}

fn parse_args() -> Result<Option<Options>, String> {
    let mut options = Options {
        role: Role::Coordinator,
        workers: 2,
        listeners: 1,
        worker_listeners: 2,
        payload: json!({"message": "hello from the coordinator"}),
        env_file: None,
    };

    let mut args = std::env::args().skip(1).peekable();
    if let Some(first) = args.peek() {
        if !first.starts_with('-') {
            options.role = Role::from_arg(first)?;
            args.next();
        }
    }

    while let Some(arg) = args.next() {
        if arg == "--help" || arg == "-h" {
            print_help();
            return Ok(None);
        }

        if let Some(value) = arg.strip_prefix("--workers=") {
            options.workers = parse_count(value, "--workers")?;
            continue;
        }
        if arg == "--workers" {
            let value = args
                .next()
                .ok_or_else(|| "--workers requires a value".to_string())?;
            options.workers = parse_count(&value, "--workers")?;
            continue;
        }

        if let Some(value) = arg.strip_prefix("--listeners=") {
            options.listeners = parse_count(value, "--listeners")?;
            continue;
        }
        if arg == "--listeners" {
            let value = args
                .next()
                .ok_or_else(|| "--listeners requires a value".to_string())?;
            options.listeners = parse_count(&value, "--listeners")?;
            continue;
        }

        if let Some(value) = arg.strip_prefix("--worker-listeners=") {
            options.worker_listeners = parse_count(value, "--worker-listeners")?;
            continue;
        }
        if arg == "--worker-listeners" {
            let value = args
                .next()
                .ok_or_else(|| "--worker-listeners requires a value".to_string())?;
            options.worker_listeners = parse_count(&value, "--worker-listeners")?;
            continue;
        }

        if let Some(value) = arg.strip_prefix("--payload=") {
            options.payload = parse_payload(value)?;
            continue;
        }
        if arg == "--payload" {
            let value = args
                .next()
                .ok_or_else(|| "--payload requires a value".to_string())?;
            options.payload = parse_payload(&value)?;
            continue;
        }

        if let Some(value) = arg.strip_prefix("--env-file=") {
            options.env_file = Some(PathBuf::from(value));
            continue;
        }
        if arg == "--env-file" {
            let value = args
                .next()
                .ok_or_else(|| "--env-file requires a value".to_string())?;
            options.env_file = Some(PathBuf::from(value));
            continue;
        }

        return Err(format!("unknown argument '{arg}'. Use --help for usage"));
    }

    Ok(Some(options))
}

async fn run_coordinator(config: DispatcherConfig, options: &Options) -> Result<(), String> {
    let dispatcher = Dispatcher::new(config);
    let (inbound, rx) = inbound_channel();
    let pump = MessagePump::start(dispatcher.clone(), rx);

    for n in 0..options.listeners {
        dispatcher.register(move |payload: &Value| {
            tracing::info!("coordinator listener {n} received {payload}");
        });
    }

    let exe = std::env::current_exe().map_err(|e| format!("cannot locate own executable: {e}"))?;
    let args = worker_args(options);
    let mut children = Vec::with_capacity(options.workers);
    for n in 0..options.workers {
        let worker = spawn_worker(format!("worker-{n}"), &exe, &args)
            .map_err(|e| e.to_string())?;
        let (_, child) = worker.attach(&dispatcher, &inbound);
        children.push(child);
    }
    drop(inbound);

    let total = dispatcher
        .get_num_listeners()
        .await
        .map_err(|e| e.to_string())?;
    println!("listeners on the bus: {total}");

    match dispatcher.dispatch(options.payload.clone()).await {
        Ok(DispatchOutcome::Completed(report)) => println!(
            "dispatched to {} local listener(s) and {} peer(s), {} peer(s) vacated",
            report.local_listeners, report.peers_acknowledged, report.peers_vacated
        ),
        Ok(DispatchOutcome::Dropped) => println!("dispatch dropped"),
        Err(DispatchError::ListenerFaults(faults)) => {
            println!("dispatch completed with {} listener fault(s)", faults.total());
            for fault in &faults.local {
                println!("  {fault}");
            }
            for fault in &faults.remote {
                println!("  {fault}");
            }
        }
        Err(e) => return Err(e.to_string()),
    }

    dispatcher.clear().await.map_err(|e| e.to_string())?;
    let total = dispatcher
        .get_num_listeners()
        .await
        .map_err(|e| e.to_string())?;
    println!("listeners after clear: {total}");

    // Dropping the links closes each worker's stdin, which ends the worker.
    for peer in dispatcher.peers() {
        dispatcher.detach_peer(&peer);
    }
    let statuses = futures::future::join_all(children.iter_mut().map(|child| child.wait())).await;
    for (n, status) in statuses.into_iter().enumerate() {
        let status = status.map_err(|e| format!("failed to wait for worker-{n}: {e}"))?;
        tracing::debug!("worker-{n} exited with {status}");
    }

    pump.await.map_err(|e| format!("message pump failed: {e}"))?;
    Ok(())
}

async fn run_worker(config: DispatcherConfig, listeners: usize) -> Result<(), String> {
    let dispatcher = Dispatcher::new(config);
    let instance = dispatcher.instance_id();

    for n in 0..listeners {
        dispatcher.register(move |payload: &Value| {
            tracing::info!("[{instance}] listener {n} received {payload}");
        });
    }

    let (inbound, rx) = inbound_channel();
    let pump = MessagePump::start(dispatcher.clone(), rx);
    connect_parent(&dispatcher, &inbound);
    drop(inbound);

    pump.await.map_err(|e| format!("message pump failed: {e}"))?;
    tracing::debug!("[{instance}] coordinator went away, exiting");
    Ok(())
}

/// Arguments for a worker, sharing our env file so both sides agree on
/// their id prefixes.
fn worker_args(options: &Options) -> Vec<String> {
    let mut args = vec![
        "worker".to_string(),
        "--listeners".to_string(),
        options.worker_listeners.to_string(),
    ];
    if let Some(path) = &options.env_file {
        args.push("--env-file".to_string());
        args.push(path.display().to_string());
    }
    args
}

fn parse_count(value: &str, flag: &str) -> Result<usize, String> {
    value
        .parse::<usize>()
        .map_err(|_| format!("{flag} expects a non-negative integer, got '{value}'"))
}

fn parse_payload(value: &str) -> Result<Value, String> {
    serde_json::from_str(value).map_err(|e| format!("--payload expects JSON: {e}"))
}

fn print_help() {
    println!("Cross-process event bus demo");
    println!();
    println!("Usage:");
    println!("  dispatchertron [coordinator|worker] [options]");
    println!();
    println!("Options:");
    println!("  --workers <n>            Worker processes to spawn (default: 2)");
    println!("  --listeners <n>          Listeners registered in this process (default: 1)");
    println!("  --worker-listeners <n>   Listeners registered in each worker (default: 2)");
    println!("  --payload <json>         Payload to dispatch (default: a greeting object)");
    println!("  --env-file <path>        Read DISPATCHERTRON_* settings from a dotenv file");
}
