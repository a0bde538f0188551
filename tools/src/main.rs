//! lineage-runner: migrate, serve the HTTP API, or run queue workers.
//!
//! Usage:
//!   lineage-runner migrate --db lineage.db
//!   lineage-runner serve   --db lineage.db --config service.json --addr 127.0.0.1:8080
//!   lineage-runner worker  --db lineage.db --config service.json --worker-id w1 --threads 4
//!   lineage-runner worker  --db lineage.db --config service.json --once

use anyhow::{anyhow, bail, Context, Result};
use lineage_core::{
    api::{Api, ApiRequest},
    clock::{Clock, SystemClock},
    config::ServiceConfig,
    processor::CommandProcessor,
    store::LineageStore,
    types::new_id,
    worker::{CancellationToken, Worker},
};
use std::env;
use std::io::Read;
use std::sync::Arc;
use std::thread;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("help");
    let db = flag(&args, "--db").unwrap_or("lineage.db");

    match mode {
        "migrate" => {
            let store = LineageStore::open(db)?;
            store.migrate()?;
            println!("migrated {db}");
            Ok(())
        }
        "serve" => serve(db, &load_config(&args)?, flag(&args, "--addr").unwrap_or("127.0.0.1:8080")),
        "worker" => {
            let config = load_config(&args)?;
            let worker_id = flag(&args, "--worker-id")
                .map(str::to_string)
                .unwrap_or_else(|| format!("worker-{}", std::process::id()));
            let threads = parse_arg(&args, "--threads", 1usize).max(1);
            let once = args.iter().any(|a| a == "--once");
            run_workers(db, &config, &worker_id, threads, once)
        }
        _ => {
            println!("usage: lineage-runner <migrate|serve|worker> [--db PATH] [--config PATH]");
            println!("         serve:  [--addr HOST:PORT]");
            println!("         worker: [--worker-id ID] [--threads N] [--once]");
            Ok(())
        }
    }
}

fn load_config(args: &[String]) -> Result<ServiceConfig> {
    match flag(args, "--config") {
        Some(path) => ServiceConfig::load(path),
        None => Ok(ServiceConfig::default_service()),
    }
}

fn open_store(db: &str) -> Result<LineageStore> {
    let store = LineageStore::open(db).with_context(|| format!("failed to open {db}"))?;
    store.migrate()?;
    Ok(store)
}

fn serve(db: &str, config: &ServiceConfig, addr: &str) -> Result<()> {
    let api = Api::new(open_store(db)?, Arc::new(SystemClock), config.pagination.clone());
    let server = tiny_http::Server::http(addr).map_err(|e| anyhow!("failed to bind {addr}: {e}"))?;
    let content_type: tiny_http::Header = "Content-Type: application/json"
        .parse()
        .map_err(|_| anyhow!("invalid content-type header"))?;
    log::info!("serve: listening on {addr} (db {db})");

    for mut request in server.incoming_requests() {
        let request_id = request
            .headers()
            .iter()
            .find(|h| h.field.equiv("X-Request-Id"))
            .map(|h| h.value.as_str().to_string())
            .unwrap_or_else(new_id);
        let mut body = String::new();
        if let Err(e) = request.as_reader().read_to_string(&mut body) {
            log::warn!("serve: unreadable body for {request_id}: {e}");
        }
        let api_request = ApiRequest::new(&request.method().to_string(), request.url(), body, request_id);
        let response = api.handle(&api_request);
        let payload = serde_json::to_string(&response.body)?;
        let reply = tiny_http::Response::from_string(payload)
            .with_status_code(response.status)
            .with_header(content_type.clone());
        if let Err(e) = request.respond(reply) {
            log::warn!("serve: failed to respond to {}: {e}", api_request.request_id);
        }
    }
    Ok(())
}

fn build_worker(db: &str, config: &ServiceConfig, worker_id: &str, clock: Arc<dyn Clock>) -> Result<Worker> {
    let mut worker = Worker::new(worker_id, open_store(db)?, config.queue.clone(), &config.retry, clock);
    for (kind, command) in &config.processors {
        worker.register(Box::new(CommandProcessor::new(*kind, command.clone())));
    }
    Ok(worker)
}

fn run_workers(db: &str, config: &ServiceConfig, worker_id: &str, threads: usize, once: bool) -> Result<()> {
    if config.processors.is_empty() {
        bail!("no processors configured; add a \"processors\" table to the service config");
    }
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if once {
        let mut worker = build_worker(db, config, worker_id, clock)?;
        let mut handled = 0u64;
        while let Some(outcome) = worker.tick()? {
            log::info!("worker={worker_id} {outcome:?}");
            handled += 1;
        }
        println!("{worker_id}: drained {handled} run(s)");
        return Ok(());
    }

    let token = CancellationToken::new();
    let mut handles = Vec::with_capacity(threads);
    for i in 0..threads {
        let id = if threads == 1 { worker_id.to_string() } else { format!("{worker_id}-{i}") };
        let mut worker = build_worker(db, config, &id, clock.clone())?;
        let token = token.clone();
        handles.push(thread::spawn(move || worker.run(&token)));
    }
    for handle in handles {
        if handle.join().is_err() {
            log::error!("worker thread panicked");
        }
    }
    Ok(())
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == name).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], name: &str, default: T) -> T {
    flag(args, name).and_then(|v| v.parse().ok()).unwrap_or(default)
}
