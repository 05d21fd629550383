//! Enclave Manager CLI
//!
//! Commands:
//!   enclave-manager run         — dispatch a file of work orders (no KME)
//!   enclave-manager kme         — bind the worker measurement as the KME
//!   enclave-manager wpe         — register with the KME, then dispatch
//!   enclave-manager measurement — print this build's MRENCLAVE
//!   enclave-manager demo        — KME + WPE + dispatch in one process

use enclave_dispatch::bootstrap::{KeyManagementEnclave, WorkerBootstrap, ACK_SLOT, MEASUREMENT_SLOT};
use enclave_dispatch::config::{DispatchConfig, Role};
use enclave_dispatch::error::DispatchError;
use enclave_dispatch::manager::{
    DeliveryOutcome, DispatchStats, EnclaveManager, MemoryResultSink, MemoryWorkOrderQueue,
    WorkOrder,
};
use enclave_dispatch::storage::{DurableSlot, FileSlot, MemorySlot};
use enclave_dispatch::tee::AttestationPolicy;
use enclave_dispatch::work_order::{WorkOrderHandler, WorkOrderRequest, WorkOrderResponse, WorkloadRegistry};
use enclave_dispatch::RegistrationGate;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Upper bound on how long `run`/`wpe` wait for a file's orders to finish
const DRAIN_TIMEOUT: Duration = Duration::from_secs(600);

fn print_usage() {
    println!(
        r#"
Enclave Manager — work-order dispatch over a pool of enclaves

Usage: enclave-manager <command> [options]

Commands:
  run         <requests.jsonl> [config.toml]   Dispatch orders without a KME
  kme         [config.toml]                    Wait for and bind the worker measurement
  wpe         <requests.jsonl> [config.toml]   Register with the KME, then dispatch
  measurement [config.toml]                    Print the MRENCLAVE of this build
  demo                                         Run KME, WPE and dispatch in-process

Each line of a requests file is a JSON work order:
  {{"workOrderId":"wo-1","workloadId":"echo","inData":"aGVsbG8="}}

Configuration is read from enclave-dispatch.toml unless a path is given.
ENCLAVE_DISPATCH_KME_ADDRESS and ENCLAVE_DISPATCH_MRENCLAVE_OVERRIDE
override the file.
"#
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "kme" => cmd_kme(&args[2..]).await,
        "wpe" => cmd_wpe(&args[2..]).await,
        "measurement" => cmd_measurement(&args[2..]),
        "demo" => cmd_demo().await,
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("  Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&String>) -> Result<DispatchConfig, DispatchError> {
    let config = match path {
        Some(path) => DispatchConfig::load_from(path)?,
        None => DispatchConfig::load()?,
    };
    Ok(config)
}

fn file_slots(config: &DispatchConfig) -> (Arc<dyn DurableSlot>, Arc<dyn DurableSlot>) {
    (
        Arc::new(FileSlot::in_dir(&config.persistence_dir, MEASUREMENT_SLOT)),
        Arc::new(FileSlot::in_dir(&config.persistence_dir, ACK_SLOT)),
    )
}

/// Queue every line of a requests file. Lines that are not valid requests
/// are still queued so they surface as MALFORMED_REQUEST.
fn load_requests(path: &str, queue: &MemoryWorkOrderQueue) -> Result<usize, DispatchError> {
    let contents = std::fs::read_to_string(path)?;
    let mut count = 0;
    for (n, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match WorkOrderRequest::from_bytes(line.as_bytes()) {
            Ok(request) => queue.submit_request(&request),
            Err(_) => queue.submit(WorkOrder::new(
                format!("line-{}", n + 1),
                line.as_bytes().to_vec(),
            )),
        }
        count += 1;
    }
    println!("  Queued {} work orders from {}", count, path);
    Ok(count)
}

/// Run the configured number of dispatch loops until `expected` outcomes
/// are recorded
async fn dispatch(
    config: &DispatchConfig,
    handler: Arc<WorkOrderHandler>,
    queue: Arc<MemoryWorkOrderQueue>,
    expected: usize,
) -> Arc<MemoryResultSink> {
    let sink = Arc::new(MemoryResultSink::new());
    let manager = EnclaveManager::new(handler, queue, sink.clone(), config.dispatch_settings());

    let (stop, shutdown) = watch::channel(false);
    let workers = manager.spawn_workers(config.worker_count, shutdown);
    if !sink.wait_for(expected, DRAIN_TIMEOUT).await {
        eprintln!(
            "  Gave up after {:?}: {} of {} orders finished",
            DRAIN_TIMEOUT,
            sink.len(),
            expected
        );
    }
    stop.send_replace(true);

    let mut stats = DispatchStats::default();
    for worker in workers {
        match worker.await {
            Ok(s) => stats.merge(s),
            Err(e) => eprintln!("  Dispatch worker panicked: {}", e),
        }
    }
    println!(
        "  Cycles: {}  delivered: {}  failed: {}  redispatched: {}  pool-exhausted: {}",
        stats.cycles, stats.delivered, stats.failed, stats.redispatched, stats.pool_exhausted
    );
    println!(
        "  Enclaves live: {}/{}",
        manager.pool().live_count(),
        manager.pool().capacity()
    );
    for index in 0..manager.handler().size() {
        match manager.handler().status(index).await {
            Ok(status) => println!(
                "    enclave {} [{}] {:?} signed={}",
                index,
                &status.enclave_id[..8],
                status.security_level,
                status.signatures_issued
            ),
            Err(e) => println!("    enclave {} down: {}", index, e),
        }
    }
    sink
}

fn print_outcomes(sink: &MemoryResultSink) {
    println!("\n  Results");
    println!("  {}", "=".repeat(60));
    for (order_id, outcome) in sink.outcomes() {
        match outcome {
            DeliveryOutcome::Delivered(encoded) => match WorkOrderResponse::decode(&encoded) {
                Ok(response) => println!(
                    "  {:<16} OK      enclave={} out={}",
                    order_id,
                    response.enclave_index,
                    String::from_utf8_lossy(&response.out_data)
                ),
                Err(e) => println!("  {:<16} OK      (undecodable: {})", order_id, e),
            },
            DeliveryOutcome::Failed { reason, detail } => {
                println!("  {:<16} {:<7} {}", order_id, reason.code(), detail)
            }
        }
    }
}

async fn cmd_run(args: &[String]) -> Result<(), DispatchError> {
    let requests = match args.first() {
        Some(path) => path,
        None => {
            eprintln!("Usage: enclave-manager run <requests.jsonl> [config.toml]");
            return Ok(());
        }
    };
    let config = load_config(args.get(1))?;
    if config.role != Role::Standalone {
        log::warn!(
            "Config role is {:?}; `run` dispatches without KME registration",
            config.role
        );
    }

    let handler = Arc::new(WorkOrderHandler::new(
        &config.handler_config(),
        WorkloadRegistry::with_builtins(),
        RegistrationGate::open(),
    )?);
    let queue = Arc::new(MemoryWorkOrderQueue::new());
    let count = load_requests(requests, &queue)?;

    let sink = dispatch(&config, handler, queue, count).await;
    print_outcomes(&sink);
    Ok(())
}

async fn cmd_kme(args: &[String]) -> Result<(), DispatchError> {
    let config = load_config(args.first())?;
    let (measurement_slot, ack_slot) = file_slots(&config);
    let mut kme = KeyManagementEnclave::new(
        config.kme_address.clone(),
        config.attestation.clone(),
        config.override_mrenclave()?,
        measurement_slot,
        ack_slot,
    );

    println!("\n  Key-Management Enclave {}", config.kme_address);
    println!("  {}", "=".repeat(40));
    if let Some(worker) = kme.trusted_worker() {
        println!("  Pre-bound (override): {}", hex::encode(worker.mrenclave));
    }

    let worker = kme
        .run(config.measurement_poll(), config.bootstrap_timeout())
        .await?;
    println!("  Trusted worker:  {}", hex::encode(worker.mrenclave));
    println!("  Binding source:  {:?}", worker.source);
    if let Some(report_data) = worker.report_data {
        println!("  Worker keys:     {}", hex::encode(report_data));
    }
    Ok(())
}

async fn cmd_wpe(args: &[String]) -> Result<(), DispatchError> {
    let requests = match args.first() {
        Some(path) => path,
        None => {
            eprintln!("Usage: enclave-manager wpe <requests.jsonl> [config.toml]");
            return Ok(());
        }
    };
    let config = load_config(args.get(1))?;
    let (measurement_slot, ack_slot) = file_slots(&config);

    let (bootstrap, gate) = WorkerBootstrap::new(
        measurement_slot,
        ack_slot,
        config.measurement_poll(),
        config.bootstrap_timeout(),
    );
    let bootstrap = bootstrap.with_expected_kme(config.kme_address.clone());
    let handler = Arc::new(WorkOrderHandler::new(
        &config.handler_config(),
        WorkloadRegistry::with_builtins(),
        gate,
    )?);

    let nonce = uuid::Uuid::new_v4().to_string();
    let quote = handler.attestation_quote(&nonce);
    println!(
        "\n  Registering {} with KME {}",
        quote.measurement.mrenclave_hex(),
        config.kme_address
    );
    bootstrap.run(&quote).await?;
    println!("  Registered; serving");

    let queue = Arc::new(MemoryWorkOrderQueue::new());
    let count = load_requests(requests, &queue)?;
    let sink = dispatch(&config, handler, queue, count).await;
    print_outcomes(&sink);
    Ok(())
}

fn cmd_measurement(args: &[String]) -> Result<(), DispatchError> {
    let config = load_config(args.first())?;
    let measurement = config.handler_config().measurement();
    println!("  Build:     {}", config.enclave_build);
    println!("  MRENCLAVE: {}", measurement.mrenclave_hex());
    println!("  MRSIGNER:  {}", measurement.mrsigner_hex());
    println!("  ISV SVN:   {}", measurement.isv_svn);
    Ok(())
}

async fn cmd_demo() -> Result<(), DispatchError> {
    println!(
        r#"
Enclave Manager — Demo
KME registration + pooled dispatch + signed responses
"#
    );
    let config = DispatchConfig {
        pool_size: 3,
        worker_count: 2,
        measurement_poll_ms: 20,
        bootstrap_timeout_secs: 10,
        ..Default::default()
    };

    // Step 1: bootstrap
    println!("Step 1: Registering the worker with the KME...");
    println!("{}", "-".repeat(60));
    let measurement_slot: Arc<dyn DurableSlot> = Arc::new(MemorySlot::new(MEASUREMENT_SLOT));
    let ack_slot: Arc<dyn DurableSlot> = Arc::new(MemorySlot::new(ACK_SLOT));

    let mut kme = KeyManagementEnclave::new(
        "demo-kme",
        AttestationPolicy::default(),
        None,
        measurement_slot.clone(),
        ack_slot.clone(),
    );
    let poll = config.measurement_poll();
    let timeout = config.bootstrap_timeout();
    let kme_task = tokio::spawn(async move {
        let bound = kme.run(poll, timeout).await;
        (kme, bound)
    });

    let (bootstrap, gate) = WorkerBootstrap::new(measurement_slot, ack_slot, poll, timeout);
    let bootstrap = bootstrap.with_expected_kme("demo-kme");
    let handler = Arc::new(WorkOrderHandler::new(
        &config.handler_config(),
        WorkloadRegistry::with_builtins(),
        gate,
    )?);
    let quote = handler.attestation_quote(&uuid::Uuid::new_v4().to_string());
    bootstrap.run(&quote).await?;
    match kme_task.await {
        Ok((kme, Ok(worker))) => {
            println!(
                "  KME trusts {} ({:?})",
                hex::encode(worker.mrenclave),
                worker.source
            );
            // Key requests from this worker now pass the KME's check
            kme.authorize(&quote.measurement.mrenclave)?;
            println!("  KME authorizes requests from this worker");
        }
        Ok((_, Err(e))) => return Err(e.into()),
        Err(e) => eprintln!("  KME task failed: {}", e),
    }
    println!("  Worker phase: {}", bootstrap.phase());

    // Step 2: dispatch
    println!("\nStep 2: Dispatching work orders over {} enclaves...", config.pool_size);
    println!("{}", "-".repeat(60));
    let queue = Arc::new(MemoryWorkOrderQueue::new());
    for n in 0..6 {
        queue.submit_request(&WorkOrderRequest::new(
            format!("wo-{}", n),
            if n % 2 == 0 { "echo" } else { "sha256" },
            format!("payload {}", n).into_bytes(),
        ));
    }
    queue.submit_request(&WorkOrderRequest::new("wo-empty", "sha256", Vec::new()));
    queue.submit_request(&WorkOrderRequest::new("wo-unknown", "transcode", b"x".to_vec()));
    queue.submit(WorkOrder::new("wo-garbage", b"not json".to_vec()));

    let sink = dispatch(&config, handler, queue, 9).await;
    print_outcomes(&sink);
    Ok(())
}
