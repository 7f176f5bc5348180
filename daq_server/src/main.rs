//! # DAQ Server
//!
//! Loads the server TOML, registers the demo model, creates one arena per
//! task and runs the real-time base loop until Ctrl-C. Logging sessions
//! print what they receive through `tracing`.

use clap::Parser;
use daq::config::{ConfigLoader, ServerConfig};
use daq_server::cycle::{BaseLoop, ServerError, rt_setup};
use daq_server::demo::{DemoModel, DemoRegistry};
use daq_server::logger::run_session;
use daq_shared_memory::{ParameterClient, RetryPolicy, TaskSetup, create_task, parameter_channel};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// DAQ Server: real-time data acquisition transport
#[derive(Parser, Debug)]
#[command(name = "daq_server")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Streams real-time signals to logging sessions over shared memory")]
struct Args {
    /// Path to the server configuration TOML.
    #[arg(default_value = "config/daq.toml")]
    config: PathBuf,

    /// Number of logging sessions to start.
    #[arg(long, default_value_t = 1)]
    sessions: usize,

    /// Seconds between amplitude changes of the tuner (0 disables it).
    #[arg(long, default_value_t = 5)]
    tune_every: u64,

    /// CPU core to pin the RT thread to (`rt` feature only).
    #[arg(long, default_value_t = 1)]
    cpu_core: usize,

    /// SCHED_FIFO priority (`rt` feature only).
    #[arg(long, default_value_t = 80)]
    rt_priority: i32,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();

    let config = match ServerConfig::load(&args.config).and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {}: {e}", args.config.display());
            process::exit(1);
        }
    };
    setup_tracing(&args, &config);

    info!(
        "DAQ Server v{} starting ({})",
        env!("CARGO_PKG_VERSION"),
        config.shared.service_name
    );

    if let Err(e) = run(&args, &config) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("DAQ Server shutdown complete");
}

fn run(args: &Args, config: &ServerConfig) -> Result<(), ServerError> {
    let acq = &config.acquisition;
    let task_count = acq.decimation_per_tid.len();

    let demo = DemoRegistry::build(task_count)?;
    info!(
        signals = demo.registry.signals().len(),
        parameters = demo.registry.parameters().len(),
        image_len = demo.registry.image_len(),
        "registry finalized"
    );

    let image = demo.initial_image();
    let (client, committer) =
        parameter_channel(&demo.registry, &image, RetryPolicy::from(&config.mailbox));

    let mut tasks = Vec::with_capacity(task_count);
    let mut controls = Vec::with_capacity(task_count);
    for (tid, &decimation) in acq.decimation_per_tid.iter().enumerate() {
        let setup = TaskSetup::from_config(config, tid).ok_or_else(|| {
            ServerError::RtSetup(format!("no sample time for task {tid}"))
        })?;
        let (scheduler, control) = create_task(&demo.registry, &setup)?;
        info!(
            task_id = tid,
            decimation,
            sample_time = setup.sample_time,
            arena_bytes = scheduler.arena().layout().total_size,
            "task created"
        );
        tasks.push((decimation, scheduler));
        controls.push(control);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| ServerError::RtSetup(format!("signal handler: {e}")))?;

    let period = Duration::from_secs_f64(acq.base_sample_time);
    let mut base = BaseLoop::new(DemoModel::default(), image, committer, tasks, period);
    let (lock_memory, cpu_core, rt_priority) = (acq.lock_memory, args.cpu_core, args.rt_priority);
    let rt_running = Arc::clone(&running);
    let rt = thread::Builder::new()
        .name("rt".into())
        .spawn(move || -> Result<BaseLoop, ServerError> {
            if let Err(e) = rt_setup(lock_memory, cpu_core, rt_priority) {
                rt_running.store(false, Ordering::SeqCst);
                return Err(e);
            }
            info!(?period, "entering base loop");
            base.run(&rt_running);
            Ok(base)
        })
        .map_err(|e| ServerError::RtSetup(format!("spawn rt thread: {e}")))?;

    let mut sessions = Vec::with_capacity(args.sessions);
    for i in 0..args.sessions {
        let controls = controls.clone();
        let registry = Arc::clone(&demo.registry);
        let plan = demo.logging_plan();
        let interval = acq.poll_interval();
        let running = Arc::clone(&running);
        let name = format!("session-{i}");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_session(&name, &controls, registry, &plan, interval, &running))
            .map_err(|e| ServerError::RtSetup(format!("spawn session thread: {e}")))?;
        sessions.push(handle);
    }

    let tuner = (args.tune_every > 0).then(|| {
        let running = Arc::clone(&running);
        let amplitude = demo.parameters.amplitude;
        let every = Duration::from_secs(args.tune_every);
        thread::spawn(move || run_tuner(&client, amplitude, every, &running))
    });

    for handle in sessions {
        match handle.join() {
            Ok(summary) => info!(?summary, "session finished"),
            Err(_) => warn!("session thread panicked"),
        }
    }
    if let Some(handle) = tuner {
        let _ = handle.join();
    }

    match rt.join() {
        Ok(Ok(base)) => {
            let stats = base.stats();
            info!(
                cycles = stats.cycle_count,
                min_ns = stats.min_cycle_ns,
                avg_ns = stats.avg_cycle_ns(),
                max_ns = stats.max_cycle_ns,
                overruns = stats.overruns,
                parameter_commits = stats.parameter_commits,
                "base loop stopped"
            );
            for (task_id, task) in base.task_stats() {
                info!(task_id, ?task, "task statistics");
            }
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ServerError::RtSetup("rt thread panicked".to_string())),
    }
}

/// Alternate the amplitude between 1 and 2 every `every` until stopped.
fn run_tuner(client: &ParameterClient, amplitude: usize, every: Duration, running: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut high = false;
    let mut waited = Duration::ZERO;
    while running.load(Ordering::Relaxed) {
        thread::sleep(step);
        waited += step;
        if waited < every {
            continue;
        }
        waited = Duration::ZERO;
        high = !high;
        let value: f64 = if high { 2.0 } else { 1.0 };
        match client.set_value(amplitude, &value.to_ne_bytes(), 0, 1) {
            Ok(()) => info!(value, "amplitude changed"),
            Err(e) => warn!(code = e.code(), "amplitude change failed: {e}"),
        }
    }
}

/// Setup tracing subscriber from the configured level and CLI flags.
fn setup_tracing(args: &Args, config: &ServerConfig) {
    let level = if args.verbose {
        "debug"
    } else {
        config.shared.log_level.as_filter()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .compact()
            .init();
    }
}
