//! `acrt`: command-line interface for the acrt accelerator runtime.
//!
//! ```text
//! USAGE:
//!   acrt info                         Runtime, HAL and device summary
//!   acrt smoke                        Device / context / stream bring-up and tear-down
//!   acrt streams [--count N]          Create N streams and list their queues
//!   acrt stress [--threads T] [--iterations N]
//!                                     Concurrent device retain / release
//!   acrt callback [--count N]         Route N callbacks to a processing thread
//! ```
//!
//! All commands run against the simulated driver; `ACRT_*` environment
//! variables tune the runtime and `ACRT_SIM_*` the driver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use acrt_drv::{MallocPolicy, MemAttr};
use acrt_runtime::hals::{SoftwareHal, SoftwareHalConfig};
use acrt_runtime::{current_thread_id, Runtime, RuntimeConfig, StreamConfig};
use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "acrt", about = "acrt accelerator runtime CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print runtime configuration and device summary.
    Info,
    /// Run the canonical bring-up / tear-down sequence on device 0.
    Smoke,
    /// Create streams in one context and list their queue ids.
    Streams {
        /// Number of streams to create.
        #[arg(long, default_value_t = 4)]
        count: u32,
    },
    /// Hammer device 0 with concurrent retains and releases.
    Stress {
        /// Worker threads.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Retain / release pairs per thread.
        #[arg(long, default_value_t = 1000)]
        iterations: usize,
    },
    /// Launch callbacks and process them on a subscribed thread.
    Callback {
        /// Number of callbacks to launch.
        #[arg(long, default_value_t = 8)]
        count: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let (rt, hal) =
        Runtime::with_software_hal(RuntimeConfig::from_env(), SoftwareHalConfig::from_env())
            .context("creating runtime")?;

    match cli.command {
        Cmd::Info => cmd_info(&rt, &hal)?,
        Cmd::Smoke => cmd_smoke(&rt, &hal)?,
        Cmd::Streams { count } => cmd_streams(&rt, count)?,
        Cmd::Stress {
            threads,
            iterations,
        } => cmd_stress(&rt, &hal, threads, iterations)?,
        Cmd::Callback { count } => cmd_callback(&rt, count)?,
    }

    Ok(())
}

fn cmd_info(rt: &Runtime, hal: &SoftwareHal) -> Result<()> {
    let config = rt.config();
    println!("HAL          : {}", rt.hal().hal_type());
    println!("Run mode     : {:?}", rt.run_mode());
    println!("Platform     : {}", rt.platform());
    println!("Devices      : {}", rt.device_count()?);
    println!("Device slots : {}", config.max_devices);
    println!(
        "Context pool : {} ({:?})",
        config.context_pool_capacity, config.context_pool_policy
    );
    println!("Queues/device: {}", hal.config().max_queues);

    for device in 0..rt.device_count()? {
        let ctx = rt.ctx_create(0, device)?;
        for attr in [MemAttr::Normal, MemAttr::Huge, MemAttr::All] {
            let mem = rt.mem_get_info(attr)?;
            println!(
                "[{device}] {:<6} : {} MiB free of {} MiB",
                format!("{attr:?}"),
                mem.free >> 20,
                mem.total >> 20
            );
        }
        rt.ctx_destroy(ctx)?;
    }
    Ok(())
}

fn cmd_smoke(rt: &Runtime, hal: &SoftwareHal) -> Result<()> {
    let start = Instant::now();
    rt.set_device(0)?;
    let ctx = rt.ctx_create(0, 0)?;
    let stream = rt.stream_create(&StreamConfig::default())?;
    println!("context {ctx}, {stream} on sq {}", rt.stream_sqid(stream)?);

    let buf = rt.malloc(4096, MallocPolicy::HugeFirst)?;
    rt.memset(buf, 4096, 0xa5, 4096)?;
    let mut probe = [0u8; 4];
    rt.memcpy_to_host(&mut probe, buf)?;
    if probe != [0xa5; 4] {
        bail!("device memory readback mismatch: {probe:02x?}");
    }
    rt.free(buf)?;

    rt.stream_synchronize(stream)?;
    rt.stream_destroy(stream)?;
    rt.ctx_destroy(ctx)?;
    rt.device_reset(0)?;

    if hal.is_open(0) || hal.queue_count(0) != 0 {
        bail!("device 0 not fully torn down");
    }
    println!(
        "smoke OK in {:?} (opens {}, closes {})",
        start.elapsed(),
        hal.open_count(0),
        hal.close_count(0)
    );
    Ok(())
}

fn cmd_streams(rt: &Runtime, count: u32) -> Result<()> {
    let ctx = rt.ctx_create(0, 0)?;
    for n in 0..count {
        let priority = n % (acrt_runtime::stream::MAX_STREAM_PRIORITY + 1);
        let stream = rt.stream_create(&StreamConfig::default().with_priority(priority))?;
        println!(
            "{:<10} sq {:>4}  priority {priority}",
            stream.to_string(),
            rt.stream_sqid(stream)?
        );
    }
    println!("{} stream(s) in {ctx}", rt.ctx_stream_count(ctx)?);
    rt.ctx_destroy(ctx)?;
    Ok(())
}

fn cmd_stress(rt: &Runtime, hal: &SoftwareHal, threads: usize, iterations: usize) -> Result<()> {
    let start = Instant::now();
    rt.set_device(0)?;
    let failures = AtomicUsize::new(0);
    std::thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                for _ in 0..iterations {
                    let ok = rt.set_device(0).is_ok() && rt.device_reset(0).is_ok();
                    if !ok {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    let refs = rt.device_ref_count(0);
    rt.device_reset(0)?;

    let failures = failures.into_inner();
    println!(
        "{threads} thread(s) x {iterations} in {:?}: refcount {refs} at end, \
         {} open(s), {failures} failure(s)",
        start.elapsed(),
        hal.open_count(0)
    );
    if failures > 0 || refs != 2 || hal.open_count(0) != 1 {
        bail!("device refcount went out of balance");
    }
    Ok(())
}

fn cmd_callback(rt: &Runtime, count: usize) -> Result<()> {
    rt.ctx_create(0, 0)?;
    let stream = rt.stream_create(&StreamConfig::default())?;
    let ran = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|s| -> Result<()> {
        let (tid_tx, tid_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let worker = s.spawn(move || -> Result<()> {
            tid_tx.send(current_thread_id())?;
            go_rx.recv()?;
            for _ in 0..count {
                rt.process_report(Some(Duration::from_secs(5)))?;
            }
            Ok(())
        });

        let tid = tid_rx.recv()?;
        rt.subscribe_report(tid, stream)?;
        go_tx.send(())?;
        for n in 0..count {
            let ran = Arc::clone(&ran);
            rt.callback_launch(stream, n % 2 == 0, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })?;
        }
        match worker.join() {
            Ok(result) => result?,
            Err(_) => bail!("processing thread panicked"),
        }
        rt.stream_synchronize(stream)?;
        rt.unsubscribe_report(tid, stream)?;
        Ok(())
    })?;

    info!("Processed {count} callback(s)");
    println!("{} of {count} callback(s) ran", ran.load(Ordering::SeqCst));
    Ok(())
}
