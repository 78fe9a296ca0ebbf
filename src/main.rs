use anyhow::{Context, Result};
use clap::Parser;

use gpuminer::backend;
use gpuminer::config::Config;

fn main() {
    let cfg = Config::parse();
    if let Err(err) = run(&cfg) {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run(cfg: &Config) -> Result<()> {
    if cfg.list_devices {
        return list_devices(cfg);
    }
    bench::run(cfg)
}

fn list_devices(cfg: &Config) -> Result<()> {
    let devices = backend::enumerate_devices().context("device enumeration failed")?;
    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else {
        for device in &devices {
            println!(
                "GPU {}: {} ({} MiB)",
                device.index, device.name, device.memory_total_mib
            );
        }
    }
    Ok(())
}

#[cfg(feature = "cuda")]
mod bench {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use anyhow::{anyhow, bail, Context, Result};
    use crossbeam_channel::{after, select, tick, unbounded};
    use serde::Serialize;

    use gpuminer::backend::{self, cuda::CudaDriver, DeviceInfo};
    use gpuminer::config::Config;
    use gpuminer::miner::{GpuWorker, Sha256Hasher, WorkerEvent};
    use gpuminer::task::{
        TaskBoard, TaskSource, TaskWrapper, WorkUnit, DATA_LEN, NONCE_FIELD_LEN, STATE_LEN,
    };
    use gpuminer::telemetry::{HashCounter, HwMonitor};
    use gpuminer::types::format_hashrate;

    #[derive(Serialize)]
    struct BenchReport {
        duration_secs: f64,
        instances: usize,
        total_hashes: u64,
        hashrate: f64,
        shares: u64,
        devices: Vec<BenchDevice>,
    }

    #[derive(Serialize)]
    struct BenchDevice {
        index: u32,
        name: String,
        hashes: u64,
        hwmon: HwMonitor,
    }

    /// Synthetic work: an all-zero minimal hash cannot be beaten, so the run
    /// measures pure search throughput without producing shares.
    fn synthetic_task() -> Arc<TaskWrapper> {
        let mut state = [0u8; STATE_LEN];
        for (i, byte) in state.iter_mut().enumerate() {
            *byte = (i * 7 + 1) as u8;
        }
        let mut data = [0u8; DATA_LEN];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i * 13 + 5) as u8;
        }
        let unit = WorkUnit {
            state,
            data,
            nonce_field: [0u8; NONCE_FIELD_LEN],
            min_hash: [0u8; 32],
        };
        Arc::new(TaskWrapper::new(1, unit, state))
    }

    fn select_devices(cfg: &Config, visible: Vec<DeviceInfo>) -> Result<Vec<DeviceInfo>> {
        let mut picked = if cfg.devices.is_empty() {
            visible
        } else {
            cfg.devices
                .iter()
                .map(|&want| {
                    visible
                        .iter()
                        .find(|device| device.index == want)
                        .cloned()
                        .ok_or_else(|| anyhow!("GPU device {want} was not found"))
                })
                .collect::<Result<Vec<_>>>()?
        };
        if (cfg.instances as usize) > picked.len() {
            eprintln!(
                "[gpu] {} instances requested but only {} devices are usable",
                cfg.instances,
                picked.len()
            );
        }
        picked.truncate((cfg.instances as usize).min(picked.len()));
        Ok(picked)
    }

    pub fn run(cfg: &Config) -> Result<()> {
        if cfg.instances == 0 {
            bail!("at least one worker instance is required");
        }
        let visible = backend::enumerate_devices().context("device enumeration failed")?;
        let selected = select_devices(cfg, visible)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("failed to install shutdown handler")?;

        let board = Arc::new(TaskBoard::new());
        board.publish(synthetic_task());

        let (events_tx, events_rx) = unbounded();
        let mut counters = Vec::with_capacity(selected.len());
        let mut handles = Vec::with_capacity(selected.len());
        for (instance, device) in selected.iter().enumerate() {
            let driver = CudaDriver::open(device.index, &cfg.kernel)
                .with_context(|| format!("failed to open GPU device {}", device.index))?;
            let counter = Arc::new(HashCounter::new());
            counters.push(Arc::clone(&counter));
            let tasks: Arc<dyn TaskSource> = Arc::clone(&board) as Arc<dyn TaskSource>;
            let mut worker = GpuWorker::new(
                cfg.worker_config(instance as u32),
                driver,
                Sha256Hasher,
                tasks,
                counter,
                Arc::clone(&shutdown),
            )
            .with_events(events_tx.clone());
            let handle = thread::Builder::new()
                .name(format!("gpuminer-worker-{instance}"))
                .spawn(move || worker.run())
                .context("failed to spawn worker thread")?;
            handles.push(handle);
            println!(
                "[gpu] instance {instance} searching on GPU {} ({})",
                device.index, device.name
            );
        }
        drop(events_tx);

        let started = Instant::now();
        let deadline = after(Duration::from_secs(cfg.bench_secs));
        let interval = cfg.stats_interval.max(1);
        let ticker = tick(Duration::from_secs(interval));
        let mut per_instance = vec![0u64; counters.len()];
        let mut shares = 0u64;
        let mut fatal = 0usize;

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            select! {
                recv(events_rx) -> event => match event {
                    Ok(WorkerEvent::Share { .. }) => shares += 1,
                    Ok(WorkerEvent::Fatal { .. }) => {
                        fatal += 1;
                        if fatal == counters.len() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    let mut drained = 0u64;
                    for (total, counter) in per_instance.iter_mut().zip(&counters) {
                        let taken = counter.take();
                        *total += taken;
                        drained += taken;
                    }
                    let mut line = format!("[stats] {}", format_hashrate(drained as f64 / interval as f64));
                    for device in &selected {
                        let hw = backend::hardware_monitor(device.index);
                        line.push_str(&format!(" | gpu{} {}C fan {}%", device.index, hw.temp_c, hw.fan_pct));
                    }
                    println!("{line}");
                },
                recv(deadline) -> _ => break,
            }
        }

        shutdown.store(true, Ordering::SeqCst);
        for handle in handles {
            let _ = handle.join();
        }
        for (total, counter) in per_instance.iter_mut().zip(&counters) {
            *total += counter.take();
        }

        if fatal > 0 && fatal == counters.len() {
            bail!("all worker instances stopped on device faults");
        }

        let duration_secs = started.elapsed().as_secs_f64();
        let total_hashes: u64 = per_instance.iter().sum();
        let report = BenchReport {
            duration_secs,
            instances: counters.len(),
            total_hashes,
            hashrate: total_hashes as f64 / duration_secs.max(f64::EPSILON),
            shares,
            devices: selected
                .iter()
                .zip(&per_instance)
                .map(|(device, &hashes)| BenchDevice {
                    index: device.index,
                    name: device.name.clone(),
                    hashes,
                    hwmon: backend::hardware_monitor(device.index),
                })
                .collect(),
        };
        if cfg.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!(
                "[bench] {} over {:.1}s across {} instance(s), {} share(s)",
                format_hashrate(report.hashrate),
                report.duration_secs,
                report.instances,
                report.shares
            );
        }
        Ok(())
    }
}

#[cfg(not(feature = "cuda"))]
mod bench {
    use anyhow::{bail, Result};

    use gpuminer::config::Config;

    pub fn run(_cfg: &Config) -> Result<()> {
        bail!("built without GPU support; rebuild with --features cuda")
    }
}
