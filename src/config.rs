use std::path::PathBuf;

use clap::Parser;

use crate::miner::{
    WorkerConfig, DEFAULT_THROUGHPUT, IDLE_BACKOFF, MAX_CONSECUTIVE_ERRORS, RESET_PAUSE,
};

#[derive(Debug, Parser)]
#[command(name = "gpuminer", about = "GPU proof-of-work search worker", version)]
pub struct Config {
    /// GPU device indices to mine on; defaults to every visible device.
    #[arg(long = "device", value_name = "INDEX")]
    pub devices: Vec<u32>,

    /// Worker instances to run, one device each.
    #[arg(long, default_value_t = 1)]
    pub instances: u32,

    /// Nonces tested per dispatched batch.
    #[arg(long, default_value_t = DEFAULT_THROUGHPUT)]
    pub throughput: u32,

    /// Consecutive device faults tolerated before an instance stops.
    #[arg(long = "error-bound", default_value_t = MAX_CONSECUTIVE_ERRORS)]
    pub error_bound: u32,

    /// Prebuilt PTX module holding the search kernel.
    #[arg(long, value_name = "PATH", default_value = "kernels/search.ptx")]
    pub kernel: PathBuf,

    /// List visible GPU devices and exit.
    #[arg(long)]
    pub list_devices: bool,

    /// Emit machine-readable JSON instead of plain lines.
    #[arg(long)]
    pub json: bool,

    /// Benchmark duration in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub bench_secs: u64,

    /// Seconds between hashrate reports.
    #[arg(long, value_name = "SECONDS", default_value_t = 5)]
    pub stats_interval: u64,
}

impl Config {
    pub fn worker_config(&self, instance_index: u32) -> WorkerConfig {
        WorkerConfig {
            instance_index,
            throughput: self.throughput,
            max_consecutive_errors: self.error_bound,
            idle_backoff: IDLE_BACKOFF,
            reset_pause: RESET_PAUSE,
        }
    }
}
