use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaSlice, CudaStream, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::Ptx;

use crate::backend::{DeviceBuffer, DeviceDriver, DeviceError, DeviceInfo, SearchBatch};
use crate::telemetry::HwMonitor;

/// Entry point exported by the prebuilt search module.
const SEARCH_KERNEL_NAME: &str = "search_nonces";
const KERNEL_BLOCK_THREADS: u32 = 256;

/// CUDA-backed device driver. Owns one context/stream pair on one device and
/// a registry of live buffers keyed by opaque handle ids.
pub struct CudaDriver {
    stream: Arc<CudaStream>,
    kernel: CudaFunction,
    buffers: HashMap<u64, CudaSlice<u8>>,
    next_id: u64,
    device_index: u32,
}

impl CudaDriver {
    /// Opens the device and loads the opaque batch-search module. The kernel
    /// is shipped as a prebuilt PTX file; its internals are not this crate's
    /// concern, only the calling contract in [`SearchBatch`].
    pub fn open(device_index: u32, kernel_module: &Path) -> Result<Self, DeviceError> {
        let ctx = CudaContext::new(device_index as usize)
            .map_err(|err| DeviceError::Unavailable(device_index, format!("{err:?}")))?;
        let stream = ctx.default_stream();

        let ptx = Ptx::from_file(kernel_module);
        let module = ctx.load_module(ptx).map_err(|err| {
            DeviceError::Launch(format!(
                "failed to load search module '{}': {err:?}",
                kernel_module.display()
            ))
        })?;
        let kernel = module.load_function(SEARCH_KERNEL_NAME).map_err(|err| {
            DeviceError::Launch(format!(
                "search module is missing '{SEARCH_KERNEL_NAME}': {err:?}"
            ))
        })?;

        Ok(Self {
            stream,
            kernel,
            buffers: HashMap::new(),
            next_id: 1,
            device_index,
        })
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    fn slice(&self, buffer: &DeviceBuffer) -> Result<&CudaSlice<u8>, DeviceError> {
        self.buffers
            .get(&buffer.id())
            .ok_or(DeviceError::InvalidHandle(buffer.id()))
    }
}

impl DeviceDriver for CudaDriver {
    fn alloc(&mut self, bytes: usize) -> Result<DeviceBuffer, DeviceError> {
        let slice = self
            .stream
            .alloc_zeros::<u8>(bytes)
            .map_err(|err| DeviceError::Alloc {
                bytes,
                reason: format!("{err:?}"),
            })?;
        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(id, slice);
        Ok(DeviceBuffer::new(id, bytes))
    }

    fn free(&mut self, buffer: DeviceBuffer) -> Result<(), DeviceError> {
        match self.buffers.remove(&buffer.id()) {
            Some(slice) => {
                drop(slice);
                Ok(())
            }
            None => Err(DeviceError::InvalidHandle(buffer.id())),
        }
    }

    fn write(&mut self, buffer: &DeviceBuffer, data: &[u8]) -> Result<(), DeviceError> {
        if data.len() != buffer.len() {
            return Err(DeviceError::LenMismatch {
                expected: buffer.len(),
                actual: data.len(),
            });
        }
        let slice = self
            .buffers
            .get_mut(&buffer.id())
            .ok_or(DeviceError::InvalidHandle(buffer.id()))?;
        self.stream
            .memcpy_htod(data, slice)
            .map_err(|err| DeviceError::Copy(format!("host-to-device: {err:?}")))
    }

    fn read(&mut self, buffer: &DeviceBuffer, out: &mut [u8]) -> Result<(), DeviceError> {
        if out.len() != buffer.len() {
            return Err(DeviceError::LenMismatch {
                expected: buffer.len(),
                actual: out.len(),
            });
        }
        let slice = self
            .buffers
            .get(&buffer.id())
            .ok_or(DeviceError::InvalidHandle(buffer.id()))?;
        self.stream
            .memcpy_dtoh(slice, out)
            .map_err(|err| DeviceError::Copy(format!("device-to-host: {err:?}")))
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        self.stream
            .synchronize()
            .map_err(|err| DeviceError::Sync(format!("{err:?}")))
    }

    fn dispatch_search(&mut self, batch: SearchBatch<'_>) -> Result<(), DeviceError> {
        let state = self.slice(batch.state)?;
        let precalc_state = self.slice(batch.precalc_state)?;
        let data = self.slice(batch.data)?;
        let target_high = self.slice(batch.target_high)?;
        let target_low = self.slice(batch.target_low)?;
        let results = self.slice(batch.results)?;

        let grid = (batch.throughput.max(1) + KERNEL_BLOCK_THREADS - 1) / KERNEL_BLOCK_THREADS;
        let cfg = LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (KERNEL_BLOCK_THREADS, 1, 1),
            shared_mem_bytes: 0,
        };

        let start_nonce = batch.start_nonce;
        let throughput = batch.throughput;
        unsafe {
            let mut launch = self.stream.launch_builder(&self.kernel);
            launch
                .arg(&start_nonce)
                .arg(state)
                .arg(precalc_state)
                .arg(data)
                .arg(target_high)
                .arg(target_low)
                .arg(results)
                .arg(&throughput);
            launch
                .launch(cfg)
                .map_err(|err| DeviceError::Launch(format!("{err:?}")))?;
        }
        Ok(())
    }
}

/// Queries NVIDIA devices through `nvidia-smi`, the same surface used for
/// hardware monitoring.
pub fn enumerate_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .map_err(|err| DeviceError::Unavailable(0, format!("failed to run nvidia-smi: {err}")))?;

    if !output.status.success() {
        return Err(DeviceError::NoDevices);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let devices = parse_device_query(&stdout)?;
    if devices.is_empty() {
        return Err(DeviceError::NoDevices);
    }
    Ok(devices)
}

fn parse_device_query(raw: &str) -> Result<Vec<DeviceInfo>, DeviceError> {
    let mut devices = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let columns = line.split(',').map(str::trim).collect::<Vec<_>>();
        if columns.len() < 3 {
            return Err(DeviceError::Unavailable(
                0,
                format!("unexpected nvidia-smi output: '{line}'"),
            ));
        }
        let index = columns[0].parse::<u32>().map_err(|_| {
            DeviceError::Unavailable(0, format!("invalid device index '{}'", columns[0]))
        })?;
        // Device names may contain commas; memory.total is always last.
        let memory_total_mib = columns[columns.len() - 1].parse::<u64>().map_err(|_| {
            DeviceError::Unavailable(
                index,
                format!("invalid memory.total '{}'", columns[columns.len() - 1]),
            )
        })?;
        let name = columns[1..columns.len() - 1].join(",").trim().to_string();

        devices.push(DeviceInfo {
            index,
            name,
            memory_total_mib,
        });
    }
    Ok(devices)
}

/// Temperature and fan snapshot via `nvidia-smi`; zeros when the query fails
/// or a field is not reported (passively cooled cards report no fan).
pub fn hardware_monitor(device_index: u32) -> HwMonitor {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=temperature.gpu,fan.speed",
            "--format=csv,noheader,nounits",
            "-i",
            &device_index.to_string(),
        ])
        .output();

    let Ok(output) = output else {
        return HwMonitor::default();
    };
    if !output.status.success() {
        return HwMonitor::default();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let Some(line) = stdout.lines().next() else {
        return HwMonitor::default();
    };
    let mut columns = line.split(',').map(str::trim);
    let temp_c = columns.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    let fan_pct = columns.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    HwMonitor { temp_c, fan_pct }
}
