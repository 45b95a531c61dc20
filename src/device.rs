use anyhow::{anyhow, Result};
use candle::{DType, Device};
use once_cell::sync::Lazy;
use tracing::warn;

static CUDA_AVAILABLE: Lazy<bool> = Lazy::new(candle::utils::cuda_is_available);

/// Whether a CUDA device can be used by this build.
pub fn gpu_available() -> bool {
    *CUDA_AVAILABLE
}

/// Resolves a device preference such as `cpu`, `cuda` or `cuda:1`.
/// `None` picks CUDA:0 when available and falls back to the CPU.
pub fn select_device(preference: Option<&str>) -> Result<Device> {
    match preference.map(str::trim).filter(|s| !s.is_empty()) {
        Some(pref) => parse_device_preference(pref),
        None => Ok(auto_device()),
    }
}

/// Half precision on GPU, full precision on CPU.
pub fn dtype_for(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

fn auto_device() -> Device {
    if !gpu_available() {
        return Device::Cpu;
    }
    match Device::new_cuda(0) {
        Ok(device) => device,
        Err(err) => {
            warn!(%err, "CUDA reported available but init failed, using CPU");
            Device::Cpu
        }
    }
}

fn parse_device_preference(value: &str) -> Result<Device> {
    let lower = value.to_ascii_lowercase();
    if lower == "cpu" {
        return Ok(Device::Cpu);
    }
    if lower == "auto" {
        return Ok(auto_device());
    }
    if lower.starts_with("cuda") || lower.starts_with("gpu") {
        let ordinal = parse_ordinal(&lower)?;
        return Device::new_cuda(ordinal).map_err(|err| {
            anyhow!(
                "requested CUDA device {ordinal} but initialization failed: {err}. \
                 Build with the `cuda` feature and ensure CUDA libraries are available."
            )
        });
    }
    Err(anyhow!("unrecognized device preference {value:?}"))
}

fn parse_ordinal(lower: &str) -> Result<usize> {
    match lower.split(':').nth(1) {
        None => Ok(0),
        Some(part) => part
            .trim()
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid CUDA ordinal in {lower:?}")),
    }
}
