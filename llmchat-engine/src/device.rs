use candle::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use tracing::info;

/// Picks the device the engine runs on: CUDA first, then Metal, then CPU.
pub fn device(device_id: usize) -> Result<Device, candle::Error> {
    if cuda_is_available() {
        info!(device_id, "Using CUDA");
        Device::new_cuda(device_id)
    } else if metal_is_available() {
        info!(device_id, "Using Metal");
        Device::new_metal(device_id)
    } else {
        info!("Using Cpu");
        Ok(Device::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_falls_back_to_cpu() {
        let device = device(0).expect("Failed to select device");
        if !cuda_is_available() && !metal_is_available() {
            assert!(device.is_cpu());
        }
    }
}
