//! 数据生产者 - 分配 GPU 内存并按名称注册
//!
//! 使用方法:
//! ```bash
//! RUST_LOG=debug cargo run -p ipcreg-core --features cuda --example producer
//! ```

use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr};
use ipcreg_core::Registry;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const NAME: &str = "demo_tensor";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let device = CudaDevice::new(0)?;
    let data: Vec<f32> = (0..1024).map(|i| i as f32).collect();
    let slice: CudaSlice<f32> = device.htod_sync_copy(&data)?;
    let ptr = *slice.device_ptr();
    let size = (data.len() * std::mem::size_of::<f32>()) as u64;

    let registry = Registry::global();
    registry.register(ptr, size, NAME)?;
    println!("Registered '{}': ptr=0x{:x} size={}", NAME, ptr, size);
    println!("Stats: {:?}", registry.stats()?);

    // 保持分配存活，供 consumer 导入
    println!("\nPress Ctrl+C to exit...");
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
