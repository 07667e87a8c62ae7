//! 数据消费者 - 按名称查找并导入 GPU 内存
//!
//! 使用方法:
//! ```bash
//! cargo run -p ipcreg-core --features cuda --example consumer
//! ```

use ipcreg_core::{ImportedMemory, Registry};
use tracing_subscriber::EnvFilter;

const NAME: &str = "demo_tensor";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let registry = Registry::global();
    println!("Waiting for '{}'...", NAME);
    let handle = registry.lookup_blocking(NAME)?;
    println!("Found: {:?}", handle);

    let memory = ImportedMemory::open(0, &handle)?;
    println!(
        "Imported on device {}: ptr=0x{:x} size={}",
        memory.device_id(),
        memory.device_ptr(),
        memory.size()
    );

    Ok(())
}
