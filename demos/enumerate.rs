//! Prints every backend compiled into this build and the devices each one
//! can see.

use resound::{BackendId, Host};

fn main() -> anyhow::Result<()> {
    for backend in resound::available_backends() {
        println!("{backend}:");
        let mut host = match Host::new(backend) {
            Ok(host) => host,
            Err(err) => {
                println!("  unavailable: {err}");
                continue;
            }
        };
        let count = host.device_count()?;
        if count == 0 {
            println!("  no devices");
        }
        for index in 0..count {
            let info = host.device_info(index)?;
            let default = match (info.is_default_output, info.is_default_input) {
                (true, true) => " (default out+in)",
                (true, false) => " (default out)",
                (false, true) => " (default in)",
                (false, false) => "",
            };
            println!(
                "  [{index}] {}{default}: {} out / {} in / {} duplex",
                info.name, info.output_channels, info.input_channels, info.duplex_channels,
            );
            println!("      rates: {:?}", info.sample_rates);
            println!("      formats: {:?}", info.native_formats);
        }
        if backend == BackendId::Null {
            break;
        }
    }
    Ok(())
}
