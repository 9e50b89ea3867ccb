// Examples are allowed to use expect/unwrap for simplicity
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Serve a plain file as a SCSI block device.
//!
//! The volume takes the file's basename and size; the resulting block
//! device node appears under `/dev/tcmufile`.
//!
//! # Usage
//!
//! ```bash
//! truncate -s 1G volume.img
//! RUST_LOG=debug cargo run --example tcmufile -- volume.img
//! ```
//!
//! Requires root (configfs and mknod) and the `target_core_user` kernel
//! module.

use std::path::PathBuf;
use std::sync::Arc;

use tcmud_device::{BlockEmulator, DataSizes, Device, DeviceConfig};

const BLOCK_SIZE: u32 = 1024;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 || args[1] == "--help" || args[1] == "-h" {
        die("usage: tcmufile <backing-file>");
    }

    let path = PathBuf::from(&args[1]);
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap_or_else(|err| die(&format!("couldn't open {}: {err}", path.display())));

    let file_len = file.metadata().expect("stat backing file").len();
    let volume_size = file_len - file_len % u64::from(BLOCK_SIZE);
    if volume_size == 0 {
        die(&format!("{} is smaller than one block", path.display()));
    }

    let volume_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| die("backing file has no name"));

    let mut config = DeviceConfig::basic(
        volume_name.clone(),
        DataSizes {
            volume_size,
            block_size: BLOCK_SIZE,
        },
    );
    config.dev_path = PathBuf::from("/dev/tcmufile");

    let emulator = Arc::new(BlockEmulator::new(file, Arc::new(config.clone())));
    let device = Device::open(config, emulator)
        .await
        .unwrap_or_else(|err| die(&format!("couldn't attach device: {err}")));

    println!("tcmud attached to /dev/tcmufile/{volume_name}");

    tokio::signal::ctrl_c().await.expect("install ctrl-c handler");
    println!("\nstopping");

    if let Err(err) = device.close().await {
        die(&format!("teardown failed: {err}"));
    }
}

fn die(why: &str) -> ! {
    eprintln!("{why}");
    std::process::exit(1);
}
