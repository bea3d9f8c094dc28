// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware tests
//!
//! Need a booted machine reachable at `$SPINN_HOST`.

use spinn_driver::{MachineConfig, MachineController};

fn host() -> String {
    std::env::var("SPINN_HOST").unwrap_or_else(|_| "spinn-4".to_string())
}

#[test]
#[ignore] // Requires hardware
fn test_sver_root_chip() {
    let mut mc = MachineController::connect(&host(), MachineConfig::default()).expect("connect");
    let info = mc.software_version(0, 0, 0).expect("sver");
    println!("{info}");
    assert_eq!(info.position, (0, 0));
    assert!(info.buffer_size >= 4);
}

#[test]
#[ignore] // Requires hardware
fn test_sdram_write_read() {
    let mut mc = MachineController::connect(&host(), MachineConfig::default()).expect("connect");
    let address = mc.sdram_alloc(0, 0, 4096, 0, 66).expect("alloc");
    let data: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
    mc.write(0, 0, 0, address, &data).expect("write");
    assert_eq!(mc.read(0, 0, 0, address, data.len()).expect("read"), data);
}
