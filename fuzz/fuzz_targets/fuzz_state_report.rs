//! Fuzz target: JSON deserialization of the control-API state report.
//!
//! Arbitrary bytes fed to the parser must never panic; errors are expected
//! and fine.

#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_core::VmStateReport;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<VmStateReport>(data);
});
