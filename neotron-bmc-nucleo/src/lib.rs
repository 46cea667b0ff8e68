//! Glue crate for the Neotron BMC Nucleo firmware: wires up the `defmt` RTT
//! logger and panic handler so `main.rs` only needs `use
//! neotron_bmc_nucleo as _;`.
#![no_std]

use defmt_rtt as _;
use panic_probe as _;

pub mod ble;
pub mod monotonic;
pub mod ps2_host;
