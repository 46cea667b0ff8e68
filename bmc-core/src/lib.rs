//! PS/2 Scan Code Set 2 decoder and Adafruit Bluefruit BLE-HID transport
//! queue, factored out of the board firmware so the state machines can
//! be unit tested on the host.
#![cfg_attr(not(test), no_std)]

pub(crate) mod log;

pub mod at_command;
pub mod matrix;
pub mod ps2;
pub mod queue;
pub mod ringbuffer;
pub mod sdep;
pub mod transport;
