//! Thin shim over `defmt`'s logging macros.
//!
//! `bmc-core` is built two ways: `no_std` on target, where a `defmt`
//! global logger is always registered by the board crate, and plain `std`
//! under `cargo test`, where nothing provides one. Calling the real
//! `defmt::info!` et al. from a test binary fails to link (no logger), so
//! the macros are no-ops unless the `defmt` feature is enabled.

#[cfg(feature = "defmt")]
pub(crate) use defmt::{debug, info, trace, warn};

#[cfg(not(feature = "defmt"))]
macro_rules! info {
	($($arg:tt)*) => {};
}
#[cfg(not(feature = "defmt"))]
macro_rules! warn {
	($($arg:tt)*) => {};
}
#[cfg(not(feature = "defmt"))]
macro_rules! debug {
	($($arg:tt)*) => {};
}
#[cfg(not(feature = "defmt"))]
macro_rules! trace {
	($($arg:tt)*) => {};
}

#[cfg(not(feature = "defmt"))]
pub(crate) use {debug, info, trace, warn};
