//! Thin `embedded-hal` adapters binding `bmc_core`'s transport traits to
//! whatever concrete SPI/GPIO/timer types a board's `init` assembles.
//!
//! Kept generic over the `embedded-hal` 0.2 traits rather than naming
//! concrete HAL pin types, so the same adapters serve both board crates.

use bmc_core::sdep::{Clock, SdepBus, SdepControl};
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::{InputPin, OutputPin};

/// Drives the Bluefruit co-processor's SPI bus (mode 0, MSB-first, 4 MHz
/// per the transport's wiring notes) one byte at a time.
pub struct HalSdepBus<SPI> {
	spi: SPI,
}

impl<SPI> HalSdepBus<SPI> {
	pub fn new(spi: SPI) -> Self {
		HalSdepBus { spi }
	}
}

impl<SPI> SdepBus for HalSdepBus<SPI>
where
	SPI: Transfer<u8>,
{
	fn transfer_byte(&mut self, tx: u8) -> u8 {
		let mut buf = [tx];
		match self.spi.transfer(&mut buf) {
			Ok(rx) => rx[0],
			Err(_) => 0,
		}
	}
}

/// Chip-select, IRQ and hardware-reset lines around the SDEP bus.
pub struct HalSdepControl<CS, IRQ, RESET> {
	cs: CS,
	irq: IRQ,
	reset: RESET,
}

impl<CS, IRQ, RESET> HalSdepControl<CS, IRQ, RESET> {
	pub fn new(cs: CS, irq: IRQ, reset: RESET) -> Self {
		HalSdepControl { cs, irq, reset }
	}
}

impl<CS, IRQ, RESET> SdepControl for HalSdepControl<CS, IRQ, RESET>
where
	CS: OutputPin,
	IRQ: InputPin,
	RESET: OutputPin,
{
	fn cs_low(&mut self) {
		let _ = self.cs.set_low();
	}

	fn cs_high(&mut self) {
		let _ = self.cs.set_high();
	}

	fn irq_is_high(&mut self) -> bool {
		self.irq.is_high().unwrap_or(false)
	}

	fn reset_low(&mut self) {
		let _ = self.reset.set_low();
	}

	fn reset_high(&mut self) {
		let _ = self.reset.set_high();
	}
}

/// Millisecond wall clock backed by the RTIC monotonic, plus a
/// cycle-counter busy-wait for the sub-millisecond SDEP back-off.
pub struct SystickClock {
	sysclk_hz: u32,
	millis: fn() -> u16,
}

impl SystickClock {
	pub fn new(sysclk_hz: u32, millis: fn() -> u16) -> Self {
		SystickClock { sysclk_hz, millis }
	}
}

impl Clock for SystickClock {
	fn now_ms(&mut self) -> u16 {
		(self.millis)()
	}

	fn delay_us(&mut self, us: u32) {
		let cycles = (self.sysclk_hz / 1_000_000).max(1) * us;
		cortex_m::asm::delay(cycles);
	}
}
