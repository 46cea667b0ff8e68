//! A free-running `TIM2`-based `Monotonic` for RTIC, used in place of
//! `systick-monotonic` on the F4 Nucleo board (its `SysTick` is reserved by
//! `cortex-m-rtic`'s own scheduler on this part).

use core::marker::PhantomData;

use fugit::TimerInstantU32;
use rtic_monotonic::Monotonic;
use stm32f4xx_hal::{pac, rcc::Clocks};

/// A `Monotonic` driven by a 32-bit general purpose timer running at `FREQ`
/// Hz, stopping at the free-running 32-bit counter wraparound.
pub struct MonoTimer<TIM, const FREQ: u32> {
	timer: TIM,
	_marker: PhantomData<TIM>,
}

impl<const FREQ: u32> MonoTimer<pac::TIM2, FREQ> {
	/// Configure `tim` to free-run at `FREQ` Hz off the APB1 timer clock.
	pub fn new(tim: pac::TIM2, clocks: &Clocks) -> Self {
		// TIM2 hangs off APB1; the timer clock is doubled over the bus clock
		// whenever the APB1 prescaler is not 1 (true for every Nucleo clock
		// tree we configure here).
		let timer_clock_hz = clocks.pclk1().0 * 2;
		let psc = timer_clock_hz / FREQ - 1;

		tim.psc.write(|w| w.psc().bits(psc as u16));
		tim.arr.write(|w| unsafe { w.bits(u32::MAX) });
		tim.egr.write(|w| w.ug().set_bit());
		tim.sr.modify(|_, w| w.uif().clear_bit());
		tim.cr1.modify(|_, w| w.cen().set_bit());

		MonoTimer {
			timer: tim,
			_marker: PhantomData,
		}
	}
}

impl<const FREQ: u32> Monotonic for MonoTimer<pac::TIM2, FREQ> {
	type Instant = TimerInstantU32<FREQ>;
	type Duration = fugit::TimerDurationU32<FREQ>;

	fn now(&mut self) -> Self::Instant {
		TimerInstantU32::from_ticks(self.timer.cnt.read().bits())
	}

	fn zero() -> Self::Instant {
		TimerInstantU32::from_ticks(0)
	}

	unsafe fn reset(&mut self) {
		self.timer.dier.modify(|_, w| w.cc1ie().set_bit());
	}

	fn set_compare(&mut self, instant: Self::Instant) {
		self.timer
			.ccr1
			.write(|w| unsafe { w.bits(instant.duration_since_epoch().ticks()) });
	}

	fn clear_compare_flag(&mut self) {
		self.timer.sr.modify(|_, w| w.cc1if().clear_bit());
	}

	fn on_interrupt(&mut self) {
		if self.timer.sr.read().uif().bit_is_set() {
			self.timer.sr.modify(|_, w| w.uif().clear_bit());
		}
	}

	fn enable_timer(&mut self) {
		self.timer.dier.modify(|_, w| w.cc1ie().set_bit());
	}

	fn disable_timer(&mut self) {
		self.timer.dier.modify(|_, w| w.cc1ie().clear_bit());
	}
}
