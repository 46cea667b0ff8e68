//! Neotron BMC Firmware
//!
//! This is the firmware for the Neotron Board Management Controller (BMC) as
//! fitted to a Neotron Pico. It bridges a legacy PS/2 keyboard to a BLE-HID
//! host via an Adafruit Bluefruit SPI Friend, and controls the power/reset
//! buttons and status LEDs on the Neotron mainboard. For more details, see
//! the `README.md` file.
//!
//! # Licence
//! This source code as a whole is licensed under the GPL v3. Third-party crates
//! are covered by their respective licences.

#![no_main]
#![no_std]

use heapless::spsc::{Producer, Queue};
use rtic::app;
use stm32f0xx_hal::{
	gpio::gpioa::{PA10, PA11, PA12, PA15, PA2, PA3, PA4, PA5, PA6, PA7, PA9},
	gpio::gpiob::{PB0, PB1, PB3, PB4, PB5},
	gpio::gpiof::{PF0, PF1},
	gpio::{Alternate, Floating, Input, Output, PullUp, PushPull, AF0, AF1},
	pac,
	prelude::*,
	serial,
};

use neotron_bmc_pico::ble::{HalSdepBus, HalSdepControl, SystickClock};
use neotron_bmc_pico::ps2_host::{Ps2BitCollector, QueuePs2Host};

use bmc_core::matrix::Matrix;
use bmc_core::ps2::Ps2Decoder;
use bmc_core::transport::BleTransport;

/// Version string auto-generated by git.
static VERSION: &'static str = include_str!(concat!(env!("OUT_DIR"), "/version.txt"));

/// At what rate do we blink the status LED when we're running?
const LED_PERIOD_MS: u64 = 1000;

/// How often we poll the power and reset buttons in milliseconds.
const DEBOUNCE_POLL_INTERVAL_MS: u64 = 75;

/// Length of a reset pulse, in milliseconds
const RESET_DURATION_MS: u64 = 250;

/// How often we run the PS/2 decode + BLE transport scan loop, in
/// milliseconds. Bound from below by the monotonic's own 5ms tick.
const SCAN_PERIOD_MS: u64 = 5;

/// The states we can be in controlling the DC power
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DcPowerState {
	/// We've just enabled the DC power (so ignore any incoming long presses!)
	Starting = 1,
	/// We are now fully on. Look for a long press to turn off.
	On = 2,
	/// We are fully off.
	Off = 0,
}

type BleSpi = stm32f0xx_hal::spi::Spi<pac::SPI1, (PA5<Alternate<AF0>>, PA6<Alternate<AF0>>, PA7<Alternate<AF0>>)>;
type BleControl = HalSdepControl<PA4<Output<PushPull>>, PB3<Input<Floating>>, PB5<Output<PushPull>>>;
type Transport = BleTransport<HalSdepBus<BleSpi>, BleControl, SystickClock>;

#[app(device = crate::pac, peripherals = true, dispatchers = [USB, USART3_4_5_6, TIM14, TIM15, TIM16, TIM17, PVD])]
mod app {
	use super::*;
	use systick_monotonic::*; // Implements the `Monotonic` trait

	#[shared]
	struct Shared {
		/// The power LED (D1101)
		#[lock_free]
		led_power: PB0<Output<PushPull>>,
		/// The status LED (D1102)
		#[lock_free]
		_buzzer_pwm: PB1<Output<PushPull>>,
		/// The FTDI UART header (J105)
		#[lock_free]
		serial: serial::Serial<pac::USART1, PA9<Alternate<AF1>>, PA10<Alternate<AF1>>>,
		/// The Clear-To-Send line on the FTDI UART header (which the serial object can't handle)
		#[lock_free]
		_pin_uart_cts: PA11<Alternate<AF1>>,
		/// The Ready-To-Receive line on the FTDI UART header (which the serial object can't handle)
		#[lock_free]
		_pin_uart_rts: PA12<Alternate<AF1>>,
		/// The power button
		#[lock_free]
		button_power: PF0<Input<PullUp>>,
		/// The reset button
		#[lock_free]
		button_reset: PF1<Input<PullUp>>,
		/// Tracks DC power state
		#[lock_free]
		state_dc_power_enabled: DcPowerState,
		/// Controls the DC-DC PSU
		#[lock_free]
		pin_dc_on: PA3<Output<PushPull>>,
		/// Controls the Reset signal across the main board, putting all the
		/// chips (except this BMC!) in reset when pulled low.
		#[lock_free]
		pin_sys_reset: PA2<Output<PushPull>>,
		/// Clock pin for PS/2 Keyboard port
		#[lock_free]
		ps2_clk0: PA15<Input<Floating>>,
		/// Data pin for PS/2 Keyboard port
		#[lock_free]
		ps2_dat0: PB4<Input<Floating>>,
		/// The external interrupt peripheral
		#[lock_free]
		exti: pac::EXTI,
		/// The decoded 32x8 key matrix.
		#[lock_free]
		matrix: Matrix,
		/// The BLE-HID SDEP/AT transport and its send/response queues.
		#[lock_free]
		transport: Transport,
	}

	#[local]
	struct Local {
		/// Tracks power button state for short presses. 75ms x 2 = 150ms is a short press
		press_button_power_short: debouncr::Debouncer<u8, debouncr::Repeat2>,
		/// Tracks power button state for long presses. 75ms x 16 = 1200ms is a long press
		press_button_power_long: debouncr::Debouncer<u16, debouncr::Repeat16>,
		/// Tracks reset button state for short presses. 75ms x 2 = 150ms is a long press
		press_button_reset_short: debouncr::Debouncer<u8, debouncr::Repeat2>,
		/// Keyboard PS/2 bit collector (clock-edge framing)
		kb_bit_collector: Ps2BitCollector,
		/// Keyboard bytes source
		kb_q_in: Producer<'static, Option<u8>, 8>,
		/// The scan code decoder state machine
		ps2_decoder: Ps2Decoder,
		/// The host adapter handing decoded bytes to `ps2_decoder`
		ps2_host: QueuePs2Host,
	}

	#[monotonic(binds = SysTick, default = true)]
	type MyMono = Systick<200>; // 200 Hz (= 5ms) timer tick

	/// The entry point to our application.
	///
	/// Sets up the hardware and spawns the regular tasks.
	///
	/// * Task `led_power_blink` - blinks the LED
	/// * Task `button_poll` - checks the power and reset buttons
	/// * Task `scan_task` - decodes PS/2 input and drives the BLE transport
	#[init(local = [ queue: Queue<Option<u8>, 8> = Queue::new()])]
	fn init(ctx: init::Context) -> (Shared, Local, init::Monotonics) {
		defmt::info!("Neotron BMC version {:?} booting", VERSION);

		let dp: pac::Peripherals = ctx.device;
		let cp: cortex_m::Peripherals = ctx.core;

		let mut flash = dp.FLASH;
		let mut rcc = dp
			.RCC
			.configure()
			.hclk(48.mhz())
			.pclk(48.mhz())
			.sysclk(48.mhz())
			.freeze(&mut flash);

		defmt::info!("Configuring SysTick...");
		// Initialize the monotonic timer using the Cortex-M SysTick peripheral
		let mono = Systick::new(cp.SYST, rcc.clocks.sysclk().0);

		defmt::info!("Creating pins...");
		let gpioa = dp.GPIOA.split(&mut rcc);
		let gpiob = dp.GPIOB.split(&mut rcc);
		let gpiof = dp.GPIOF.split(&mut rcc);
		// We have to have the closure return a tuple of all our configured
		// pins because by taking fields from `gpioa`, `gpiob`, etc, we leave
		// them as partial structures. This prevents us from having a call to
		// `disable_interrupts` for each pin. We can't simply do the `let foo
		// = ` inside the closure either, as the pins would be dropped when
		// the closure ended. So, we have this slightly awkward syntax
		// instead. Do ensure the pins and the variables line-up correctly;
		// order is important!
		let (
			uart_tx,
			uart_rx,
			_pin_uart_cts,
			_pin_uart_rts,
			mut led_power,
			mut _buzzer_pwm,
			button_power,
			button_reset,
			mut pin_dc_on,
			mut pin_sys_reset,
			ps2_clk0,
			ps2_dat0,
			mut ble_cs,
			ble_irq,
			mut ble_reset,
			pin_sck,
			pin_cipo,
			pin_copi,
		) = cortex_m::interrupt::free(|cs| {
			(
				// uart_tx,
				gpioa.pa9.into_alternate_af1(cs),
				// uart_rx,
				gpioa.pa10.into_alternate_af1(cs),
				// _pin_uart_cts,
				gpioa.pa11.into_alternate_af1(cs),
				// _pin_uart_rts,
				gpioa.pa12.into_alternate_af1(cs),
				// led_power,
				gpiob.pb0.into_push_pull_output(cs),
				// _buzzer_pwm,
				gpiob.pb1.into_push_pull_output(cs),
				// button_power,
				gpiof.pf0.into_pull_up_input(cs),
				// button_reset,
				gpiof.pf1.into_pull_up_input(cs),
				// pin_dc_on,
				gpioa.pa3.into_push_pull_output(cs),
				// pin_sys_reset,
				gpioa.pa2.into_push_pull_output(cs),
				// ps2_clk0,
				gpioa.pa15.into_floating_input(cs),
				// ps2_dat0,
				gpiob.pb4.into_floating_input(cs),
				// ble_cs (was the SPI CS input; the BLE link is SPI master, so
				// this board now drives chip select itself),
				gpioa.pa4.into_push_pull_output(cs),
				// ble_irq (was the unused second PS/2 port's clock line),
				gpiob.pb3.into_floating_input(cs),
				// ble_reset (was the unused second PS/2 port's data line),
				gpiob.pb5.into_push_pull_output(cs),
				// pin_sck,
				gpioa.pa5.into_alternate_af0(cs),
				// pin_cipo,
				gpioa.pa6.into_alternate_af0(cs),
				// pin_copi,
				gpioa.pa7.into_alternate_af0(cs),
			)
		});

		pin_sys_reset.set_low().unwrap();
		pin_dc_on.set_low().unwrap();
		ble_cs.set_high().unwrap();
		ble_reset.set_high().unwrap();

		defmt::info!("Creating UART...");

		let mut serial =
			serial::Serial::usart1(dp.USART1, (uart_tx, uart_rx), 115_200.bps(), &mut rcc);

		serial.listen(serial::Event::Rxne);

		defmt::info!("Creating BLE SPI bus...");
		let ble_spi = stm32f0xx_hal::spi::Spi::spi1(
			dp.SPI1,
			(pin_sck, pin_cipo, pin_copi),
			embedded_hal::spi::MODE_0,
			4_000_000u32.hz(),
			&mut rcc,
		);
		let sysclk_hz = rcc.clocks.sysclk().0;
		let transport = BleTransport::new(
			HalSdepBus::new(ble_spi),
			HalSdepControl::new(ble_cs, ble_irq, ble_reset),
			SystickClock::new(sysclk_hz, || {
				monotonics::now().duration_since_epoch().to_millis() as u16
			}),
			"Neotron BMC",
			"PS/2 Keyboard Bridge",
		);

		led_power.set_low().unwrap();
		_buzzer_pwm.set_low().unwrap();

		// Set EXTI15 to use PORT A (PA15) - button input
		dp.SYSCFG.exticr4.modify(|_r, w| w.exti15().pa15());

		// Enable EXTI15 interrupt as external falling edge
		dp.EXTI.imr.modify(|_r, w| w.mr15().set_bit());
		dp.EXTI.emr.modify(|_r, w| w.mr15().set_bit());
		dp.EXTI.ftsr.modify(|_r, w| w.tr15().set_bit());

		// Spawn the tasks that run all the time
		led_power_blink::spawn().unwrap();
		button_poll::spawn().unwrap();
		scan_task::spawn().unwrap();

		defmt::info!("Init complete!");

		let (kb_q_in, ps2_q_out) = ctx.local.queue.split();
		let ps2_host = QueuePs2Host::new(ps2_q_out);

		let shared_resources = Shared {
			serial,
			_pin_uart_cts,
			_pin_uart_rts,
			led_power,
			_buzzer_pwm,
			button_power,
			button_reset,
			state_dc_power_enabled: DcPowerState::Off,
			pin_dc_on,
			pin_sys_reset,
			ps2_clk0,
			ps2_dat0,
			exti: dp.EXTI,
			matrix: Matrix::new(),
			transport,
		};
		let local_resources = Local {
			press_button_power_short: debouncr::debounce_2(false),
			press_button_power_long: debouncr::debounce_16(false),
			press_button_reset_short: debouncr::debounce_2(false),
			kb_bit_collector: Ps2BitCollector::new(),
			kb_q_in,
			ps2_decoder: Ps2Decoder::new(),
			ps2_host,
		};
		let init = init::Monotonics(mono);
		(shared_resources, local_resources, init)
	}

	/// Our idle task.
	///
	/// This task is called when there is nothing else to do.
	#[idle]
	fn idle(_ctx: idle::Context) -> ! {
		defmt::info!("Idle is running...");
		loop {
			cortex_m::asm::wfi();
		}
	}

	/// This is the PS/2 Keyboard task.
	///
	/// It is very high priority, as we can't afford to miss a clock edge.
	///
	/// It fires when there is a falling edge on the PS/2 Keyboard clock pin.
	#[task(
		binds = EXTI4_15,
		priority = 4,
		shared = [ps2_clk0, ps2_dat0, exti],
		local = [kb_bit_collector, kb_q_in]
	)]
	fn exti4_15_interrupt(ctx: exti4_15_interrupt::Context) {
		let pr = ctx.shared.exti.pr.read();
		// Is this EXT15 (PS/2 Port 0 clock input)
		if pr.pr15().bit_is_set() {
			let data_bit = ctx.shared.ps2_dat0.is_high().unwrap();
			// Do we have a complete 11-bit word?
			if let Some(word) = ctx.local.kb_bit_collector.add_bit(data_bit) {
				let framed = Ps2BitCollector::check_word(word);
				// Don't dump in the ISR - we're busy. Add it to this nice lockless queue instead.
				let _ = ctx.local.kb_q_in.enqueue(framed);
			}
			// Clear the pending flag
			ctx.shared.exti.pr.write(|w| w.pr15().set_bit());
		}
	}

	/// This is the USART1 task.
	///
	/// It fires whenever there is new data received on USART1. We should flag to the host
	/// that data is available.
	#[task(binds = USART1, shared = [serial])]
	fn usart1_interrupt(ctx: usart1_interrupt::Context) {
		// Reading the register clears the RX-Not-Empty-Interrupt flag.
		match ctx.shared.serial.read() {
			Ok(b) => {
				defmt::info!("<< UART {:x}", b);
			}
			Err(_) => {
				defmt::warn!("<< UART None?");
			}
		}
	}

	/// Decodes any PS/2 bytes that have arrived since the last tick into the
	/// key matrix, then drives the BLE-HID transport scheduler. Stands in
	/// for the donor firmware's ~1 kHz scan loop.
	///
	/// `DecodeEvent::None` covers both "queue empty" and "ordinary make/break
	/// consumed", so draining must be gated on the queue itself, not on the
	/// decode event. We still call `scan()` at least once even with an empty
	/// queue, since it also synthesises the Pause one-tick break.
	#[task(shared = [matrix, transport], local = [ps2_decoder, ps2_host])]
	fn scan_task(mut ctx: scan_task::Context) {
		loop {
			let had_byte = !ctx.local.ps2_host.is_empty();
			let event = ctx
				.shared
				.matrix
				.lock(|matrix| ctx.local.ps2_decoder.scan(ctx.local.ps2_host, matrix));
			defmt::trace!("ps2 decode event: {:?}", defmt::Debug2Format(&event));
			if !had_byte {
				break;
			}
		}

		if ctx.shared.matrix.lock(|matrix| matrix.take_modified()) {
			defmt::info!("key matrix changed");
		}

		ctx.shared.transport.lock(|transport| transport.task());

		scan_task::spawn_after(SCAN_PERIOD_MS.millis()).unwrap();
	}

	/// This is the LED blink task.
	///
	/// This task is called periodically. We check whether the status LED is currently on or off,
	/// and set it to the opposite. This makes the LED blink.
	#[task(shared = [led_power, state_dc_power_enabled], local = [ led_state: bool = false ])]
	fn led_power_blink(ctx: led_power_blink::Context) {
		if *ctx.shared.state_dc_power_enabled == DcPowerState::Off {
			if *ctx.local.led_state {
				ctx.shared.led_power.set_low().unwrap();
				*ctx.local.led_state = false;
			} else {
				ctx.shared.led_power.set_high().unwrap();
				*ctx.local.led_state = true;
			}
			led_power_blink::spawn_after(LED_PERIOD_MS.millis()).unwrap();
		}
	}

	/// This task polls our power and reset buttons.
	///
	/// We poll them rather than setting up an interrupt as we need to debounce
	/// them, which involves waiting a short period and checking them again.
	/// Given that we have to do that, we might as well not bother with the
	/// interrupt.
	#[task(
		shared = [
			led_power, button_power, button_reset,
			state_dc_power_enabled, pin_sys_reset, pin_dc_on
		],
		local = [ press_button_power_short, press_button_power_long, press_button_reset_short ]
	)]
	fn button_poll(ctx: button_poll::Context) {
		// Poll buttons
		let pwr_pressed: bool = ctx.shared.button_power.is_low().unwrap();
		let rst_pressed: bool = ctx.shared.button_reset.is_low().unwrap();

		// Update state
		let pwr_short_edge = ctx.local.press_button_power_short.update(pwr_pressed);
		let pwr_long_edge = ctx.local.press_button_power_long.update(pwr_pressed);
		let rst_long_edge = ctx.local.press_button_reset_short.update(rst_pressed);

		defmt::trace!(
			"pwr/rst {}/{} {}",
			pwr_pressed,
			rst_pressed,
			match rst_long_edge {
				Some(debouncr::Edge::Rising) => "rising",
				Some(debouncr::Edge::Falling) => "falling",
				None => "-",
			}
		);

		// Dispatch event
		match (
			pwr_long_edge,
			pwr_short_edge,
			*ctx.shared.state_dc_power_enabled,
		) {
			(None, Some(debouncr::Edge::Rising), DcPowerState::Off) => {
				defmt::info!("Power button pressed whilst off.");
				// Button pressed - power on system
				*ctx.shared.state_dc_power_enabled = DcPowerState::Starting;
				ctx.shared.led_power.set_high().unwrap();
				defmt::info!("Power on!");
				ctx.shared.pin_dc_on.set_high().unwrap();
				// TODO: Start monitoring 3.3V and 5.0V rails here
				// TODO: Take system out of reset when 3.3V and 5.0V are good
				ctx.shared.pin_sys_reset.set_high().unwrap();
			}
			(None, Some(debouncr::Edge::Falling), DcPowerState::Starting) => {
				defmt::info!("Power button released.");
				// Button released after power on
				*ctx.shared.state_dc_power_enabled = DcPowerState::On;
			}
			(Some(debouncr::Edge::Rising), None, DcPowerState::On) => {
				defmt::info!("Power button held whilst on.");
				*ctx.shared.state_dc_power_enabled = DcPowerState::Off;
				ctx.shared.led_power.set_low().unwrap();
				defmt::info!("Power off!");
				ctx.shared.pin_sys_reset.set_low().unwrap();
				ctx.shared.pin_dc_on.set_low().unwrap();
				// Start LED blinking again
				led_power_blink::spawn().unwrap();
			}
			_ => {
				// Do nothing
			}
		}

		// Did reset get a long press?
		if let Some(debouncr::Edge::Rising) = rst_long_edge {
			// Is the board powered on? Don't do a reset if it's powered off.
			if *ctx.shared.state_dc_power_enabled == DcPowerState::On {
				defmt::info!("Reset!");
				ctx.shared.pin_sys_reset.set_low().unwrap();
				// Returns an error if it's already scheduled
				let _ = exit_reset::spawn_after(RESET_DURATION_MS.millis());
			}
		}

		// Re-schedule the timer interrupt
		button_poll::spawn_after(DEBOUNCE_POLL_INTERVAL_MS.millis()).unwrap();
	}

	/// Return the reset line high (inactive), but only if we're still powered on.
	#[task(shared = [pin_sys_reset, state_dc_power_enabled])]
	fn exit_reset(ctx: exit_reset::Context) {
		defmt::debug!("End reset");
		if *ctx.shared.state_dc_power_enabled == DcPowerState::On {
			ctx.shared.pin_sys_reset.set_high().unwrap();
		}
	}
}
