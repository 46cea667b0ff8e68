//! Neotron BMC Firmware
//!
//! This is the firmware for the Neotron Board Management Controller (BMC). It
//! bridges a legacy PS/2 keyboard to a BLE-HID host via an Adafruit Bluefruit
//! SPI Friend, and controls the power, reset and UART ports on a Neotron
//! mainboard. For more details, see the `README.md` file.
//!
//! # Licence
//! This source code as a whole is licensed under the GPL v3. Third-party crates are covered by their respective licences.
#![no_main]
#![no_std]

use cortex_m::interrupt::free as disable_interrupts;
use heapless::spsc::{Producer, Queue};
use rtic::app;
use stm32f4xx_hal::{
	gpio::gpioa::{PA10, PA11, PA12, PA5, PA6, PA7, PA9},
	gpio::gpiob::{PB0, PB1, PB12, PB15, PB2, PB6},
	gpio::gpioc::{PC0, PC1, PC13, PC2, PC5},
	gpio::{Alternate, Edge, Floating, Input, Output, PullUp, PushPull},
	pac,
	prelude::*,
	serial,
};

use neotron_bmc_nucleo::ble::{HalSdepBus, HalSdepControl, SystickClock};
use neotron_bmc_nucleo::monotonic::MonoTimer;
use neotron_bmc_nucleo::ps2_host::{Ps2BitCollector, QueuePs2Host};

use bmc_core::matrix::Matrix;
use bmc_core::ps2::Ps2Decoder;
use bmc_core::transport::BleTransport;

/// Version string auto-generated by git.
static VERSION: &'static str = include_str!(concat!(env!("OUT_DIR"), "/version.txt"));

/// At what rate do we blink the status LED when we're running?
const LED_PERIOD_MS: u32 = 1000;

/// How often we poll the power and reset buttons in milliseconds.
const DEBOUNCE_POLL_INTERVAL_MS: u32 = 75;

/// How often we run the PS/2 decode + BLE transport scan loop, in
/// milliseconds.
const SCAN_PERIOD_MS: u32 = 5;

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

type BleSpi = stm32f4xx_hal::spi::Spi<pac::SPI1, (PA5<Alternate<PushPull, 5>>, PA6<Alternate<PushPull, 5>>, PA7<Alternate<PushPull, 5>>)>;
type BleControl = HalSdepControl<PB0<Output<PushPull>>, PB2<Input<Floating>>, PB6<Output<PushPull>>>;
type Transport = BleTransport<HalSdepBus<BleSpi>, BleControl, SystickClock>;

#[app(device = crate::pac, peripherals = true, dispatchers=[USART2, USART6])]
mod app {

	use super::*;
	use fugit::ExtU32;

	#[shared]
	struct Shared {
		/// The power LED CN6, pin 5
		#[lock_free]
		led_power: PC1<Output<PushPull>>,
		/// The status LED CN7, pin 35
		#[lock_free]
		led_status: PC2<Output<PushPull>>,
		/// The FTDI UART header (J105) PA9: CN10, pin 21 and PA10: CN10, pin 33
		#[lock_free]
		serial: serial::Serial<
			pac::USART1,
			(PA9<Alternate<PushPull, 7>>, PA10<Alternate<PushPull, 7>>),
		>,
		/// The Clear-To-Send line on the FTDI UART header
		/// (which the serial object can't handle) CN10, pin 14
		#[lock_free]
		pin_uart_cts: PA11<Alternate<PushPull, 7>>,
		/// The Ready-To-Receive line on the FTDI UART header
		/// (which the serial object can't handle) CN10, pin 12
		#[lock_free]
		pin_uart_rts: PA12<Alternate<PushPull, 7>>,
		/// The power button, CN7, pin 23
		#[lock_free]
		button_power: PC13<Input<PullUp>>,
		/// The reset button, CN10, pin 16
		#[lock_free]
		button_reset: PB12<Input<PullUp>>,
		/// Tracks DC power state
		#[lock_free]
		state_dc_power_enabled: DcPowerState,
		/// Controls the DC-DC PSU, CN8, PIN 6
		#[lock_free]
		pin_dc_on: PC0<Output<PushPull>>,
		/// Controls the Reset signal across the main board, putting all the
		/// chips (except this BMC!) in reset when pulled low. CN10, pin 26
		#[lock_free]
		pin_sys_reset: PB15<Output<PushPull>>,
		/// Clock pin for PS/2 Keyboard port, CN10, pin 6
		#[lock_free]
		ps2_clk0: PC5<Input<Floating>>,
		/// Data pin for PS/2 Keyboard port, CN10, pin 24
		#[lock_free]
		ps2_dat0: PB1<Input<Floating>>,
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
		/// Tracks power button state for short presses.
		press_button_power_short: debouncr::Debouncer<u8, debouncr::Repeat2>,
		/// Tracks power button state for long presses.
		/// 75ms x 16 = 1200ms is a long press
		press_button_power_long: debouncr::Debouncer<u16, debouncr::Repeat16>,
		/// Tracks reset button state for long presses. 75ms x 16 = 1200ms is a long press
		press_button_reset_long: debouncr::Debouncer<u16, debouncr::Repeat16>,
		/// Keyboard PS/2 bit collector (clock-edge framing)
		kb_bit_collector: Ps2BitCollector,
		/// Keyboard bytes source
		kb_q_in: Producer<'static, Option<u8>, 8>,
		/// The scan code decoder state machine
		ps2_decoder: Ps2Decoder,
		/// The host adapter handing decoded bytes to `ps2_decoder`
		ps2_host: QueuePs2Host,
	}

	#[monotonic(binds = TIM2, default = true)]
	type MyMono = MonoTimer<pac::TIM2, 1_000_000>;

	/// The entry point to our application.
	///
	/// Sets up the hardware and spawns the regular tasks.
	///
	/// * Task `led_power_blink` - blinks the LED
	/// * Task `button_poll` - checks the power and reset buttons
	/// * Task `scan_task` - decodes PS/2 input and drives the BLE transport
	#[init(local = [queue: Queue<Option<u8>, 8> = Queue::new()])]
	fn init(ctx: init::Context) -> (Shared, Local, init::Monotonics) {
		defmt::info!("Neotron BMC Nucleo version {:?} booting", VERSION);

		let mut dp: pac::Peripherals = ctx.device;

		let clocks = dp
			.RCC
			.constrain()
			.cfgr
			.sysclk(84.mhz())
			.hclk(84.mhz())
			.pclk1(42.mhz())
			.freeze();

		defmt::info!("Configuring TIM2...");
		let mono = MyMono::new(dp.TIM2, &clocks);

		defmt::info!("Creating pins...");
		let gpioa = dp.GPIOA.split();
		let gpiob = dp.GPIOB.split();
		let gpioc = dp.GPIOC.split();
		let (
			uart_tx,
			uart_rx,
			pin_uart_cts,
			pin_uart_rts,
			mut led_power,
			mut led_status,
			button_power,
			button_reset,
			mut pin_dc_on,
			mut pin_sys_reset,
			mut ps2_clk0,
			ps2_dat0,
			mut ble_cs,
			ble_irq,
			mut ble_reset,
			pin_sck,
			pin_miso,
			pin_mosi,
		) = disable_interrupts(|_cs| {
			(
				gpioa.pa9.into_alternate(),
				gpioa.pa10.into_alternate(),
				gpioa.pa11.into_alternate(),
				gpioa.pa12.into_alternate(),
				// power led
				gpioc.pc1.into_push_pull_output(),
				// status led
				gpioc.pc2.into_push_pull_output(),
				// power button
				gpioc.pc13.into_pull_up_input(),
				// reset button
				gpiob.pb12.into_pull_up_input(),
				// dc on
				gpioc.pc0.into_push_pull_output(),
				// system reset
				gpiob.pb15.into_push_pull_output(),
				// PS2_CLK0
				gpioc.pc5.into_floating_input(),
				// PS2_DAT0
				gpiob.pb1.into_floating_input(),
				// ble_cs (was the unused mouse port clock line)
				gpiob.pb0.into_push_pull_output(),
				// ble_irq (was the unused mouse port data line)
				gpiob.pb2.into_floating_input(),
				// ble_reset (was the unused I2C SDA line)
				gpiob.pb6.into_push_pull_output(),
				// pin_sck
				gpioa.pa5.into_alternate(),
				// pin_miso
				gpioa.pa6.into_alternate(),
				// pin_mosi
				gpioa.pa7.into_alternate(),
			)
		});

		pin_sys_reset.set_low();
		pin_dc_on.set_low();
		ble_cs.set_high();
		ble_reset.set_high();

		defmt::info!("Creating UART...");

		let mut serial = serial::Serial::new(
			dp.USART1,
			(uart_tx, uart_rx),
			serial::config::Config::default().baudrate(115_200.bps()),
			&clocks,
		)
		.unwrap();
		serial.listen(serial::Event::Rxne);

		defmt::info!("Creating BLE SPI bus...");
		let ble_spi = stm32f4xx_hal::spi::Spi::new(
			dp.SPI1,
			(pin_sck, pin_miso, pin_mosi),
			embedded_hal::spi::MODE_0,
			4_000_000u32.hz(),
			&clocks,
		);
		let transport = BleTransport::new(
			HalSdepBus::new(ble_spi),
			HalSdepControl::new(ble_cs, ble_irq, ble_reset),
			SystickClock::new(clocks.sysclk().0, || {
				monotonics::now().duration_since_epoch().to_millis() as u16
			}),
			"Neotron BMC",
			"PS/2 Keyboard Bridge",
		);

		led_power.set_low();
		led_status.set_low();

		// Set EXTI for PS2_CLK0 (PC5) as a falling-edge interrupt source.
		let mut sys_cfg = dp.SYSCFG.constrain();
		ps2_clk0.make_interrupt_source(&mut sys_cfg);
		ps2_clk0.enable_interrupt(&mut dp.EXTI);
		ps2_clk0.trigger_on_edge(&mut dp.EXTI, Edge::Falling);

		// Spawn the tasks that run all the time
		led_power_blink::spawn().unwrap();
		button_poll::spawn().unwrap();
		scan_task::spawn().unwrap();

		defmt::info!("Init complete!");

		let (kb_q_in, ps2_q_out) = ctx.local.queue.split();
		let ps2_host = QueuePs2Host::new(ps2_q_out);

		let shared_resources = Shared {
			serial,
			pin_uart_cts,
			pin_uart_rts,
			led_power,
			led_status,
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
			press_button_reset_long: debouncr::debounce_16(false),
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
	/// This task is called when there is nothing else to do. We
	/// sleep the CPU waiting for an interrupt.
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
		binds = EXTI9_5,
		priority = 4,
		shared = [ps2_clk0, ps2_dat0],
		local = [kb_bit_collector, kb_q_in]
	)]
	fn exti9_5_interrupt(ctx: exti9_5_interrupt::Context) {
		let data_bit = ctx.shared.ps2_dat0.is_high();
		if let Some(word) = ctx.local.kb_bit_collector.add_bit(data_bit) {
			let framed = Ps2BitCollector::check_word(word);
			let _ = ctx.local.kb_q_in.enqueue(framed);
		}
		ctx.shared.ps2_clk0.clear_interrupt_pending_bit();
	}

	/// This is the USART1 task.
	///
	/// It fires whenever there is new data received on USART1. We should flag to the host
	/// that data is available.
	#[task(binds = USART1, shared=[serial])]
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
	/// key matrix, then drives the BLE-HID transport scheduler.
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
	#[task(
		shared = [led_power, state_dc_power_enabled],
		local = [led_state:bool = false]
	)]
	fn led_power_blink(ctx: led_power_blink::Context) {
		if *ctx.shared.state_dc_power_enabled == DcPowerState::Off {
			if *ctx.local.led_state {
				ctx.shared.led_power.set_low();
				*ctx.local.led_state = false;
			} else {
				ctx.shared.led_power.set_high();
				*ctx.local.led_state = true;
			}

			led_power_blink::spawn_after(LED_PERIOD_MS.millis()).unwrap();
		}
	}

	/// This task polls our power and reset buttons.
	///
	/// We poll them rather than setting up an interrupt as we need to debounce them, which involves waiting a short period and checking them again. Given that we have to do that, we might as well not bother with the interrupt.
	#[task(
		shared = [led_power, button_power, button_reset, state_dc_power_enabled, pin_sys_reset, pin_dc_on],
		local = [press_button_power_short, press_button_power_long, press_button_reset_long]
	)]
	fn button_poll(ctx: button_poll::Context) {
		// Poll button
		let pwr_pressed: bool = ctx.shared.button_power.is_low();
		let rst_pressed: bool = ctx.shared.button_reset.is_low();
		// Update state
		let pwr_short_edge = ctx.local.press_button_power_short.update(pwr_pressed);
		let pwr_long_edge = ctx.local.press_button_power_long.update(pwr_pressed);
		let rst_long_edge = ctx.local.press_button_reset_long.update(rst_pressed);

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
				ctx.shared.led_power.set_high();
				defmt::info!("Power on!");
				ctx.shared.pin_dc_on.set_high();
				ctx.shared.pin_sys_reset.set_high();
			}
			(None, Some(debouncr::Edge::Falling), DcPowerState::Starting) => {
				defmt::info!("Power button released.");
				// Button released after power on
				*ctx.shared.state_dc_power_enabled = DcPowerState::On;
			}
			(Some(debouncr::Edge::Rising), None, DcPowerState::On) => {
				defmt::info!("Power button held whilst on.");
				*ctx.shared.state_dc_power_enabled = DcPowerState::Off;
				ctx.shared.led_power.set_low();
				defmt::info!("Power off!");
				ctx.shared.pin_sys_reset.set_low();
				ctx.shared.pin_dc_on.set_low();
				// Start LED blinking again
				led_power_blink::spawn().unwrap();
			}
			_ => {
				// Do nothing
			}
		}

		if let Some(debouncr::Edge::Falling) = rst_long_edge {
			defmt::info!("Reset!");
			ctx.shared.pin_sys_reset.set_low();
			ctx.shared.pin_sys_reset.set_high();
		}
		// Re-schedule the timer interrupt
		button_poll::spawn_after(DEBOUNCE_POLL_INTERVAL_MS.millis()).unwrap();
	}
}
