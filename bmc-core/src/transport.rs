//! BLE-HID transport state and scheduler (component G, the owning context).
//!
//! Ported from `adafruit_ble_task`/`adafruit_ble_enable_keyboard`/
//! `process_queue_item` and the `send_keys`/`send_consumer_key`/
//! `send_mouse_move` producers. [`BleTransport`] is the single owning
//! context object the spec's Design Notes ask for in place of hidden
//! process-wide globals.

use core::fmt::Write as _;

use crate::at_command::{self, SDEP_SHORT_TIMEOUT_MS, SDEP_TIMEOUT_MS};
use crate::queue::{QueueItem, QueueItemKind, ResponseBuffer, SendBuffer};
use crate::sdep::{elapsed_ms, Clock, SdepBus, SdepControl};

#[cfg(feature = "mouse")]
use crate::queue::mouse_buttons;

/// `ConnectionUpdateInterval` in the original.
pub const CONNECTION_UPDATE_INTERVAL_MS: u16 = 1000;
/// `BatteryUpdateInterval` in the original.
pub const BATTERY_UPDATE_INTERVAL_MS: u16 = 10_000;

bitflags::bitflags! {
	/// Which optional BLE event features we've probed/enabled.
	#[derive(Default)]
	struct EventFlags: u8 {
		const PROBED_EVENTS = 1 << 0;
		const USING_EVENTS  = 1 << 1;
	}
}

/// `Transport State` from spec.md §3.
#[derive(Debug)]
pub struct TransportState {
	pub initialized: bool,
	pub configured: bool,
	pub is_connected: bool,
	event_flags: EventFlags,
	pub last_battery_update: u16,
	pub last_connection_update: u16,
	pub vbat: u32,
}

impl Default for TransportState {
	fn default() -> Self {
		TransportState {
			initialized: false,
			configured: false,
			is_connected: false,
			event_flags: EventFlags::empty(),
			last_battery_update: 0,
			last_connection_update: 0,
			vbat: 0,
		}
	}
}

/// The BLE-HID transport: owns the SPI/GPIO/clock handles, the send and
/// response queues, and the transport state, and drives all of it from
/// [`BleTransport::task`].
pub struct BleTransport<B, C, K> {
	bus: B,
	ctrl: C,
	clock: K,
	state: TransportState,
	send_buf: SendBuffer,
	resp_buf: ResponseBuffer,
	product: &'static str,
	description: &'static str,
}

impl<B: SdepBus, C: SdepControl, K: Clock> BleTransport<B, C, K> {
	pub fn new(bus: B, ctrl: C, clock: K, product: &'static str, description: &'static str) -> Self {
		BleTransport {
			bus,
			ctrl,
			clock,
			state: TransportState::default(),
			send_buf: SendBuffer::new(),
			resp_buf: ResponseBuffer::new(),
			product,
			description,
		}
	}

	pub fn is_connected(&self) -> bool {
		self.state.is_connected
	}

	pub fn battery_millivolts(&self) -> u32 {
		self.state.vbat
	}

	/// Pulse the reset line and give the co-processor a second to boot
	/// (`ble_init` in the original).
	fn hardware_reset(&mut self) {
		self.state.initialized = false;
		self.state.configured = false;
		self.state.is_connected = false;

		self.ctrl.reset_high();
		self.ctrl.reset_low();
		self.clock.delay_us(10_000); // >= 1us required; 10ms matches the original's _delay_ms(10)
		self.ctrl.reset_high();
		self.clock.delay_us(1_000_000); // give it a second to initialize

		self.state.initialized = true;
	}

	fn at(&mut self, cmd: &str, resp: &mut heapless::String<128>, timeout_ms: u16) -> bool {
		at_command::at_command(
			&mut self.bus,
			&mut self.ctrl,
			&mut self.clock,
			&mut self.resp_buf,
			cmd,
			resp,
			timeout_ms,
		)
	}

	/// Bring the device up: hardware reset (if not already done) followed
	/// by the fixed configuration command sequence. Bails on the first
	/// failing command; the caller retries on the next tick.
	fn enable_keyboard(&mut self) -> bool {
		if !self.state.initialized {
			self.hardware_reset();
		}
		self.state.configured = false;

		let mut gap_dev_name: heapless::String<64> = heapless::String::new();
		let _ = write!(gap_dev_name, "AT+GAPDEVNAME={} {}", self.product, self.description);

		let commands: [&str; 6] = [
			"ATE=0",
			"AT+GAPINTERVALS=10,30,,",
			gap_dev_name.as_str(),
			"AT+BLEHIDEN=1",
			"AT+BLEPOWERLEVEL=-12",
			"ATZ",
		];

		let mut resp: heapless::String<128> = heapless::String::new();
		for cmd in commands {
			if !self.at(cmd, &mut resp, SDEP_TIMEOUT_MS) {
				crate::log::warn!("failed BLE command: {}: {}", cmd, resp.as_str());
				return false;
			}
		}

		self.state.configured = true;
		self.state.last_connection_update = self.clock.now_ms();
		true
	}

	fn set_connected(&mut self, connected: bool) {
		if connected != self.state.is_connected {
			if connected {
				crate::log::info!("BLE connected");
			} else {
				crate::log::info!("BLE disconnected");
			}
			self.state.is_connected = connected;
		}
	}

	/// Encode and transmit one queue item. `None` resp buffer means
	/// fire-and-forget (see spec.md §4.F).
	fn process_queue_item(&mut self, item: &QueueItem, timeout_ms: u16) -> bool {
		let mut cmd: heapless::String<48> = heapless::String::new();
		match item.kind {
			QueueItemKind::KeyReport { modifier, keys } => {
				let _ = write!(
					cmd,
					"AT+BLEKEYBOARDCODE={:02x}-00-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}",
					modifier, keys[0], keys[1], keys[2], keys[3], keys[4], keys[5]
				);
				at_command::at_command_fire_and_forget(
					&mut self.bus,
					&mut self.ctrl,
					&mut self.clock,
					&mut self.resp_buf,
					&cmd,
					timeout_ms,
				)
			}
			QueueItemKind::Consumer { keycode } => {
				let _ = write!(cmd, "AT+BLEHIDCONTROLKEY=0x{:04x}", keycode);
				at_command::at_command_fire_and_forget(
					&mut self.bus,
					&mut self.ctrl,
					&mut self.clock,
					&mut self.resp_buf,
					&cmd,
					timeout_ms,
				)
			}
			#[cfg(feature = "mouse")]
			QueueItemKind::MouseMove {
				x,
				y,
				scroll,
				pan,
				buttons,
			} => {
				let _ = write!(cmd, "AT+BLEHIDMOUSEMOVE={},{},{},{}", x, y, scroll, pan);
				if !at_command::at_command_fire_and_forget(
					&mut self.bus,
					&mut self.ctrl,
					&mut self.clock,
					&mut self.resp_buf,
					&cmd,
					timeout_ms,
				) {
					return false;
				}
				let mut btn_cmd: heapless::String<48> = heapless::String::new();
				let _ = write!(btn_cmd, "AT+BLEHIDMOUSEBUTTON=");
				if buttons & mouse_buttons::LEFT != 0 {
					let _ = btn_cmd.push_str("L");
				}
				if buttons & mouse_buttons::RIGHT != 0 {
					let _ = btn_cmd.push_str("R");
				}
				if buttons & mouse_buttons::MIDDLE != 0 {
					let _ = btn_cmd.push_str("M");
				}
				if buttons == 0 {
					let _ = btn_cmd.push_str("0");
				}
				at_command::at_command_fire_and_forget(
					&mut self.bus,
					&mut self.ctrl,
					&mut self.clock,
					&mut self.resp_buf,
					&btn_cmd,
					timeout_ms,
				)
			}
		}
	}

	/// Send one item from the send buffer, unless a response is already
	/// outstanding (spec.md §4.G step 3).
	fn send_buf_send_one(&mut self, timeout_ms: u16) {
		if !self.resp_buf.is_empty() {
			return;
		}
		let item = match self.send_buf.peek() {
			Some(item) => *item,
			None => return,
		};
		if self.process_queue_item(&item, timeout_ms) {
			self.send_buf.pop();
		} else {
			crate::log::warn!("failed to send, will retry");
			self.clock.delay_us(u32::from(SDEP_TIMEOUT_MS) * 1000);
			self.drain_one_response(true);
		}
	}

	fn drain_one_response(&mut self, greedy: bool) {
		at_command::drain_one(
			&mut self.bus,
			&mut self.ctrl,
			&mut self.clock,
			&mut self.resp_buf,
			greedy,
			SDEP_TIMEOUT_MS,
		);
	}

	/// The periodic hook, expected to run from the ~1 kHz scan loop
	/// (spec.md §4.G).
	pub fn task(&mut self) {
		if !self.state.configured && !self.enable_keyboard() {
			return;
		}

		self.drain_one_response(true);
		self.send_buf_send_one(SDEP_SHORT_TIMEOUT_MS);

		if self.resp_buf.is_empty()
			&& self.state.event_flags.contains(EventFlags::USING_EVENTS)
			&& self.ctrl.irq_is_high()
		{
			let mut resp: heapless::String<128> = heapless::String::new();
			if self.at("AT+EVENTSTATUS", &mut resp, SDEP_TIMEOUT_MS) {
				if let Ok(mask) = u32::from_str_radix(resp.trim(), 16) {
					if mask & 0x1 != 0 {
						self.set_connected(true);
					} else if mask & 0x2 != 0 {
						self.set_connected(false);
					}
				}
			}
		}

		if elapsed_ms(self.clock.now_ms(), self.state.last_connection_update)
			> CONNECTION_UPDATE_INTERVAL_MS
		{
			let mut should_poll = true;
			if !self.state.event_flags.contains(EventFlags::PROBED_EVENTS) {
				let mut resp: heapless::String<128> = heapless::String::new();
				if self.at("AT+EVENTENABLE=0x1", &mut resp, SDEP_TIMEOUT_MS) {
					let _ = self.at("AT+EVENTENABLE=0x2", &mut resp, SDEP_TIMEOUT_MS);
					self.state.event_flags.insert(EventFlags::USING_EVENTS);
				}
				self.state.event_flags.insert(EventFlags::PROBED_EVENTS);
				// leave should_poll == true: check at least once before
				// relying solely on events.
			} else {
				should_poll = false;
			}

			self.state.last_connection_update = self.clock.now_ms();
			if should_poll {
				let mut resp: heapless::String<128> = heapless::String::new();
				if self.at("AT+GAPGETCONN", &mut resp, SDEP_TIMEOUT_MS) {
					let connected = resp.trim().parse::<i32>().unwrap_or(0) != 0;
					self.set_connected(connected);
				}
			}
		}

		#[cfg(feature = "sample-battery")]
		{
			if elapsed_ms(self.clock.now_ms(), self.state.last_battery_update)
				> BATTERY_UPDATE_INTERVAL_MS
				&& self.resp_buf.is_empty()
			{
				self.state.last_battery_update = self.clock.now_ms();
				let mut resp: heapless::String<128> = heapless::String::new();
				if self.at("AT+HWVBAT", &mut resp, SDEP_TIMEOUT_MS) {
					self.state.vbat = resp.trim().parse::<u32>().unwrap_or(0);
				}
			}
		}
	}

	/// Enqueue a keyboard report, fragmenting more than 6 simultaneous
	/// keys across multiple reports exactly as the original does.
	/// Cooperatively drives the scheduler when the buffer is full so
	/// producers never drop events (spec.md §7 (e)).
	pub fn send_keys(&mut self, modifier: u8, keys: &[u8]) {
		let mut remaining = keys;
		loop {
			let mut chunk = [0u8; 6];
			let take = remaining.len().min(6);
			chunk[..take].copy_from_slice(&remaining[..take]);

			let item = QueueItem {
				added: self.clock.now_ms(),
				kind: QueueItemKind::KeyReport {
					modifier,
					keys: chunk,
				},
			};
			self.enqueue_with_backpressure(item);

			if remaining.len() <= 6 {
				break;
			}
			remaining = &remaining[6..];
		}
	}

	pub fn send_consumer_key(&mut self, keycode: u16) {
		let item = QueueItem {
			added: self.clock.now_ms(),
			kind: QueueItemKind::Consumer { keycode },
		};
		self.enqueue_with_backpressure(item);
	}

	#[cfg(feature = "mouse")]
	pub fn send_mouse_move(&mut self, x: i8, y: i8, scroll: i8, pan: i8, buttons: u8) {
		let item = QueueItem {
			added: self.clock.now_ms(),
			kind: QueueItemKind::MouseMove {
				x,
				y,
				scroll,
				pan,
				buttons,
			},
		};
		self.enqueue_with_backpressure(item);
	}

	fn enqueue_with_backpressure(&mut self, item: QueueItem) {
		let mut item = item;
		loop {
			match self.send_buf.enqueue(item) {
				Ok(()) => return,
				Err(rejected) => {
					item = rejected;
					self.send_buf_send_one(SDEP_TIMEOUT_MS);
				}
			}
		}
	}

	/// Toggle the co-processor's mode LED (and the companion "connected"
	/// LED).
	pub fn set_mode_leds(&mut self, on: bool) -> bool {
		if !self.state.configured {
			return false;
		}
		let mut resp: heapless::String<128> = heapless::String::new();
		let _ = self.at(
			if on { "AT+HWMODELED=1" } else { "AT+HWMODELED=0" },
			&mut resp,
			SDEP_TIMEOUT_MS,
		);
		let cmd = if on && self.state.is_connected {
			"AT+HWGPIO=19,1"
		} else {
			"AT+HWGPIO=19,0"
		};
		self.at(cmd, &mut resp, SDEP_TIMEOUT_MS)
	}

	/// Adjust the radio's transmit power level.
	pub fn set_power_level(&mut self, level: i8) -> bool {
		if !self.state.configured {
			return false;
		}
		let mut cmd: heapless::String<48> = heapless::String::new();
		let _ = write!(cmd, "AT+BLEPOWERLEVEL={}", level);
		let mut resp: heapless::String<128> = heapless::String::new();
		self.at(&cmd, &mut resp, SDEP_TIMEOUT_MS)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::VecDeque;

	struct FakeBus {
		rx: VecDeque<u8>,
		tx: Vec<u8>,
	}
	impl SdepBus for FakeBus {
		fn transfer_byte(&mut self, tx: u8) -> u8 {
			self.tx.push(tx);
			self.rx.pop_front().unwrap_or(0)
		}
	}
	struct FakeControl {
		irq_high: bool,
	}
	impl SdepControl for FakeControl {
		fn cs_low(&mut self) {}
		fn cs_high(&mut self) {}
		fn irq_is_high(&mut self) -> bool {
			self.irq_high
		}
		fn reset_low(&mut self) {}
		fn reset_high(&mut self) {}
	}
	struct FakeClock {
		now: u16,
	}
	impl Clock for FakeClock {
		fn now_ms(&mut self) -> u16 {
			self.now
		}
		fn delay_us(&mut self, us: u32) {
			self.now = self.now.wrapping_add((us / 1000).max(1) as u16);
		}
	}

	fn ok_response_bytes() -> VecDeque<u8> {
		let mut rx = VecDeque::new();
		rx.push_back(0x20); // type=Response
		rx.push_back(0);
		rx.push_back(0);
		rx.push_back(4); // len=4, more=0
		rx.extend(b"OK\r\n".iter().copied());
		rx
	}

	/// Every `at_command` consumes: the send-ready byte (0x20 would also
	/// work as "not 0xFE") followed by an `OK` response frame. Canned
	/// enough copies for the whole bring-up sequence (6 commands).
	fn scripted_bus_for_bringup() -> FakeBus {
		let mut rx = VecDeque::new();
		for _ in 0..6 {
			rx.push_back(0x20); // ready byte for send_pkt
			rx.extend(ok_response_bytes());
		}
		FakeBus { rx, tx: vec![] }
	}

	#[test]
	fn enable_keyboard_runs_commands_in_original_order() {
		let bus = scripted_bus_for_bringup();
		let ctrl = FakeControl { irq_high: true };
		let clock = FakeClock { now: 0 };
		let mut transport = BleTransport::new(bus, ctrl, clock, "Product", "Desc");
		assert!(transport.enable_keyboard());
		assert!(transport.state.configured);
	}

	#[test]
	fn p5_at_most_two_in_flight() {
		let mut resp_buf = ResponseBuffer::new();
		assert!(resp_buf.enqueue(1).is_ok());
		assert!(resp_buf.enqueue(2).is_ok());
		assert_eq!(resp_buf.enqueue(3), Err(3));
	}

	#[test]
	fn p4_send_ordering_is_fifo() {
		let mut send_buf = SendBuffer::new();
		for i in 0..5u16 {
			send_buf
				.enqueue(QueueItem {
					added: i,
					kind: QueueItemKind::Consumer { keycode: i },
				})
				.unwrap();
		}
		let mut seen = vec![];
		while let Some(item) = send_buf.pop() {
			if let QueueItemKind::Consumer { keycode } = item.kind {
				seen.push(keycode);
			}
		}
		assert_eq!(seen, vec![0, 1, 2, 3, 4]);
	}
}
