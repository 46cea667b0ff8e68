//! SDEP (Simple Data Exchange Protocol) framer (component E).
//!
//! Builds and parses the fixed 20-byte packets the Adafruit Bluefruit
//! co-processor speaks over SPI, honouring its "not ready yet, back off
//! and retry" signal. Ported from `sdep_send_pkt`/`sdep_recv_pkt` in the
//! donor firmware's Adafruit BLE transport.

use crate::log::warn;

/// Max payload bytes in one SDEP packet.
pub const SDEP_MAX_PAYLOAD: usize = 16;
/// Total wire size of one SDEP packet.
pub const SDEP_PACKET_LEN: usize = 20;

/// How long `send_pkt`/`recv_pkt` back off after a not-ready/overflow
/// response before retrying, in microseconds.
pub const SDEP_BACKOFF_US: u32 = 25;

/// SDEP packet type byte.
#[derive(Debug, Clone, Copy)]
pub enum SdepType {
	Command,
	Response,
	Alert,
	Error,
	SlaveNotReady,
	SlaveOverflow,
	/// Anything else the wire produced; treated like "not a response".
	Unknown(u8),
}

impl SdepType {
	fn from_byte(b: u8) -> SdepType {
		match b {
			0x10 => SdepType::Command,
			0x20 => SdepType::Response,
			0x40 => SdepType::Alert,
			0x80 => SdepType::Error,
			0xFE => SdepType::SlaveNotReady,
			0xFF => SdepType::SlaveOverflow,
			other => SdepType::Unknown(other),
		}
	}

	fn to_byte(self) -> u8 {
		match self {
			SdepType::Command => 0x10,
			SdepType::Response => 0x20,
			SdepType::Alert => 0x40,
			SdepType::Error => 0x80,
			SdepType::SlaveNotReady => 0xFE,
			SdepType::SlaveOverflow => 0xFF,
			SdepType::Unknown(b) => b,
		}
	}
}

/// BLE command IDs carried in a Command-type SDEP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BleCommand {
	Initialize = 0xBEEF,
	AtWrapper = 0x0A00,
}

/// One 20-byte SDEP packet.
#[derive(Debug, Clone, Copy)]
pub struct SdepMessage {
	pub ty: SdepType,
	pub cmd: u16,
	pub len: u8,
	pub more: bool,
	pub payload: [u8; SDEP_MAX_PAYLOAD],
}

impl SdepMessage {
	fn empty() -> Self {
		SdepMessage {
			ty: SdepType::Unknown(0),
			cmd: 0,
			len: 0,
			more: false,
			payload: [0u8; SDEP_MAX_PAYLOAD],
		}
	}

	/// Build a `Command`-typed packet carrying up to 16 bytes of `chunk`.
	pub fn command(command: BleCommand, chunk: &[u8], more: bool) -> Self {
		debug_assert!(chunk.len() <= SDEP_MAX_PAYLOAD);
		let mut payload = [0u8; SDEP_MAX_PAYLOAD];
		payload[..chunk.len()].copy_from_slice(chunk);
		let command = command as u16;
		SdepMessage {
			ty: SdepType::Command,
			cmd: command,
			len: chunk.len() as u8,
			more: more && chunk.len() == SDEP_MAX_PAYLOAD,
			payload,
		}
	}
}

/// Full-duplex byte transfer over the SPI bus used to talk to the BLE
/// co-processor (mode 0, MSB-first, 4 MHz per spec.md §6).
pub trait SdepBus {
	fn transfer_byte(&mut self, tx: u8) -> u8;
}

/// The manually-driven control lines around an SDEP transaction, plus the
/// co-processor's hardware reset line used once at bring-up.
pub trait SdepControl {
	fn cs_low(&mut self);
	fn cs_high(&mut self);
	fn irq_is_high(&mut self) -> bool;
	fn reset_low(&mut self);
	fn reset_high(&mut self);
}

/// Millisecond clock and microsecond busy-wait, matching the original's
/// `timer_read()`/`_delay_us()`. Timestamps are `u16` and wrap; all elapsed
/// computations use wrapping subtraction so rollover is harmless.
pub trait Clock {
	fn now_ms(&mut self) -> u16;
	fn delay_us(&mut self, us: u32);
}

/// Elapsed milliseconds since `start`, correct across `u16` wraparound.
pub fn elapsed_ms(now: u16, start: u16) -> u16 {
	now.wrapping_sub(start)
}

/// Send one SDEP packet, retrying on `SlaveNotReady` with a back-off until
/// `timeout_ms` elapses. Returns `false` on timeout.
pub fn send_pkt<B: SdepBus, C: SdepControl, K: Clock>(
	bus: &mut B,
	ctrl: &mut C,
	clock: &mut K,
	msg: &SdepMessage,
	timeout_ms: u16,
) -> bool {
	ctrl.cs_low();
	let start = clock.now_ms();
	let mut ready;
	loop {
		ready = bus.transfer_byte(msg.ty.to_byte()) != SdepType::SlaveNotReady.to_byte();
		if ready {
			break;
		}
		ctrl.cs_high();
		clock.delay_us(SDEP_BACKOFF_US);
		ctrl.cs_low();
		if elapsed_ms(clock.now_ms(), start) >= timeout_ms {
			break;
		}
	}

	if ready {
		bus.transfer_byte((msg.cmd & 0xFF) as u8);
		bus.transfer_byte((msg.cmd >> 8) as u8);
		let len_more = msg.len | if msg.more { 0x80 } else { 0 };
		bus.transfer_byte(len_more);
		for b in &msg.payload[..msg.len as usize] {
			bus.transfer_byte(*b);
		}
	}

	ctrl.cs_high();
	ready
}

/// Receive one SDEP packet. Busy-waits for the IRQ line, then reads the
/// header and up to 16 bytes of payload, retrying on not-ready/overflow.
/// Returns `false` on timeout.
pub fn recv_pkt<B: SdepBus, C: SdepControl, K: Clock>(
	bus: &mut B,
	ctrl: &mut C,
	clock: &mut K,
	timeout_ms: u16,
) -> Option<SdepMessage> {
	let start = clock.now_ms();
	loop {
		if ctrl.irq_is_high() {
			break;
		}
		clock.delay_us(1);
		if elapsed_ms(clock.now_ms(), start) >= timeout_ms {
			return None;
		}
	}

	ctrl.cs_low();
	let result = loop {
		let ty_byte = bus.transfer_byte(0x00);
		let ty = SdepType::from_byte(ty_byte);
		if ty == SdepType::SlaveNotReady || ty == SdepType::SlaveOverflow {
			ctrl.cs_high();
			clock.delay_us(SDEP_BACKOFF_US);
			ctrl.cs_low();
			if elapsed_ms(clock.now_ms(), start) >= timeout_ms {
				break None;
			}
			continue;
		}

		let cmd_low = bus.transfer_byte(0x00);
		let cmd_high = bus.transfer_byte(0x00);
		let len_more = bus.transfer_byte(0x00);
		let len = (len_more & 0x7F).min(SDEP_MAX_PAYLOAD as u8);
		let more = len_more & 0x80 != 0;
		let mut payload = [0u8; SDEP_MAX_PAYLOAD];
		for slot in payload.iter_mut().take(len as usize) {
			*slot = bus.transfer_byte(0x00);
		}

		break Some(SdepMessage {
			ty,
			cmd: (cmd_high as u16) << 8 | cmd_low as u16,
			len,
			more,
			payload,
		});
	};

	ctrl.cs_high();
	if result.is_none() {
		warn!("sdep recv_pkt timed out");
	}
	result
}

impl PartialEq for SdepType {
	fn eq(&self, other: &Self) -> bool {
		self.to_byte() == other.to_byte()
	}
}
impl Eq for SdepType {}

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
		fn delay_us(&mut self, _us: u32) {
			// 1000 us per call keeps timeouts reachable quickly in tests.
			self.now = self.now.wrapping_add(1);
		}
	}

	#[test]
	fn send_pkt_happy_path_streams_header_and_payload() {
		let mut bus = FakeBus {
			rx: VecDeque::from(vec![0x20]), // immediately ready
			tx: vec![],
		};
		let mut ctrl = FakeControl { irq_high: false };
		let mut clock = FakeClock { now: 0 };
		let msg = SdepMessage::command(BleCommand::AtWrapper, b"AT", false);
		assert!(send_pkt(&mut bus, &mut ctrl, &mut clock, &msg, 150));
		assert_eq!(bus.tx[0], SdepType::Command.to_byte());
		assert_eq!(bus.tx[3], 2); // len, more=0
		assert_eq!(&bus.tx[4..6], b"AT");
	}

	#[test]
	fn send_pkt_retries_on_not_ready_then_times_out() {
		let mut bus = FakeBus {
			rx: VecDeque::from(vec![0xFE; 1000]),
			tx: vec![],
		};
		let mut ctrl = FakeControl { irq_high: false };
		let mut clock = FakeClock { now: 0 };
		let msg = SdepMessage::command(BleCommand::AtWrapper, b"x", false);
		assert!(!send_pkt(&mut bus, &mut ctrl, &mut clock, &msg, 5));
	}

	#[test]
	fn recv_pkt_times_out_if_irq_never_rises() {
		let mut bus = FakeBus {
			rx: VecDeque::new(),
			tx: vec![],
		};
		let mut ctrl = FakeControl { irq_high: false };
		let mut clock = FakeClock { now: 0 };
		assert!(recv_pkt(&mut bus, &mut ctrl, &mut clock, 5).is_none());
	}

	#[test]
	fn recv_pkt_parses_header_and_capped_payload() {
		let mut rx = VecDeque::new();
		rx.push_back(0x20); // type = Response
		rx.push_back(0x34); // cmd_low
		rx.push_back(0x12); // cmd_high
		rx.push_back(16); // len=16, more=0
		rx.extend(b"abcdefghijklmnop".iter().copied());
		let mut bus = FakeBus { rx, tx: vec![] };
		let mut ctrl = FakeControl { irq_high: true };
		let mut clock = FakeClock { now: 0 };
		let msg = recv_pkt(&mut bus, &mut ctrl, &mut clock, 150).unwrap();
		assert_eq!(msg.ty, SdepType::Response);
		assert_eq!(msg.cmd, 0x1234);
		assert_eq!(msg.len, 16);
		assert!(!msg.more);
		assert_eq!(&msg.payload, b"abcdefghijklmnop");
	}
}
