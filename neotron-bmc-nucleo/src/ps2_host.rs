//! Bit-level PS/2 framing plus the `bmc_core::ps2::Ps2Host` adapter that
//! feeds decoded bytes to the scan code decoder.
//!
//! The clock-edge bit collection stays in the high-priority EXTI interrupt
//! (it can't afford to miss an edge); the assembled byte is handed off
//! through a lock-free queue to whichever task drives
//! `bmc_core::ps2::Ps2Decoder::scan`, exactly the producer/consumer split
//! the donor firmware already used for its own 11-bit word collector.

use bmc_core::ps2::{Ps2Host, Ps2Recv};
use heapless::spsc::Consumer;

/// Collects the 11 bits of one PS/2 frame (start, 8 data LSB-first,
/// parity, stop) and validates them once complete.
#[derive(Debug)]
pub struct Ps2BitCollector {
	bit_mask: u16,
	collector: u16,
}

impl Ps2BitCollector {
	pub const fn new() -> Self {
		Ps2BitCollector {
			bit_mask: 1,
			collector: 0,
		}
	}

	fn reset(&mut self) {
		self.bit_mask = 1;
		self.collector = 0;
	}

	/// Feed one clock-edge-sampled data bit. Returns `Some(word)` once an
	/// 11-bit frame is complete.
	pub fn add_bit(&mut self, bit: bool) -> Option<u16> {
		if bit {
			self.collector |= self.bit_mask;
		}
		if self.bit_mask == 0b100_0000_0000 {
			let result = self.collector;
			self.reset();
			Some(result)
		} else {
			self.bit_mask <<= 1;
			None
		}
	}

	/// Validate a complete 11-bit word's start/stop/parity bits and
	/// extract the 8 data bits.
	pub fn check_word(word: u16) -> Option<u8> {
		let start_bit = (word & 0b000_0000_0001) != 0;
		let parity_bit = (word & 0b010_0000_0000) != 0;
		let stop_bit = (word & 0b100_0000_0000) != 0;
		let data = ((word >> 1) & 0xFF) as u8;

		if start_bit || !stop_bit {
			return None;
		}

		let need_parity = (data.count_ones() % 2) == 0;
		if need_parity != parity_bit {
			return None;
		}

		Some(data)
	}
}

impl Default for Ps2BitCollector {
	fn default() -> Self {
		Self::new()
	}
}

/// Adapts the lock-free byte queue filled by the EXTI task into the
/// `Ps2Host` interface the scan code decoder pulls from.
pub struct QueuePs2Host {
	consumer: Consumer<'static, Option<u8>, 8>,
}

impl QueuePs2Host {
	pub fn new(consumer: Consumer<'static, Option<u8>, 8>) -> Self {
		QueuePs2Host { consumer }
	}

	/// True once every byte framed so far has been drained. `DecodeEvent::None`
	/// is returned both for an empty queue and for an ordinary, uneventful
	/// make/break, so callers that want to drain everything queued since the
	/// last tick must check this instead of looping on the decode event.
	pub fn is_empty(&self) -> bool {
		!self.consumer.ready()
	}
}

impl Ps2Host for QueuePs2Host {
	fn recv(&mut self) -> Ps2Recv {
		match self.consumer.dequeue() {
			Some(Some(byte)) => Ps2Recv::Byte(byte),
			Some(None) => Ps2Recv::Error,
			None => Ps2Recv::NoData,
		}
	}
}
