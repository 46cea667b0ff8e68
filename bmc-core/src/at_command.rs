//! AT command fragmentation/reassembly over SDEP (component F).
//!
//! Ported from `at_command`/`read_response` in the donor firmware: a text
//! AT command is chopped into 16-byte SDEP packets and, when a response is
//! wanted, its payloads are reassembled until the trailing `OK`/`ERROR`
//! line is found.

use crate::log::{info, warn};
use crate::queue::ResponseBuffer;
use crate::sdep::{self, BleCommand, Clock, SdepBus, SdepControl, SdepType, SDEP_MAX_PAYLOAD};

/// Default request/response timeout (`SdepTimeout` in the original).
pub const SDEP_TIMEOUT_MS: u16 = 150;
/// Short timeout used while draining the send queue opportunistically.
pub const SDEP_SHORT_TIMEOUT_MS: u16 = 10;

/// Send `cmd`, fire-and-forget: fragments it across SDEP packets and
/// returns without waiting for a response. Used by the queue scheduler for
/// `KeyReport`/`Consumer`/`MouseMove` items, which only enqueue a timestamp
/// into `resp_buf` to track the outstanding reply.
pub fn at_command_fire_and_forget<B: SdepBus, C: SdepControl, K: Clock>(
	bus: &mut B,
	ctrl: &mut C,
	clock: &mut K,
	resp_buf: &mut ResponseBuffer,
	cmd: &str,
	timeout_ms: u16,
) -> bool {
	if !send_fragmented(bus, ctrl, clock, cmd, timeout_ms) {
		return false;
	}
	let now = clock.now_ms();
	if resp_buf.enqueue(now).is_err() {
		// Caller is responsible for draining before calling again; this
		// mirrors the original's busy-loop on `resp_buf.enqueue`, but
		// bmc-core never blocks internally (see spec.md §5).
		warn!("resp_buf full, dropping wait slot");
	}
	true
}

/// Send `cmd` and wait for the reassembled response, writing it into
/// `resp`. Returns `true` iff the final line of the response is exactly
/// `OK`. Drains `resp_buf` first so the reassembly isn't confused by a
/// reply to an earlier fire-and-forget command.
pub fn at_command<B: SdepBus, C: SdepControl, K: Clock>(
	bus: &mut B,
	ctrl: &mut C,
	clock: &mut K,
	resp_buf: &mut ResponseBuffer,
	cmd: &str,
	resp: &mut heapless::String<128>,
	timeout_ms: u16,
) -> bool {
	info!("ble send: {}", cmd);

	// Drain pending in-flight responses so we have a clean slate.
	while !resp_buf.is_empty() {
		drain_one(bus, ctrl, clock, resp_buf, true, SDEP_TIMEOUT_MS);
	}
	resp.clear();

	if !send_fragmented(bus, ctrl, clock, cmd, timeout_ms) {
		return false;
	}

	read_response(bus, ctrl, clock, resp)
}

fn send_fragmented<B: SdepBus, C: SdepControl, K: Clock>(
	bus: &mut B,
	ctrl: &mut C,
	clock: &mut K,
	cmd: &str,
	timeout_ms: u16,
) -> bool {
	let bytes = cmd.as_bytes();
	let mut offset = 0usize;
	while bytes.len() - offset > SDEP_MAX_PAYLOAD {
		let chunk = &bytes[offset..offset + SDEP_MAX_PAYLOAD];
		let msg = sdep::SdepMessage::command(BleCommand::AtWrapper, chunk, true);
		if !sdep::send_pkt(bus, ctrl, clock, &msg, timeout_ms) {
			return false;
		}
		offset += SDEP_MAX_PAYLOAD;
	}
	let msg = sdep::SdepMessage::command(BleCommand::AtWrapper, &bytes[offset..], false);
	sdep::send_pkt(bus, ctrl, clock, &msg, timeout_ms)
}

/// Reassemble packets of type `Response` until one with `more == false`
/// arrives, capping the write at `resp`'s capacity. A non-`Response`
/// packet where a response was expected is a hard failure (error taxonomy
/// (d) in spec.md §7).
fn read_response<B: SdepBus, C: SdepControl, K: Clock>(
	bus: &mut B,
	ctrl: &mut C,
	clock: &mut K,
	resp: &mut heapless::String<128>,
) -> bool {
	loop {
		let msg = match sdep::recv_pkt(bus, ctrl, clock, 2 * SDEP_TIMEOUT_MS) {
			Some(m) => m,
			None => {
				warn!("at_command: recv_pkt timed out waiting for response");
				return false;
			}
		};

		if msg.ty != SdepType::Response {
			resp.clear();
			return false;
		}

		let remaining = resp.capacity() - resp.len();
		let take = (msg.len as usize).min(remaining);
		if take > 0 {
			if let Ok(text) = core::str::from_utf8(&msg.payload[..take]) {
				let _ = resp.push_str(text);
			}
		}

		if !msg.more {
			break;
		}
	}

	strip_trailing_newlines(resp);
	let last_line = last_line(resp);
	let success = last_line == "OK";
	if !success {
		warn!("at_command result: {}", resp.as_str());
	}
	success
}

fn strip_trailing_newlines(s: &mut heapless::String<128>) {
	while matches!(s.as_bytes().last(), Some(b'\r') | Some(b'\n')) {
		s.pop();
	}
}

fn last_line(s: &heapless::String<128>) -> &str {
	let text = s.as_str();
	match text.rfind('\n') {
		Some(idx) => &text[idx + 1..],
		None => text,
	}
}

/// Drain one response packet from `resp_buf` (see spec.md §4.G step 2).
/// `greedy` keeps reading while the IRQ stays asserted and entries remain.
pub fn drain_one<B: SdepBus, C: SdepControl, K: Clock>(
	bus: &mut B,
	ctrl: &mut C,
	clock: &mut K,
	resp_buf: &mut ResponseBuffer,
	greedy: bool,
	timeout_ms: u16,
) {
	let last_send = match resp_buf.peek() {
		Some(t) => *t,
		None => return,
	};

	if ctrl.irq_is_high() {
		loop {
			match sdep::recv_pkt(bus, ctrl, clock, timeout_ms) {
				Some(msg) if !msg.more => {
					resp_buf.pop();
				}
				Some(_) => {
					// More fragments of this response still coming; leave
					// the slot occupied and stop for this tick.
				}
				None => {}
			}
			if !greedy {
				break;
			}
			match resp_buf.peek() {
				Some(_) if ctrl.irq_is_high() => continue,
				_ => break,
			}
		}
	} else if sdep::elapsed_ms(clock.now_ms(), last_send) > 2 * SDEP_TIMEOUT_MS {
		warn!("waiting_for_result: timeout");
		resp_buf.pop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::queue::ResponseBuffer;
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
			self.now = self.now.wrapping_add(1);
		}
	}

	fn push_response_packet(rx: &mut VecDeque<u8>, payload: &[u8], more: bool) {
		rx.push_back(0x20); // Response
		rx.push_back(0x00);
		rx.push_back(0x0A);
		rx.push_back(payload.len() as u8 | if more { 0x80 } else { 0 });
		rx.extend(payload.iter().copied());
	}

	/// P6: a response split across two packets, "foo\r\nOK\r\n" reassembles
	/// to body "foo" with success=true.
	#[test]
	fn p6_at_round_trip_reassembles_split_response() {
		let mut rx = VecDeque::new();
		push_response_packet(&mut rx, b"fo", true);
		push_response_packet(&mut rx, b"o\r\nOK\r\n", false);
		let mut bus = FakeBus { rx, tx: vec![] };
		let mut ctrl = FakeControl { irq_high: false };
		let mut clock = FakeClock { now: 0 };
		let mut resp = heapless::String::<128>::new();
		assert!(read_response(&mut bus, &mut ctrl, &mut clock, &mut resp));
		assert_eq!(resp.as_str(), "foo");
	}

	#[test]
	fn scenario_6_sixteen_byte_chunk_then_tail() {
		let mut rx = VecDeque::new();
		push_response_packet(&mut rx, b"abcdefghijklmnop", true);
		push_response_packet(&mut rx, b"\r\nOK\r\n", false);
		let mut bus = FakeBus { rx, tx: vec![] };
		let mut ctrl = FakeControl { irq_high: false };
		let mut clock = FakeClock { now: 0 };
		let mut resp = heapless::String::<128>::new();
		assert!(read_response(&mut bus, &mut ctrl, &mut clock, &mut resp));
		assert_eq!(resp.as_str(), "abcdefghijklmnop");
	}

	#[test]
	fn non_response_packet_is_hard_failure() {
		let mut rx = VecDeque::new();
		rx.push_back(0x80); // Error type
		rx.push_back(0);
		rx.push_back(0);
		rx.push_back(0);
		let mut bus = FakeBus { rx, tx: vec![] };
		let mut ctrl = FakeControl { irq_high: false };
		let mut clock = FakeClock { now: 0 };
		let mut resp = heapless::String::<128>::new();
		assert!(!read_response(&mut bus, &mut ctrl, &mut clock, &mut resp));
	}

	#[test]
	fn trailing_error_line_is_failure() {
		let mut rx = VecDeque::new();
		push_response_packet(&mut rx, b"ERROR\r\n", false);
		let mut bus = FakeBus { rx, tx: vec![] };
		let mut ctrl = FakeControl { irq_high: false };
		let mut clock = FakeClock { now: 0 };
		let mut resp = heapless::String::<128>::new();
		assert!(!read_response(&mut bus, &mut ctrl, &mut clock, &mut resp));
	}

	#[test]
	fn fire_and_forget_enqueues_response_slot() {
		let mut bus = FakeBus {
			rx: VecDeque::from(vec![0x10]),
			tx: vec![],
		};
		let mut ctrl = FakeControl { irq_high: false };
		let mut clock = FakeClock { now: 5 };
		let mut resp_buf = ResponseBuffer::new();
		assert!(at_command_fire_and_forget(
			&mut bus, &mut ctrl, &mut clock, &mut resp_buf, "AT+BLEHIDEN=1", 150
		));
		assert_eq!(resp_buf.len(), 1);
	}
}
