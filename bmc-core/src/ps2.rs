//! PS/2 Scan Code Set 2 decoder (component D).
//!
//! Ported from the scan-code state machine in the `ps2_usb` converter
//! keyboard: a byte at a time walks a small state machine, turning the
//! variable-length, prefix/postfix-escaped stream into `make`/`break`
//! calls on a [`Matrix`]. See the module-level grammar table in spec.md
//! §4.D for the full transition table; this is its literal transcription.

use crate::log::{info, warn};
use crate::matrix::{Matrix, KC_F7, PAUSE, PRINT_SCREEN};

/// What the byte source handed back this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ps2Recv {
	/// A byte arrived.
	Byte(u8),
	/// Nothing to do this tick.
	NoData,
	/// A parity/framing error on the wire; discard and leave state as-is.
	Error,
}

/// Implemented by whatever actually drives the PS/2 clock/data lines.
pub trait Ps2Host {
	/// Poll for the next byte. Must never block.
	fn recv(&mut self) -> Ps2Recv;
}

/// Side effects the decoder can't perform itself because they belong to a
/// `host`/`keymap` consumer that's out of scope for this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeEvent {
	/// Nothing worth reporting; a byte was consumed (or there was none).
	None,
	/// `0x00` overrun: matrix and host report were cleared.
	Overrun,
	/// Stream desync: an unexpected byte arrived where a position was
	/// expected. Matrix and host report were cleared, decoder reset.
	Desync,
	/// Self-test completion (`AA`/`FC` in `INIT`): reload LED state from
	/// the host.
	ReloadLeds,
	/// `F1`/`F2` (Hangeul/Hanja) seen. Unsupported per spec; never
	/// disambiguated, just logged.
	KoreanKeyIgnored,
}

/// The decoder's internal state (spec.md §3, "Decoder State").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	Init,
	F0,
	E0,
	E0F0,
	E1,
	E1_14,
	E1_14_77,
	E1_14_77_E1,
	E1_14_77_E1_F0,
	E1_14_77_E1_F0_14,
	E1_14_77_E1_F0_14_F0,
	E0_7E,
	E0_7E_E0,
	E0_7E_E0_F0,
}

/// The Scan Code Set 2 state machine.
#[derive(Debug)]
pub struct Ps2Decoder {
	state: State,
}

impl Default for Ps2Decoder {
	fn default() -> Self {
		Self::new()
	}
}

impl Ps2Decoder {
	/// A fresh decoder, state `INIT`.
	pub const fn new() -> Self {
		Ps2Decoder { state: State::Init }
	}

	/// Perform exactly one of: consume one byte and possibly transition, or
	/// do nothing. Synthesises the Pause pseudo-break first.
	pub fn scan(&mut self, host: &mut impl Ps2Host, matrix: &mut Matrix) -> DecodeEvent {
		// Pause never sends its own break code; give it a one-tick duration.
		if matrix.is_on_position(PAUSE) {
			matrix.unmake(PAUSE);
		}

		match host.recv() {
			Ps2Recv::NoData => DecodeEvent::None,
			Ps2Recv::Error => DecodeEvent::None,
			Ps2Recv::Byte(code) => self.consume(code, matrix),
		}
	}

	fn consume(&mut self, code: u8, matrix: &mut Matrix) -> DecodeEvent {
		match self.state {
			State::Init => self.consume_init(code, matrix),
			State::F0 => self.consume_f0(code, matrix),
			State::E0 => self.consume_e0(code, matrix),
			State::E0F0 => self.consume_e0_f0(code, matrix),
			State::E1 => self.step_literal(code, 0x14, State::E1_14),
			State::E1_14 => self.step_literal(code, 0x77, State::E1_14_77),
			State::E1_14_77 => self.step_literal(code, 0xE1, State::E1_14_77_E1),
			State::E1_14_77_E1 => self.step_literal(code, 0xF0, State::E1_14_77_E1_F0),
			State::E1_14_77_E1_F0 => self.step_literal(code, 0x14, State::E1_14_77_E1_F0_14),
			State::E1_14_77_E1_F0_14 => {
				self.step_literal(code, 0xF0, State::E1_14_77_E1_F0_14_F0)
			}
			State::E1_14_77_E1_F0_14_F0 => {
				self.state = State::Init;
				if code == 0x77 {
					matrix.make(PAUSE);
				}
				DecodeEvent::None
			}
			State::E0_7E => self.step_literal(code, 0xE0, State::E0_7E_E0),
			State::E0_7E_E0 => self.step_literal(code, 0xF0, State::E0_7E_E0_F0),
			State::E0_7E_E0_F0 => {
				self.state = State::Init;
				if code == 0x7E {
					matrix.make(PAUSE);
				}
				DecodeEvent::None
			}
		}
	}

	/// Walk one literal byte of the Pause/Ctrl-Pause chains: match `next`,
	/// stepping to `ok_state`, or silently discard back to `INIT`.
	fn step_literal(&mut self, code: u8, expect: u8, ok_state: State) -> DecodeEvent {
		self.state = if code == expect { ok_state } else { State::Init };
		DecodeEvent::None
	}

	fn consume_init(&mut self, code: u8, matrix: &mut Matrix) -> DecodeEvent {
		match code {
			0xE0 => {
				self.state = State::E0;
				DecodeEvent::None
			}
			0xF0 => {
				self.state = State::F0;
				DecodeEvent::None
			}
			0xE1 => {
				self.state = State::E1;
				DecodeEvent::None
			}
			KC_F7 => {
				matrix.make(KC_F7);
				DecodeEvent::None
			}
			0x84 => {
				matrix.make(PRINT_SCREEN);
				DecodeEvent::None
			}
			0x00 => {
				matrix.clear();
				warn!("ps2 overrun");
				DecodeEvent::Overrun
			}
			0xAA | 0xFC => DecodeEvent::ReloadLeds,
			0xF1 | 0xF2 => {
				// Hangeul/Hanja: collide with Delete/Down (0x80|0x71,
				// 0x80|0x72) in the position scheme. Never disambiguated;
				// just wipe, same as any other out-of-range byte.
				matrix.clear();
				info!("korean key ignored: {:02x}", code);
				DecodeEvent::KoreanKeyIgnored
			}
			code if code < 0x80 => {
				matrix.make(code);
				DecodeEvent::None
			}
			code => {
				matrix.clear();
				warn!("unexpected scan code at INIT: {:02x}", code);
				DecodeEvent::Desync
			}
		}
	}

	fn consume_f0(&mut self, code: u8, matrix: &mut Matrix) -> DecodeEvent {
		self.state = State::Init;
		match code {
			KC_F7 => {
				matrix.unmake(KC_F7);
				DecodeEvent::None
			}
			0x84 => {
				matrix.unmake(PRINT_SCREEN);
				DecodeEvent::None
			}
			0xF0 => {
				// Duplicate F0: desync, but stay put recovering in F0 like
				// the original (it re-enters F0 rather than INIT).
				self.state = State::F0;
				matrix.clear();
				warn!("unexpected scan code at F0: F0 (clear and continue)");
				DecodeEvent::Desync
			}
			code if code < 0x80 => {
				matrix.unmake(code);
				DecodeEvent::None
			}
			code => {
				matrix.clear();
				warn!("unexpected scan code at F0: {:02x}", code);
				DecodeEvent::Desync
			}
		}
	}

	fn consume_e0(&mut self, code: u8, matrix: &mut Matrix) -> DecodeEvent {
		match code {
			// Shift-synthesised escapes bracketing E0-prefixed make/break
			// events. Dropped unconditionally, matrix untouched.
			0x12 | 0x59 => {
				self.state = State::Init;
				DecodeEvent::None
			}
			0x7E => {
				self.state = State::E0_7E;
				DecodeEvent::None
			}
			0xF0 => {
				self.state = State::E0F0;
				DecodeEvent::None
			}
			code if code < 0x80 => {
				self.state = State::Init;
				matrix.make(0x80 | code);
				DecodeEvent::None
			}
			code => {
				self.state = State::Init;
				matrix.clear();
				warn!("unexpected scan code at E0: {:02x}", code);
				DecodeEvent::Desync
			}
		}
	}

	fn consume_e0_f0(&mut self, code: u8, matrix: &mut Matrix) -> DecodeEvent {
		self.state = State::Init;
		match code {
			0x12 | 0x59 => DecodeEvent::None,
			code if code < 0x80 => {
				matrix.unmake(0x80 | code);
				DecodeEvent::None
			}
			code => {
				matrix.clear();
				warn!("unexpected scan code at E0_F0: {:02x}", code);
				DecodeEvent::Desync
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Feeds a fixed sequence of bytes, one per `scan()` call.
	struct ScriptedHost<'a> {
		bytes: core::slice::Iter<'a, u8>,
	}

	impl<'a> ScriptedHost<'a> {
		fn new(bytes: &'a [u8]) -> Self {
			ScriptedHost {
				bytes: bytes.iter(),
			}
		}
	}

	impl<'a> Ps2Host for ScriptedHost<'a> {
		fn recv(&mut self) -> Ps2Recv {
			match self.bytes.next() {
				Some(&b) => Ps2Recv::Byte(b),
				None => Ps2Recv::NoData,
			}
		}
	}

	fn run(bytes: &[u8]) -> Matrix {
		let mut decoder = Ps2Decoder::new();
		let mut matrix = Matrix::new();
		let mut host = ScriptedHost::new(bytes);
		for _ in 0..bytes.len() {
			decoder.scan(&mut host, &mut matrix);
		}
		matrix
	}

	#[test]
	fn scenario_1_make_then_break() {
		// 1C F0 1C -> pressed then released; final matrix all zero.
		let matrix = run(&[0x1C, 0xF0, 0x1C]);
		assert_eq!(matrix.key_count(), 0);
	}

	#[test]
	fn scenario_1_mid_sequence_is_pressed() {
		let mut decoder = Ps2Decoder::new();
		let mut matrix = Matrix::new();
		let mut host = ScriptedHost::new(&[0x1C]);
		decoder.scan(&mut host, &mut matrix);
		assert!(matrix.is_on_position(0x1C));
	}

	#[test]
	fn scenario_2_shift_synthesised_brackets_absorbed() {
		// E0 F0 12 E0 75 E0 F0 75 E0 F0 12
		// -> one press+release at 0x80|0x75 = 0xF5; brackets ignored.
		let matrix = run(&[
			0xE0, 0xF0, 0x12, 0xE0, 0x75, 0xE0, 0xF0, 0x75, 0xE0, 0xF0, 0x12,
		]);
		assert_eq!(matrix.key_count(), 0);
	}

	#[test]
	fn p1_brackets_dont_change_result_vs_unbracketed() {
		let bracketed = run(&[
			0xE0, 0xF0, 0x12, 0xE0, 0x75, 0xE0, 0xF0, 0x75, 0xE0, 0xF0, 0x12,
		]);
		let unbracketed = run(&[0xE0, 0x75, 0xE0, 0xF0, 0x75]);
		assert_eq!(bracketed.key_count(), unbracketed.key_count());
		assert_eq!(bracketed.get_row(0x1E), unbracketed.get_row(0x1E));
	}

	#[test]
	fn scenario_3_pause_sequence_then_synth_break() {
		let mut decoder = Ps2Decoder::new();
		let mut matrix = Matrix::new();
		let mut host = ScriptedHost::new(&[0xE1, 0x14, 0x77, 0xE1, 0xF0, 0x14, 0xF0, 0x77]);
		for _ in 0..8 {
			decoder.scan(&mut host, &mut matrix);
		}
		assert!(matrix.is_on_position(PAUSE));

		// One further scan() with no input synthesises the break.
		let mut empty_host = ScriptedHost::new(&[]);
		decoder.scan(&mut empty_host, &mut matrix);
		assert!(!matrix.is_on_position(PAUSE));
		assert_eq!(matrix.key_count(), 0);
	}

	#[test]
	fn ctrl_pause_sequence_also_makes_pause() {
		let mut decoder = Ps2Decoder::new();
		let mut matrix = Matrix::new();
		let mut host = ScriptedHost::new(&[0xE0, 0x7E, 0xE0, 0xF0, 0x7E]);
		for _ in 0..5 {
			decoder.scan(&mut host, &mut matrix);
		}
		assert!(matrix.is_on_position(PAUSE));
	}

	#[test]
	fn p2_recovery_from_desync_in_init() {
		let mut decoder = Ps2Decoder::new();
		let mut matrix = Matrix::new();
		matrix.make(0x01);
		matrix.make(0x02);
		let mut host = ScriptedHost::new(&[0x90]); // >= 0x80 while expecting a position
		let event = decoder.scan(&mut host, &mut matrix);
		assert_eq!(event, DecodeEvent::Desync);
		assert_eq!(matrix.key_count(), 0);
		// Decoder is back at INIT: a normal byte makes a key immediately.
		let mut host2 = ScriptedHost::new(&[0x1C]);
		decoder.scan(&mut host2, &mut matrix);
		assert!(matrix.is_on_position(0x1C));
	}

	#[test]
	fn p2_recovery_from_desync_in_e0() {
		let mut decoder = Ps2Decoder::new();
		let mut matrix = Matrix::new();
		let mut host = ScriptedHost::new(&[0xE0, 0x90]);
		decoder.scan(&mut host, &mut matrix);
		let event = decoder.scan(&mut host, &mut matrix);
		assert_eq!(event, DecodeEvent::Desync);
		assert_eq!(matrix.key_count(), 0);
	}

	#[test]
	fn scenario_4_overrun_clears_matrix() {
		let mut decoder = Ps2Decoder::new();
		let mut matrix = Matrix::new();
		let mut host = ScriptedHost::new(&[0x1C]);
		decoder.scan(&mut host, &mut matrix);
		assert!(matrix.is_on_position(0x1C));

		let mut host2 = ScriptedHost::new(&[0x00]);
		let event = decoder.scan(&mut host2, &mut matrix);
		assert_eq!(event, DecodeEvent::Overrun);
		assert_eq!(matrix.key_count(), 0);
	}

	#[test]
	fn f7_and_alt_print_screen_are_single_byte_exceptions() {
		let matrix = run(&[0x83]);
		assert!(matrix.is_on_position(KC_F7));
		let matrix = run(&[0x84]);
		assert!(matrix.is_on_position(PRINT_SCREEN));
	}

	#[test]
	fn print_screen_e0_form_make_and_break() {
		// Other modifiers: E0 12 E0 7C make, E0 F0 7C E0 F0 12 break.
		let matrix = run(&[
			0xE0, 0x12, 0xE0, 0x7C, 0xE0, 0xF0, 0x7C, 0xE0, 0xF0, 0x12,
		]);
		assert_eq!(matrix.key_count(), 0);
	}

	#[test]
	fn self_test_done_reports_reload_leds_and_stays_in_init() {
		let mut decoder = Ps2Decoder::new();
		let mut matrix = Matrix::new();
		let mut host = ScriptedHost::new(&[0xAA]);
		assert_eq!(decoder.scan(&mut host, &mut matrix), DecodeEvent::ReloadLeds);
		let mut host2 = ScriptedHost::new(&[0x1C]);
		decoder.scan(&mut host2, &mut matrix);
		assert!(matrix.is_on_position(0x1C));
	}

	#[test]
	fn korean_keys_ignored_not_disambiguated() {
		let mut decoder = Ps2Decoder::new();
		let mut matrix = Matrix::new();
		matrix.make(0x01);
		let mut host = ScriptedHost::new(&[0xF1]);
		let event = decoder.scan(&mut host, &mut matrix);
		assert_eq!(event, DecodeEvent::KoreanKeyIgnored);
		assert_eq!(matrix.key_count(), 0);
	}

	#[test]
	fn delete_and_down_are_unaffected_by_korean_key_handling() {
		// E0 71 / E0 72 (Delete / Down) are ordinary E0-prefixed codes and
		// must make/break normally; only the bare 0xF1/0xF2 bytes are
		// special-cased.
		let matrix = run(&[0xE0, 0x71]);
		assert!(matrix.is_on_position(0x80 | 0x71));
		let matrix = run(&[0xE0, 0x72, 0xE0, 0xF0, 0x72]);
		assert_eq!(matrix.key_count(), 0);
	}
}
