//! Event Queue data model (component G, data half).
//!
//! See [`crate::transport`] for the scheduler that drains these buffers.

use crate::ringbuffer::RingBuffer;

/// One HID event waiting to be serialised onto the BLE link.
#[derive(Debug, Clone, Copy)]
pub struct QueueItem {
	/// Millisecond timestamp this item was enqueued, for latency
	/// reporting (`TIMER_DIFF_16` in the original).
	pub added: u16,
	pub kind: QueueItemKind,
}

/// The payload of a [`QueueItem`].
#[derive(Debug, Clone, Copy)]
pub enum QueueItemKind {
	/// An 8-byte boot-protocol key report (modifier byte + up to 6 keys).
	KeyReport { modifier: u8, keys: [u8; 6] },
	/// A 16-bit consumer/system HID usage code.
	Consumer { keycode: u16 },
	/// A relative mouse report. Only constructed when the `mouse` feature
	/// is enabled (`MOUSE_ENABLE` in spec.md §6).
	#[cfg(feature = "mouse")]
	MouseMove {
		x: i8,
		y: i8,
		scroll: i8,
		pan: i8,
		buttons: u8,
	},
}

/// Send Buffer: up to 40 queued [`QueueItem`]s (spec.md §3).
pub type SendBuffer = RingBuffer<QueueItem, 40>;

/// Response Buffer: up to 2 outstanding request timestamps (spec.md §3).
/// While non-empty, no new request may be sent.
pub type ResponseBuffer = RingBuffer<u16, 2>;

/// Bit assigned to a pressed mouse button in [`QueueItemKind::MouseMove`].
#[cfg(feature = "mouse")]
pub mod mouse_buttons {
	pub const LEFT: u8 = 1 << 0;
	pub const RIGHT: u8 = 1 << 1;
	pub const MIDDLE: u8 = 1 << 2;
}
