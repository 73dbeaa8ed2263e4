//! Line-oriented Server-Sent Events decoder.
//!
//! Models the SSE reader as a decoder over a chunked byte stream, yielding
//! `(event_name, data_lines)` pairs. Tolerates blank lines, multi-line
//! `data:` fields, and CRLF, and buffers partial events across chunk
//! boundaries — the design note in spec.md §9 ("SSE parsing").
//!
//! This is intentionally standalone: the host HTTP framework's body type is
//! out of scope here, so the decoder operates over anything that yields
//! `Bytes` chunks (a `Stream`, or bytes appended by a caller one chunk at a
//! time).

use bytes::{Buf, Bytes, BytesMut};

/// One parsed SSE event: an optional event name and the concatenated,
/// newline-joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
	pub event: Option<String>,
	pub data: String,
	pub id: Option<String>,
}

impl SseEvent {
	fn is_empty(&self) -> bool {
		self.event.is_none() && self.data.is_empty() && self.id.is_none()
	}
}

/// Incremental SSE decoder. Feed it bytes with [`Self::push`] and drain
/// completed events with [`Self::next_event`].
#[derive(Debug, Default)]
pub struct SseDecoder {
	buf: BytesMut,
	pending: PendingEvent,
}

#[derive(Debug, Default)]
struct PendingEvent {
	event: Option<String>,
	data: Vec<String>,
	id: Option<String>,
}

impl PendingEvent {
	fn take(&mut self) -> SseEvent {
		let ev = SseEvent {
			event: self.event.take(),
			data: std::mem::take(&mut self.data).join("\n"),
			id: self.id.take(),
		};
		ev
	}

	fn reset(&mut self) {
		*self = PendingEvent::default();
	}
}

impl SseDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	/// Number of bytes currently buffered but not yet consumed into an
	/// event (used by callers enforcing a byte cap).
	pub fn buffered_len(&self) -> usize {
		self.buf.len()
	}

	/// Pull the next complete line (without terminator) out of the
	/// buffer, tolerating `\r\n` and bare `\n`.
	fn next_line(&mut self) -> Option<Bytes> {
		let pos = self.buf.iter().position(|&b| b == b'\n')?;
		let mut line = self.buf.split_to(pos + 1);
		line.truncate(line.len() - 1); // drop '\n'
		if line.ends_with(b"\r") {
			line.truncate(line.len() - 1);
		}
		Some(line.freeze())
	}

	/// Attempt to decode the next complete event from whatever has been
	/// pushed so far. Returns `None` if more bytes are needed.
	pub fn next_event(&mut self) -> Option<SseEvent> {
		loop {
			let line = self.next_line()?;
			if line.is_empty() {
				// Blank line: event boundary.
				if self.pending.event.is_some()
					|| !self.pending.data.is_empty()
					|| self.pending.id.is_some()
				{
					let ev = self.pending.take();
					self.pending.reset();
					if !ev.is_empty() {
						return Some(ev);
					}
				}
				continue;
			}
			self.apply_field(&line);
		}
	}

	fn apply_field(&mut self, line: &[u8]) {
		let line = String::from_utf8_lossy(line);
		if let Some(rest) = line.strip_prefix("data:") {
			let v = rest.strip_prefix(' ').unwrap_or(rest);
			self.pending.data.push(v.to_string());
		} else if let Some(rest) = line.strip_prefix("event:") {
			let v = rest.strip_prefix(' ').unwrap_or(rest);
			self.pending.event = Some(v.to_string());
		} else if let Some(rest) = line.strip_prefix("id:") {
			let v = rest.strip_prefix(' ').unwrap_or(rest);
			self.pending.id = Some(v.to_string());
		}
		// Unknown fields (e.g. `retry:`) and comment lines (`:`) are ignored.
	}

	/// Drain any event left in the buffer without requiring a trailing
	/// blank line — used when the stream ends mid-event.
	pub fn flush(&mut self) -> Option<SseEvent> {
		if self.pending.event.is_some() || !self.pending.data.is_empty() || self.pending.id.is_some()
		{
			let ev = self.pending.take();
			self.pending.reset();
			if !ev.is_empty() {
				return Some(ev);
			}
		}
		None
	}
}

/// Drain all remaining complete events from `buf`'s internal buffer
/// without reading more bytes. Helper for tests and bounded scans.
pub fn drain_all(decoder: &mut SseDecoder) -> Vec<SseEvent> {
	let mut out = Vec::new();
	while let Some(ev) = decoder.next_event() {
		out.push(ev);
	}
	out
}
