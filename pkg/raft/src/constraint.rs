//! `MatchConstraint` decouples "the consensus core decided what to respond"
//! from "it is safe to actually send that response" — a response to
//! AppendEntries must not reach the network before the entries it describes
//! are durable, but the consensus core itself never awaits I/O (§2.1 of the
//! expanded spec). Instead it hands back a value tagged with the log position
//! that must be flushed first, and the node shell is responsible for waiting
//! on that before writing the response to the wire.

use super::protos::LogPosition;

/// A value that must not be released to its caller until the log has been
/// made durable up to `pos`.
pub struct MatchConstraint<T> {
	value: T,
	pos: LogPosition,
}

impl<T> MatchConstraint<T> {
	pub fn new(value: T, pos: LogPosition) -> Self {
		MatchConstraint { value, pos }
	}

	/// The position that must be durable before `value` may be observed.
	pub fn required_position(&self) -> LogPosition {
		self.pos
	}

	/// Releases the inner value. Callers must only do this once they have
	/// confirmed the log is durable at least up to `required_position()`.
	pub fn release(self) -> T {
		self.value
	}
}

/// Values with nothing to wait on (e.g. a rejection, which never touched the
/// log) convert for free, at the zero position.
impl<T> From<T> for MatchConstraint<T> {
	fn from(value: T) -> Self {
		MatchConstraint {
			value,
			pos: LogPosition { term: 0, index: 0 },
		}
	}
}
