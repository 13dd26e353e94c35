//! Error hierarchy for the node.
//!
//! `Recoverable` errors are handled at the boundary that detects them (turned
//! into a protocol response or a metric bump) and never escape the node's run
//! loop. `Fatal` errors — exclusively log/snapshot I/O failures — propagate out
//! of the run loop and terminate the process; we would rather crash than risk
//! acknowledging a write that was never made durable.

error_chain! {
	foreign_links {
		Io(::std::io::Error);
		Encode(::rmp_serde::encode::Error);
		Decode(::rmp_serde::decode::Error);
	}

	errors {
		/// The log or snapshot file is corrupt in a way recovery cannot paper over
		/// (as opposed to a trailing partial record, which is silently dropped).
		CorruptLog(reason: String) {
			description("corrupt log")
			display("corrupt log: {}", reason)
		}

		/// Raised if the consensus core is asked to do something that violates
		/// one of its own invariants (a bug, not an operational condition).
		InvariantViolation(reason: String) {
			description("consensus invariant violated")
			display("consensus invariant violated: {}", reason)
		}
	}
}

impl Error {
	/// Whether this error should be treated as fatal to the owning node.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self.kind(),
			ErrorKind::Io(_) | ErrorKind::CorruptLog(_) | ErrorKind::InvariantViolation(_)
		)
	}
}
