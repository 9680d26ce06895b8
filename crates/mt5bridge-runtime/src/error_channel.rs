//! Last-error channel
//!
//! A single message slot shared by every caller of a [`Bridge`](crate::Bridge).
//! Each entry point clears it on entry and records into it on failure, so
//! the slot always describes the most recently completed call. There is no
//! history: under concurrent failing callers a reader may observe another
//! call's message. Rust callers that need exact attribution should use the
//! `Result` returned by each call instead.

use std::ffi::{CString, c_char};
use std::ptr;

use parking_lot::Mutex;

#[derive(Default)]
pub struct ErrorChannel {
    // Kept as a CString so the C surface can hand out a pointer without
    // allocating on every read.
    slot: Mutex<Option<CString>>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the current message.
    pub fn record(&self, message: impl Into<String>) {
        let message = c_safe(message.into());
        *self.slot.lock() = Some(message);
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }

    /// The current message, or `None` when the last call succeeded.
    pub fn peek(&self) -> Option<String> {
        self.slot
            .lock()
            .as_ref()
            .map(|msg| msg.to_string_lossy().into_owned())
    }

    /// Record the error of a failed call and hand the outcome back unchanged.
    pub fn observe<T, E: std::fmt::Display>(&self, outcome: Result<T, E>) -> Result<T, E> {
        if let Err(err) = &outcome {
            self.record(err.to_string());
        }
        outcome
    }

    /// Raw pointer to the current message, or null.
    ///
    /// # WARNING: Pointer Lifetime
    /// The pointer stays valid only until the next `record` or `clear`, which
    /// any bridge call on any thread may perform. Copy it immediately.
    pub fn as_ptr(&self) -> *const c_char {
        match &*self.slot.lock() {
            Some(msg) => msg.as_ptr(),
            None => ptr::null(),
        }
    }
}

/// Replace interior NUL bytes with '?' so the full message survives the trip
/// through a C string.
fn c_safe(message: String) -> CString {
    let cleaned: Vec<u8> = message
        .into_bytes()
        .into_iter()
        .map(|b| if b == 0 { b'?' } else { b })
        .collect();
    CString::new(cleaned).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn record_overwrites_and_clear_empties() {
        let channel = ErrorChannel::new();
        assert_eq!(channel.peek(), None);

        channel.record("first");
        channel.record("second");
        assert_eq!(channel.peek().as_deref(), Some("second"));

        channel.clear();
        assert_eq!(channel.peek(), None);
        assert!(channel.as_ptr().is_null());
    }

    #[test]
    fn interior_nul_is_replaced() {
        let channel = ErrorChannel::new();
        channel.record("bad\0byte");
        assert_eq!(channel.peek().as_deref(), Some("bad?byte"));

        let raw = unsafe { CStr::from_ptr(channel.as_ptr()) };
        assert_eq!(raw.to_str().unwrap(), "bad?byte");
    }

    #[test]
    fn observe_records_only_failures() {
        let channel = ErrorChannel::new();
        let ok: Result<u8, String> = channel.observe(Ok(1));
        assert_eq!(ok, Ok(1));
        assert_eq!(channel.peek(), None);

        let err: Result<u8, String> = channel.observe(Err("nope".into()));
        assert!(err.is_err());
        assert_eq!(channel.peek().as_deref(), Some("nope"));
    }
}
