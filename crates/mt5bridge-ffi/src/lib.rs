//! C surface of the MetaTrader5 bridge.
//!
//! One process-wide [`Bridge`] sits behind a handful of `extern "C"`
//! functions. Requests and responses cross the boundary as UTF-8 JSON text;
//! strings returned by the bridge are owned by the caller and must be
//! released with [`mt5bridge_free`]. See `include/mt5bridge.h`.
//!
//! Built without the `python` feature the library runs the offline backend,
//! which behaves like the terminal module on a machine with no terminal
//! running.

use std::ffi::{CStr, CString, c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::ptr;
use std::str::Utf8Error;
use std::sync::{LazyLock, Once};

use mt5bridge_runtime::{Bridge, BridgeConfig, BridgeError, ErrorKind};
use tracing_subscriber::{EnvFilter, fmt};

#[cfg(feature = "python")]
type Backend = mt5bridge_runtime::PythonRuntime;
#[cfg(not(feature = "python"))]
type Backend = mt5bridge_runtime::OfflineRuntime;

static BRIDGE: LazyLock<Bridge<Backend>> = LazyLock::new(|| Bridge::new(Backend::new()));

/// Env filter for the library's own log output; logging stays off when unset.
pub const LOG_ENV: &str = "MT5BRIDGE_LOG";

fn init_logging() {
    static LOGGING: Once = Once::new();
    LOGGING.call_once(|| {
        if std::env::var_os(LOG_ENV).is_some() {
            // The host may already have installed a subscriber.
            let _ = fmt()
                .with_env_filter(EnvFilter::from_env(LOG_ENV))
                .with_writer(std::io::stderr)
                .try_init();
        }
    });
}

fn format_panic_payload(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run an entry point body, turning a panic into a recorded error and
/// `fallback` instead of unwinding into foreign frames.
fn guarded<T>(fallback: T, body: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(payload) => {
            let err = BridgeError::Panic(format_panic_payload(payload.as_ref()));
            tracing::error!(error = %err, "Panic caught at the C boundary");
            BRIDGE.errors().record(err.to_string());
            fallback
        }
    }
}

fn to_c_string(text: String) -> *mut c_char {
    // Interior NULs cannot occur in serde_json output or in channel messages.
    CString::new(text).map_or(ptr::null_mut(), CString::into_raw)
}

/// Borrow a caller string as UTF-8.
///
/// # Safety
///
/// `text` is null or points to a NUL-terminated string.
unsafe fn borrow_str<'a>(text: *const c_char) -> Result<Option<&'a str>, Utf8Error> {
    if text.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(text) }.to_str().map(Some)
}

/// Initialize the bridge: start the interpreter and open the terminal
/// connection. `python_home` (nullable, UTF-8) overrides the configured
/// interpreter home.
///
/// Returns 0 on success (also when already initialized), -1 if the
/// interpreter failed to start, -2 if the terminal handshake failed, -3 on a
/// configuration error and -4 otherwise. The message is available from
/// [`mt5bridge_last_error`].
///
/// # Safety
///
/// `python_home` is null or points to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mt5bridge_initialize(python_home: *const c_char) -> c_int {
    init_logging();
    guarded(ErrorKind::Panic.code(), || {
        let outcome = BRIDGE.initialize_with(|| {
            let home = unsafe { borrow_str(python_home) }
                .map_err(|_| BridgeError::Config("python_home is not valid UTF-8".into()))?;
            Ok(BridgeConfig::load()?.with_home(home.map(PathBuf::from)))
        });
        match outcome {
            Ok(()) => 0,
            Err(err) => err.kind().code(),
        }
    })
}

/// Close the terminal connection and finalize the interpreter. A no-op when
/// not initialized.
#[unsafe(no_mangle)]
pub extern "C" fn mt5bridge_shutdown() {
    guarded((), || BRIDGE.shutdown());
}

/// Evaluate one JSON request, e.g. `{"method":"get_m1_bars","symbol":"EURUSD","count":10}`.
///
/// Returns compact JSON text owned by the caller (release with
/// [`mt5bridge_free`]); `"null"` is a valid answer. Returns null on failure,
/// with the message in [`mt5bridge_last_error`].
///
/// # Safety
///
/// `request_json` is null or points to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mt5bridge_eval(request_json: *const c_char) -> *mut c_char {
    guarded(ptr::null_mut(), || {
        let outcome = match unsafe { borrow_str(request_json) } {
            Ok(Some(text)) => BRIDGE.eval_json(text),
            Ok(None) => BRIDGE.reject(BridgeError::MalformedRequest("request is null".into())),
            Err(_) => BRIDGE.reject(BridgeError::MalformedRequest(
                "request is not valid UTF-8".into(),
            )),
        };
        match outcome {
            Ok(response) => to_c_string(response),
            Err(_) => ptr::null_mut(),
        }
    })
}

/// Release a string returned by this library.
///
/// # Safety
///
/// `text` is null or was returned by [`mt5bridge_eval`] or
/// [`mt5bridge_last_error_copy`] and not yet freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mt5bridge_free(text: *mut c_char) {
    if !text.is_null() {
        drop(unsafe { CString::from_raw(text) });
    }
}

/// Message of the most recent failed call, or null if it succeeded.
///
/// # WARNING: Pointer Lifetime
/// The pointer is owned by the bridge and valid only until the next bridge
/// call from any thread. Use [`mt5bridge_last_error_copy`] when calls may
/// interleave.
#[unsafe(no_mangle)]
pub extern "C" fn mt5bridge_last_error() -> *const c_char {
    guarded(ptr::null(), || BRIDGE.errors().as_ptr())
}

/// Caller-owned copy of the most recent error message, or null.
/// Release with [`mt5bridge_free`].
#[unsafe(no_mangle)]
pub extern "C" fn mt5bridge_last_error_copy() -> *mut c_char {
    guarded(ptr::null_mut(), || {
        BRIDGE.last_error().map_or(ptr::null_mut(), to_c_string)
    })
}
