//! Embedded-interpreter bridge to the MetaTrader5 terminal module.
//!
//! Provides [`Bridge`], which owns one embedded interpreter for the life of
//! the process, serializes every call into it behind the interpreter's
//! exclusivity gate, and exposes a JSON request/response entry point that
//! dispatches to a fixed set of terminal operations. See `mt5bridge-ffi` for
//! the C surface built on top of it.
//!
//! # Quick start
//!
//! ```rust
//! use mt5bridge_runtime::{Bridge, BridgeConfig, OfflineRuntime};
//!
//! let bridge = Bridge::new(OfflineRuntime::connected());
//! bridge.initialize(&BridgeConfig::default()).unwrap();
//!
//! let bars = bridge
//!     .eval(&serde_json::json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 5}))
//!     .unwrap();
//! assert_eq!(bars.as_array().map(Vec::len), Some(5));
//!
//! bridge.shutdown();
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod error_channel;
pub mod lifecycle;
pub mod marshal;
pub mod offline;
#[cfg(feature = "python")]
pub mod python;
pub mod runtime;
pub mod terminal;

pub use config::{BridgeConfig, RuntimeConfig, TerminalConfig};
pub use dispatch::{Method, SUPPORTED_METHODS};
pub use error::{BridgeError, ErrorKind, RuntimeFault};
pub use error_channel::ErrorChannel;
pub use lifecycle::Bridge;
pub use offline::{OfflineRuntime, OfflineStats};
#[cfg(feature = "python")]
pub use python::PythonRuntime;
pub use runtime::{Arg, EmbeddedRuntime, RuntimeSession};
