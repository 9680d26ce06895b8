//! In-process stand-in for the embedded interpreter.
//!
//! `OfflineRuntime` keeps the same contract as the CPython backend: a
//! reentrant exclusivity lock that the initializing thread owns until
//! `release_thread`, a JSON codec of its own, and a terminal module exposing
//! the vendor entry points the dispatcher calls. Native objects are
//! `serde_json::Value`s.
//!
//! By default the terminal module behaves like the vendor module on a machine
//! without a running terminal: the handshake returns false and every query
//! returns None. [`OfflineRuntime::connected`] serves deterministic synthetic
//! data instead. Failures and per-call latency can be injected, and
//! [`OfflineStats`] counts what happened, which is what the bridge's own
//! tests assert against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde_json::{Map, Number, Value, json};

use crate::config::RuntimeConfig;
use crate::error::RuntimeFault;
use crate::runtime::{Arg, EmbeddedRuntime, RuntimeSession};

/// Vendor codes, as exported by the terminal module.
const CONSTANTS: &[(&str, i64)] = &[
    ("TIMEFRAME_M1", 1),
    ("TIMEFRAME_M5", 5),
    ("TIMEFRAME_M15", 15),
    ("TIMEFRAME_M30", 30),
    ("TIMEFRAME_H1", 16385),
    ("TIMEFRAME_H4", 16388),
    ("TIMEFRAME_D1", 16408),
    ("TIMEFRAME_W1", 32769),
    ("TIMEFRAME_MN1", 49153),
    ("TRADE_ACTION_DEAL", 1),
    ("ORDER_TYPE_BUY", 0),
    ("ORDER_TYPE_SELL", 1),
];

const TRADE_RETCODE_DONE: i64 = 10009;
/// 2024-01-01T00:00:00Z, the synthetic "now".
const SYNTHETIC_NOW: i64 = 1_704_067_200;
/// The terminal's default "max bars in chart".
pub const MAX_BARS: i64 = 100_000;

#[derive(Debug, Default)]
struct Counters {
    bring_ups: AtomicUsize,
    tear_downs: AtomicUsize,
    handshakes: AtomicUsize,
    disconnects: AtomicUsize,
    external_calls: AtomicUsize,
    live_objects: AtomicUsize,
    active_sessions: AtomicUsize,
    peak_sessions: AtomicUsize,
}

/// Point-in-time copy of the runtime's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfflineStats {
    pub bring_ups: usize,
    pub tear_downs: usize,
    /// Calls to the module's connect entry point.
    pub handshakes: usize,
    pub disconnects: usize,
    /// Calls to any other module entry point.
    pub external_calls: usize,
    /// Native objects currently alive.
    pub live_objects: usize,
    /// Highest number of sessions ever open at once.
    pub peak_sessions: usize,
}

pub struct OfflineRuntime {
    gate: ReentrantMutex<()>,
    up: AtomicBool,
    initializer_holds: AtomicBool,
    connected: bool,
    bring_up_failure: Option<String>,
    import_failure: Option<String>,
    faults: HashMap<String, String>,
    call_delay: Option<Duration>,
    last_config: Mutex<Option<RuntimeConfig>>,
    positions: Mutex<Vec<Value>>,
    next_ticket: AtomicU64,
    counters: Counters,
}

impl Default for OfflineRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineRuntime {
    /// A runtime whose terminal module has no terminal to talk to.
    pub fn new() -> Self {
        Self {
            gate: ReentrantMutex::new(()),
            up: AtomicBool::new(false),
            initializer_holds: AtomicBool::new(false),
            connected: false,
            bring_up_failure: None,
            import_failure: None,
            faults: HashMap::new(),
            call_delay: None,
            last_config: Mutex::new(None),
            positions: Mutex::new(Vec::new()),
            next_ticket: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// A runtime whose terminal module serves synthetic market data.
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::new()
        }
    }

    pub fn with_bring_up_failure(mut self, message: impl Into<String>) -> Self {
        self.bring_up_failure = Some(message.into());
        self
    }

    /// Every import raises with `message`.
    pub fn with_import_failure(mut self, message: impl Into<String>) -> Self {
        self.import_failure = Some(message.into());
        self
    }

    /// The module entry point `entry` raises with `message`.
    pub fn with_fault(mut self, entry: impl Into<String>, message: impl Into<String>) -> Self {
        self.faults.insert(entry.into(), message.into());
        self
    }

    /// Every module entry point sleeps for `delay` while the gate is held.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// The configuration passed to the most recent bring-up.
    pub fn last_config(&self) -> Option<RuntimeConfig> {
        self.last_config.lock().clone()
    }

    pub fn stats(&self) -> OfflineStats {
        let c = &self.counters;
        OfflineStats {
            bring_ups: c.bring_ups.load(Ordering::SeqCst),
            tear_downs: c.tear_downs.load(Ordering::SeqCst),
            handshakes: c.handshakes.load(Ordering::SeqCst),
            disconnects: c.disconnects.load(Ordering::SeqCst),
            external_calls: c.external_calls.load(Ordering::SeqCst),
            live_objects: c.live_objects.load(Ordering::SeqCst),
            peak_sessions: c.peak_sessions.load(Ordering::SeqCst),
        }
    }
}

impl EmbeddedRuntime for OfflineRuntime {
    type Session<'r> = OfflineSession<'r>;

    fn bring_up(&self, config: &RuntimeConfig) -> Result<(), RuntimeFault> {
        *self.last_config.lock() = Some(config.clone());
        if let Some(message) = &self.bring_up_failure {
            return Err(RuntimeFault::new(message.clone()));
        }
        // Held on behalf of the initializing thread until release_thread.
        std::mem::forget(self.gate.lock());
        self.initializer_holds.store(true, Ordering::SeqCst);
        self.up.store(true, Ordering::SeqCst);
        self.counters.bring_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release_thread(&self) {
        if self.initializer_holds.swap(false, Ordering::SeqCst) {
            // SAFETY: the guard forgotten in bring_up belongs to this thread.
            unsafe { self.gate.force_unlock() };
        }
    }

    fn tear_down(&self) {
        let _gate = self.gate.lock();
        self.positions.lock().clear();
        self.up.store(false, Ordering::SeqCst);
        self.counters.tear_downs.fetch_add(1, Ordering::SeqCst);
    }

    fn enter(&self) -> OfflineSession<'_> {
        let guard = self.gate.lock();
        let active = self.counters.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_sessions.fetch_max(active, Ordering::SeqCst);
        OfflineSession {
            runtime: self,
            _gate: guard,
        }
    }
}

pub struct OfflineSession<'r> {
    runtime: &'r OfflineRuntime,
    _gate: ReentrantMutexGuard<'r, ()>,
}

impl Drop for OfflineSession<'_> {
    fn drop(&mut self) {
        // Runs before the gate guard field is released.
        self.runtime
            .counters
            .active_sessions
            .fetch_sub(1, Ordering::SeqCst);
    }
}

enum Native {
    Module(String),
    Data(Value),
}

/// A native object, alive only while its session is.
pub struct OfflineObject<'s> {
    native: Native,
    live: &'s AtomicUsize,
}

impl Drop for OfflineObject<'_> {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl OfflineObject<'_> {
    fn data(&self) -> Option<&Value> {
        match &self.native {
            Native::Data(value) => Some(value),
            Native::Module(_) => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match &self.native {
            Native::Module(_) => "module",
            Native::Data(Value::Null) => "NoneType",
            Native::Data(Value::Bool(_)) => "bool",
            Native::Data(Value::Number(n)) if n.is_f64() => "float",
            Native::Data(Value::Number(_)) => "int",
            Native::Data(Value::String(_)) => "str",
            Native::Data(Value::Array(_)) => "list",
            Native::Data(Value::Object(_)) => "dict",
        }
    }
}

impl<'r> OfflineSession<'r> {
    fn object<'s>(&'s self, native: Native) -> OfflineObject<'s> {
        let live = &self.runtime.counters.live_objects;
        live.fetch_add(1, Ordering::SeqCst);
        OfflineObject { native, live }
    }

    fn to_value(arg: &Arg<'_, OfflineObject<'_>>) -> Result<Value, RuntimeFault> {
        Ok(match arg {
            Arg::Str(s) => Value::String((*s).to_string()),
            Arg::Int(n) => Value::from(*n),
            Arg::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .ok_or_else(|| RuntimeFault::new(format!("cannot represent float {f}")))?,
            Arg::Object(obj) => obj.data().cloned().ok_or_else(|| {
                RuntimeFault::new("cannot pass a module as an argument")
            })?,
            Arg::Dict(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert((*key).to_string(), Self::to_value(value)?);
                }
                Value::Object(map)
            }
        })
    }

    fn module_entry(
        &self,
        module: &str,
        entry: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RuntimeFault> {
        let runtime = self.runtime;
        if let Some(delay) = runtime.call_delay {
            std::thread::sleep(delay);
        }

        let counters = &runtime.counters;
        match entry {
            "initialize" => counters.handshakes.fetch_add(1, Ordering::SeqCst),
            "shutdown" => counters.disconnects.fetch_add(1, Ordering::SeqCst),
            _ => counters.external_calls.fetch_add(1, Ordering::SeqCst),
        };

        if let Some(message) = runtime.faults.get(entry) {
            return Err(RuntimeFault::new(message.clone()));
        }

        match entry {
            "initialize" => return Ok(Value::Bool(runtime.connected)),
            "shutdown" => return Ok(Value::Null),
            "terminal_info" | "account_info" | "version" | "symbol_info" | "symbol_info_tick"
            | "copy_rates_from_pos" | "order_send" | "positions_get" => {}
            other => {
                return Err(RuntimeFault::new(format!(
                    "module '{module}' has no attribute '{other}'"
                )));
            }
        }

        if !runtime.connected {
            return Ok(Value::Null);
        }

        match (entry, args.as_slice()) {
            ("terminal_info", []) => Ok(json!({
                "connected": true,
                "trade_allowed": true,
                "name": "Offline Terminal",
                "company": "mt5bridge",
                "build": 4000,
                "path": "offline"
            })),
            ("account_info", []) => Ok(json!({
                "login": 0,
                "server": "Offline",
                "currency": "USD",
                "leverage": 100,
                "balance": 10000.0,
                "equity": 10000.0
            })),
            ("version", []) => Ok(json!([500, 4000, "01 Jan 2024"])),
            ("symbol_info", [Value::String(symbol)]) => Ok(json!({
                "name": symbol,
                "visible": true,
                "digits": 5,
                "point": 0.00001,
                "trade_contract_size": 100000.0
            })),
            ("symbol_info_tick", [Value::String(_)]) => Ok(json!({
                "time": SYNTHETIC_NOW,
                "bid": 1.1,
                "ask": 1.10002,
                "last": 0.0,
                "volume": 0
            })),
            ("copy_rates_from_pos", [Value::String(_), tf, start, count]) => {
                match (tf.as_i64(), start.as_i64(), count.as_i64()) {
                    (Some(tf), Some(start), Some(count)) => synthetic_bars(tf, start, count),
                    _ => Err(RuntimeFault::new("copy_rates_from_pos: invalid arguments")),
                }
            }
            ("order_send", [Value::Object(request)]) => self.fill_order(request),
            ("positions_get", []) => {
                let symbol = kwargs.get("symbol").and_then(Value::as_str);
                let positions = runtime.positions.lock();
                Ok(Value::Array(
                    positions
                        .iter()
                        .filter(|p| symbol.is_none_or(|s| p["symbol"] == s))
                        .cloned()
                        .collect(),
                ))
            }
            _ => Err(RuntimeFault::new(format!("{entry}: invalid arguments"))),
        }
    }

    fn fill_order(&self, request: &Map<String, Value>) -> Result<Value, RuntimeFault> {
        let (Some(symbol), Some(volume), Some(order_type)) = (
            request.get("symbol").and_then(Value::as_str),
            request.get("volume").and_then(Value::as_f64),
            request.get("type").and_then(Value::as_i64),
        ) else {
            return Err(RuntimeFault::new("order_send: invalid request"));
        };
        let price = if order_type == 0 { 1.10002 } else { 1.1 };
        let ticket = self.runtime.next_ticket.fetch_add(1, Ordering::SeqCst);

        self.runtime.positions.lock().push(json!({
            "ticket": ticket,
            "symbol": symbol,
            "type": order_type,
            "volume": volume,
            "price_open": price
        }));

        Ok(json!({
            "retcode": TRADE_RETCODE_DONE,
            "deal": ticket,
            "order": ticket,
            "volume": volume,
            "price": price,
            "comment": "Request executed",
            "request": request
        }))
    }
}

fn timeframe_seconds(code: i64) -> Option<i64> {
    match code {
        16385 => Some(3_600),
        16388 => Some(14_400),
        16408 => Some(86_400),
        32769 => Some(604_800),
        49153 => Some(2_592_000),
        minutes if minutes > 0 => minutes.checked_mul(60),
        _ => None,
    }
}

/// `count` bars ending `start` bars before the synthetic now, oldest first.
///
/// Fails like the vendor call does when the window is empty, larger than
/// [`MAX_BARS`], or reaches back past the representable epoch.
fn synthetic_bars(tf: i64, start: i64, count: i64) -> Result<Value, RuntimeFault> {
    let invalid = || RuntimeFault::new("copy_rates_from_pos: invalid arguments");
    if start < 0 || !(1..=MAX_BARS).contains(&count) {
        return Err(invalid());
    }
    let step = timeframe_seconds(tf).ok_or_else(invalid)?;
    let oldest = start
        .checked_add(count - 1)
        .and_then(|age| age.checked_mul(step))
        .and_then(|span| SYNTHETIC_NOW.checked_sub(span))
        .ok_or_else(invalid)?;

    let bars = (0..count)
        .map(|i| {
            let open = 1.1 + (i as f64) * 0.0001;
            json!({
                "time": oldest + i * step,
                "open": open,
                "high": open + 0.0002,
                "low": open - 0.0001,
                "close": open + 0.0001,
                "tick_volume": 100 + i,
                "spread": 2,
                "real_volume": 0
            })
        })
        .collect();
    Ok(Value::Array(bars))
}

impl<'r> RuntimeSession for OfflineSession<'r> {
    type Object<'s>
        = OfflineObject<'s>
    where
        Self: 's;

    fn import<'s>(&'s self, module: &str) -> Result<OfflineObject<'s>, RuntimeFault> {
        if let Some(message) = &self.runtime.import_failure {
            return Err(RuntimeFault::new(message.clone()));
        }
        Ok(self.object(Native::Module(module.to_string())))
    }

    fn get_attr<'s>(
        &'s self,
        obj: &OfflineObject<'s>,
        name: &str,
    ) -> Result<OfflineObject<'s>, RuntimeFault> {
        match &obj.native {
            Native::Module(module) => CONSTANTS
                .iter()
                .find(|(constant, _)| *constant == name)
                .map(|(_, code)| self.object(Native::Data(Value::from(*code))))
                .ok_or_else(|| {
                    RuntimeFault::new(format!("module '{module}' has no attribute '{name}'"))
                }),
            Native::Data(_) => Err(RuntimeFault::new(format!(
                "'{}' object has no attribute '{name}'",
                obj.type_name()
            ))),
        }
    }

    fn call_method<'s>(
        &'s self,
        obj: &OfflineObject<'s>,
        name: &str,
        args: &[Arg<'_, OfflineObject<'s>>],
        kwargs: &[(&str, Arg<'_, OfflineObject<'s>>)],
    ) -> Result<OfflineObject<'s>, RuntimeFault> {
        let Native::Module(module) = &obj.native else {
            return Err(RuntimeFault::new(format!(
                "'{}' object has no attribute '{name}'",
                obj.type_name()
            )));
        };
        let args = args.iter().map(Self::to_value).collect::<Result<Vec<_>, _>>()?;
        let mut keywords = Map::new();
        for (key, value) in kwargs {
            keywords.insert((*key).to_string(), Self::to_value(value)?);
        }
        let value = self.module_entry(module, name, args, keywords)?;
        Ok(self.object(Native::Data(value)))
    }

    fn get_item<'s>(
        &'s self,
        mapping: &OfflineObject<'s>,
        key: &str,
    ) -> Result<Option<OfflineObject<'s>>, RuntimeFault> {
        match mapping.data() {
            Some(Value::Object(map)) => Ok(map
                .get(key)
                .map(|value| self.object(Native::Data(value.clone())))),
            _ => Err(RuntimeFault::new(format!(
                "'{}' object is not a mapping",
                mapping.type_name()
            ))),
        }
    }

    fn is_none<'s>(&'s self, obj: &OfflineObject<'s>) -> bool {
        matches!(obj.data(), Some(Value::Null))
    }

    fn is_truthy<'s>(&'s self, obj: &OfflineObject<'s>) -> Result<bool, RuntimeFault> {
        Ok(match &obj.native {
            Native::Module(_) => true,
            Native::Data(Value::Null) => false,
            Native::Data(Value::Bool(b)) => *b,
            Native::Data(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Native::Data(Value::String(s)) => !s.is_empty(),
            Native::Data(Value::Array(a)) => !a.is_empty(),
            Native::Data(Value::Object(o)) => !o.is_empty(),
        })
    }

    fn extract_str<'s>(&'s self, obj: &OfflineObject<'s>) -> Result<String, RuntimeFault> {
        match obj.data() {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(RuntimeFault::new(format!("expected str, got {}", obj.type_name()))),
        }
    }

    fn extract_i64<'s>(&'s self, obj: &OfflineObject<'s>) -> Result<i64, RuntimeFault> {
        obj.data()
            .and_then(Value::as_i64)
            .ok_or_else(|| RuntimeFault::new(format!("expected int, got {}", obj.type_name())))
    }

    fn extract_f64<'s>(&'s self, obj: &OfflineObject<'s>) -> Result<f64, RuntimeFault> {
        match obj.data() {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| RuntimeFault::new("number out of range")),
            _ => Err(RuntimeFault::new(format!("expected float, got {}", obj.type_name()))),
        }
    }

    fn loads<'s>(&'s self, text: &str) -> Result<OfflineObject<'s>, RuntimeFault> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| RuntimeFault::new(e.to_string()))?;
        Ok(self.object(Native::Data(value)))
    }

    fn dumps<'s>(&'s self, obj: &OfflineObject<'s>) -> Result<String, RuntimeFault> {
        match obj.data() {
            Some(value) => serde_json::to_string(value).map_err(|e| RuntimeFault::new(e.to_string())),
            None => Err(RuntimeFault::new(format!(
                "Object of type {} is not JSON serializable",
                obj.type_name()
            ))),
        }
    }
}
