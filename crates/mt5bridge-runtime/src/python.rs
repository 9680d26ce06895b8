//! CPython backend over pyo3's raw FFI layer.
//!
//! The exclusivity gate is the GIL. Sessions hold a `PyGILState_Ensure`
//! token and release it on drop; [`PyObj`] owns one strong reference and
//! drops it with `Py_DecRef`, so every object is released before the GIL is.

use std::ffi::{CStr, CString, OsString, c_char};
use std::marker::PhantomData;
use std::path::Path;
use std::ptr::{self, NonNull};

use pyo3::ffi;

use crate::config::RuntimeConfig;
use crate::error::RuntimeFault;
use crate::runtime::{Arg, EmbeddedRuntime, RuntimeSession};

/// Name under which the helper module is registered in `sys.modules`.
const HELPER_MODULE: &CStr = c"_mt5bridge";

/// Normalizes terminal results into plain JSON-able values before encoding.
const HELPER_SOURCE: &CStr = cr#"
import json
import math


def _plain(obj):
    if isinstance(obj, float):
        return obj if math.isfinite(obj) else None
    if isinstance(obj, dict):
        return {str(k): _plain(v) for k, v in obj.items()}
    if hasattr(obj, "_asdict"):
        return {k: _plain(v) for k, v in obj._asdict().items()}
    if hasattr(obj, "dtype") and hasattr(obj, "tolist"):
        names = getattr(obj.dtype, "names", None)
        data = obj.tolist()
        if names:
            if getattr(obj, "ndim", 0) == 0:
                return {n: _plain(v) for n, v in zip(names, data)}
            return [{n: _plain(v) for n, v in zip(names, row)} for row in data]
        return _plain(data)
    if isinstance(obj, (list, tuple)):
        return [_plain(v) for v in obj]
    return obj


def dumps(obj):
    return json.dumps(_plain(obj), separators=(",", ":"), allow_nan=False)
"#;

/// The process-wide CPython interpreter.
///
/// CPython supports a single main interpreter per process; create at most one
/// `PythonRuntime` and keep it in a `static`.
#[derive(Debug, Default)]
pub struct PythonRuntime {
    _private: (),
}

impl PythonRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `PYTHONHOME` set for the duration of interpreter start-up only.
///
/// Dropping it puts back whatever the host had, so a later bring-up without
/// an explicit home does not inherit the previous override.
struct HomeOverride {
    previous: Option<Option<OsString>>,
}

impl HomeOverride {
    /// # Safety
    ///
    /// Mutates the process environment; no other thread may be reading or
    /// writing it until the override is dropped.
    unsafe fn apply(home: Option<&Path>) -> Self {
        let Some(home) = home else {
            return Self { previous: None };
        };
        tracing::debug!(home = %home.display(), "Setting PYTHONHOME");
        let previous = std::env::var_os("PYTHONHOME");
        unsafe { std::env::set_var("PYTHONHOME", home) };
        Self {
            previous: Some(previous),
        }
    }
}

impl Drop for HomeOverride {
    fn drop(&mut self) {
        // SAFETY: same exclusivity as `apply`.
        match self.previous.take() {
            Some(Some(value)) => unsafe { std::env::set_var("PYTHONHOME", value) },
            Some(None) => unsafe { std::env::remove_var("PYTHONHOME") },
            None => {}
        }
    }
}

impl EmbeddedRuntime for PythonRuntime {
    type Session<'r> = PythonSession<'r>;

    fn bring_up(&self, config: &RuntimeConfig) -> Result<(), RuntimeFault> {
        if unsafe { ffi::Py_IsInitialized() } != 0 {
            return Err(RuntimeFault::new(
                "interpreter already initialized by the host process",
            ));
        }

        // SAFETY: bring-up runs under the bridge's exclusive lifecycle lock,
        // before the interpreter starts any threads of its own.
        let home = unsafe { HomeOverride::apply(config.home.as_deref()) };
        unsafe { ffi::Py_InitializeEx(0) };
        // The interpreter has resolved its prefix; the host's value comes back.
        drop(home);
        if unsafe { ffi::Py_IsInitialized() } == 0 {
            return Err(RuntimeFault::new("Py_Initialize failed"));
        }

        // The GIL is held by this thread from here until release_thread.
        if let Err(fault) = unsafe { prepare(config) } {
            unsafe { ffi::Py_FinalizeEx() };
            return Err(fault);
        }
        Ok(())
    }

    fn release_thread(&self) {
        unsafe {
            if ffi::PyGILState_Check() == 1 {
                ffi::PyEval_SaveThread();
            }
        }
    }

    fn tear_down(&self) {
        unsafe {
            if ffi::Py_IsInitialized() == 0 {
                return;
            }
            ffi::PyGILState_Ensure();
            if ffi::Py_FinalizeEx() != 0 {
                tracing::warn!("Errors while finalizing the interpreter (buffered data may be lost)");
            }
        }
    }

    fn enter(&self) -> PythonSession<'_> {
        let state = unsafe { ffi::PyGILState_Ensure() };
        PythonSession {
            state,
            _runtime: PhantomData,
            _not_send: PhantomData,
        }
    }
}

/// Put search paths on `sys.path` and install the helper module.
///
/// # Safety
///
/// The interpreter is up and the calling thread holds the GIL.
unsafe fn prepare(config: &RuntimeConfig) -> Result<(), RuntimeFault> {
    unsafe {
        let path = ffi::PySys_GetObject(c"path".as_ptr());
        if path.is_null() {
            return Err(RuntimeFault::new("sys.path is missing"));
        }
        for entry in config.search_paths.iter().rev() {
            let text = entry.to_string_lossy();
            let item = new_str(&text);
            if item.is_null() {
                return Err(take_fault());
            }
            let rc = ffi::PyList_Insert(path, 0, item);
            ffi::Py_DecRef(item);
            if rc != 0 {
                return Err(take_fault());
            }
        }

        let module = ffi::PyImport_AddModule(HELPER_MODULE.as_ptr());
        if module.is_null() {
            return Err(take_fault());
        }
        let globals = ffi::PyModule_GetDict(module);
        let result = ffi::PyRun_String(
            HELPER_SOURCE.as_ptr(),
            ffi::Py_file_input,
            globals,
            globals,
        );
        if result.is_null() {
            return Err(take_fault());
        }
        ffi::Py_DecRef(result);
    }
    Ok(())
}

unsafe fn new_str(text: &str) -> *mut ffi::PyObject {
    unsafe {
        ffi::PyUnicode_FromStringAndSize(text.as_ptr().cast::<c_char>(), text.len() as ffi::Py_ssize_t)
    }
}

/// UTF-8 contents of a `str`, or `None` if it cannot be read.
unsafe fn utf8(obj: *mut ffi::PyObject) -> Option<String> {
    unsafe {
        let mut len: ffi::Py_ssize_t = 0;
        let data = ffi::PyUnicode_AsUTF8AndSize(obj, &mut len);
        if data.is_null() {
            ffi::PyErr_Clear();
            return None;
        }
        let bytes = std::slice::from_raw_parts(data.cast::<u8>(), len as usize);
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// `str(obj)`, or `None` if that raises.
unsafe fn describe(obj: *mut ffi::PyObject) -> Option<String> {
    unsafe {
        let text = ffi::PyObject_Str(obj);
        if text.is_null() {
            ffi::PyErr_Clear();
            return None;
        }
        let message = utf8(text);
        ffi::Py_DecRef(text);
        message
    }
}

/// Take the pending exception, if any, as a fault carrying `str(exc)`.
/// Exceptions with an empty message are described by their type name.
#[allow(deprecated)]
unsafe fn take_fault() -> RuntimeFault {
    unsafe {
        let mut kind = ptr::null_mut();
        let mut value = ptr::null_mut();
        let mut traceback = ptr::null_mut();
        ffi::PyErr_Fetch(&mut kind, &mut value, &mut traceback);
        if kind.is_null() {
            return RuntimeFault::unreported();
        }
        ffi::PyErr_NormalizeException(&mut kind, &mut value, &mut traceback);

        let described = if value.is_null() { None } else { describe(value) };
        let message = described
            .filter(|m| !m.is_empty())
            .or_else(|| type_name(kind.cast()));

        for obj in [kind, value, traceback] {
            if !obj.is_null() {
                ffi::Py_DecRef(obj);
            }
        }
        message.map_or_else(RuntimeFault::unreported, RuntimeFault::new)
    }
}

unsafe fn type_name(ty: *mut ffi::PyTypeObject) -> Option<String> {
    unsafe {
        let name = (*ty).tp_name;
        (!name.is_null()).then(|| CStr::from_ptr(name).to_string_lossy().into_owned())
    }
}

unsafe fn type_name_of(obj: *mut ffi::PyObject) -> String {
    unsafe { type_name(ffi::Py_TYPE(obj)) }.unwrap_or_else(|| "object".to_string())
}

fn c_name(name: &str) -> Result<CString, RuntimeFault> {
    CString::new(name).map_err(|_| RuntimeFault::new(format!("name contains NUL: {name:?}")))
}

/// One GIL-holding session.
pub struct PythonSession<'r> {
    state: ffi::PyGILState_STATE,
    _runtime: PhantomData<&'r PythonRuntime>,
    // The GIL state token must be released on the thread that took it.
    _not_send: PhantomData<*mut ()>,
}

impl Drop for PythonSession<'_> {
    fn drop(&mut self) {
        unsafe { ffi::PyGILState_Release(self.state) };
    }
}

/// A strong reference, released on drop while the session still holds the GIL.
pub struct PyObj<'s> {
    ptr: NonNull<ffi::PyObject>,
    _session: PhantomData<&'s ()>,
}

impl PyObj<'_> {
    fn as_ptr(&self) -> *mut ffi::PyObject {
        self.ptr.as_ptr()
    }

    /// Give the reference away, e.g. to a call that steals it.
    fn into_raw(self) -> *mut ffi::PyObject {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl Drop for PyObj<'_> {
    fn drop(&mut self) {
        unsafe { ffi::Py_DecRef(self.ptr.as_ptr()) };
    }
}

impl<'r> PythonSession<'r> {
    /// Take ownership of a new reference, or turn a null into the pending fault.
    fn own<'s>(&'s self, ptr: *mut ffi::PyObject) -> Result<PyObj<'s>, RuntimeFault> {
        match NonNull::new(ptr) {
            Some(ptr) => Ok(PyObj {
                ptr,
                _session: PhantomData,
            }),
            None => Err(unsafe { take_fault() }),
        }
    }

    fn borrowed<'s>(&'s self, ptr: *mut ffi::PyObject) -> Result<PyObj<'s>, RuntimeFault> {
        if !ptr.is_null() {
            unsafe { ffi::Py_IncRef(ptr) };
        }
        self.own(ptr)
    }

    fn to_py<'s>(&'s self, arg: &Arg<'_, PyObj<'s>>) -> Result<PyObj<'s>, RuntimeFault> {
        match arg {
            Arg::Str(s) => self.own(unsafe { new_str(s) }),
            Arg::Int(n) => self.own(unsafe { ffi::PyLong_FromLongLong(*n) }),
            Arg::Float(f) => self.own(unsafe { ffi::PyFloat_FromDouble(*f) }),
            Arg::Object(obj) => self.borrowed(obj.as_ptr()),
            Arg::Dict(entries) => self.dict(entries),
        }
    }

    fn dict<'s>(&'s self, entries: &[(&str, Arg<'_, PyObj<'s>>)]) -> Result<PyObj<'s>, RuntimeFault> {
        let dict = self.own(unsafe { ffi::PyDict_New() })?;
        for (key, value) in entries {
            let key = c_name(key)?;
            let value = self.to_py(value)?;
            if unsafe { ffi::PyDict_SetItemString(dict.as_ptr(), key.as_ptr(), value.as_ptr()) } != 0 {
                return Err(unsafe { take_fault() });
            }
        }
        Ok(dict)
    }

    fn call<'s>(
        &'s self,
        callable: &PyObj<'s>,
        args: &[Arg<'_, PyObj<'s>>],
        kwargs: &[(&str, Arg<'_, PyObj<'s>>)],
    ) -> Result<PyObj<'s>, RuntimeFault> {
        let tuple = self.own(unsafe { ffi::PyTuple_New(args.len() as ffi::Py_ssize_t) })?;
        for (i, arg) in args.iter().enumerate() {
            let item = self.to_py(arg)?;
            // PyTuple_SetItem steals the item reference.
            if unsafe { ffi::PyTuple_SetItem(tuple.as_ptr(), i as ffi::Py_ssize_t, item.into_raw()) } != 0 {
                return Err(unsafe { take_fault() });
            }
        }
        let keywords = if kwargs.is_empty() {
            None
        } else {
            Some(self.dict(kwargs)?)
        };
        let keywords_ptr = keywords.as_ref().map_or(ptr::null_mut(), PyObj::as_ptr);
        self.own(unsafe { ffi::PyObject_Call(callable.as_ptr(), tuple.as_ptr(), keywords_ptr) })
    }

    fn call_module<'s>(
        &'s self,
        module: &CStr,
        function: &str,
        args: &[Arg<'_, PyObj<'s>>],
    ) -> Result<PyObj<'s>, RuntimeFault> {
        let module = self.own(unsafe { ffi::PyImport_ImportModule(module.as_ptr()) })?;
        self.call_method(&module, function, args, &[])
    }
}

impl<'r> RuntimeSession for PythonSession<'r> {
    type Object<'s>
        = PyObj<'s>
    where
        Self: 's;

    fn import<'s>(&'s self, module: &str) -> Result<PyObj<'s>, RuntimeFault> {
        let name = c_name(module)?;
        self.own(unsafe { ffi::PyImport_ImportModule(name.as_ptr()) })
    }

    fn get_attr<'s>(&'s self, obj: &PyObj<'s>, name: &str) -> Result<PyObj<'s>, RuntimeFault> {
        let name = c_name(name)?;
        self.own(unsafe { ffi::PyObject_GetAttrString(obj.as_ptr(), name.as_ptr()) })
    }

    fn call_method<'s>(
        &'s self,
        obj: &PyObj<'s>,
        name: &str,
        args: &[Arg<'_, PyObj<'s>>],
        kwargs: &[(&str, Arg<'_, PyObj<'s>>)],
    ) -> Result<PyObj<'s>, RuntimeFault> {
        let callable = self.get_attr(obj, name)?;
        self.call(&callable, args, kwargs)
    }

    fn get_item<'s>(
        &'s self,
        mapping: &PyObj<'s>,
        key: &str,
    ) -> Result<Option<PyObj<'s>>, RuntimeFault> {
        unsafe {
            if ffi::PyDict_Check(mapping.as_ptr()) == 0 {
                return Err(RuntimeFault::new(format!(
                    "'{}' object is not a mapping",
                    type_name_of(mapping.as_ptr())
                )));
            }
            let key = self.own(new_str(key))?;
            let item = ffi::PyDict_GetItemWithError(mapping.as_ptr(), key.as_ptr());
            if item.is_null() {
                if ffi::PyErr_Occurred().is_null() {
                    return Ok(None);
                }
                return Err(take_fault());
            }
            self.borrowed(item).map(Some)
        }
    }

    fn is_none<'s>(&'s self, obj: &PyObj<'s>) -> bool {
        obj.as_ptr() == unsafe { ffi::Py_None() }
    }

    fn is_truthy<'s>(&'s self, obj: &PyObj<'s>) -> Result<bool, RuntimeFault> {
        match unsafe { ffi::PyObject_IsTrue(obj.as_ptr()) } {
            -1 => Err(unsafe { take_fault() }),
            truth => Ok(truth == 1),
        }
    }

    fn extract_str<'s>(&'s self, obj: &PyObj<'s>) -> Result<String, RuntimeFault> {
        unsafe {
            if ffi::PyUnicode_Check(obj.as_ptr()) == 0 {
                return Err(RuntimeFault::new(format!(
                    "expected str, got {}",
                    type_name_of(obj.as_ptr())
                )));
            }
            utf8(obj.as_ptr()).ok_or_else(|| RuntimeFault::new("str is not valid UTF-8"))
        }
    }

    fn extract_i64<'s>(&'s self, obj: &PyObj<'s>) -> Result<i64, RuntimeFault> {
        unsafe {
            let raw = obj.as_ptr();
            if ffi::PyBool_Check(raw) != 0 || ffi::PyLong_Check(raw) == 0 {
                return Err(RuntimeFault::new(format!("expected int, got {}", type_name_of(raw))));
            }
            let value = ffi::PyLong_AsLongLong(raw);
            if value == -1 && !ffi::PyErr_Occurred().is_null() {
                return Err(take_fault());
            }
            Ok(value)
        }
    }

    fn extract_f64<'s>(&'s self, obj: &PyObj<'s>) -> Result<f64, RuntimeFault> {
        unsafe {
            let raw = obj.as_ptr();
            let numeric = ffi::PyFloat_Check(raw) != 0 || ffi::PyLong_Check(raw) != 0;
            if ffi::PyBool_Check(raw) != 0 || !numeric {
                return Err(RuntimeFault::new(format!("expected float, got {}", type_name_of(raw))));
            }
            let value = ffi::PyFloat_AsDouble(raw);
            if value == -1.0 && !ffi::PyErr_Occurred().is_null() {
                return Err(take_fault());
            }
            Ok(value)
        }
    }

    fn loads<'s>(&'s self, text: &str) -> Result<PyObj<'s>, RuntimeFault> {
        self.call_module(c"json", "loads", &[Arg::Str(text)])
    }

    fn dumps<'s>(&'s self, obj: &PyObj<'s>) -> Result<String, RuntimeFault> {
        let text = self.call_module(HELPER_MODULE, "dumps", &[Arg::Object(obj)])?;
        self.extract_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bridge, BridgeConfig, BridgeError, TerminalConfig};
    use serde_json::json;
    use serial_test::serial;
    use std::ffi::OsStr;
    use std::sync::LazyLock;

    /// Stand-in for the vendor module, importable from a temporary directory.
    const FAKE_TERMINAL: &str = r#"
import collections

TIMEFRAME_M1 = 1
TIMEFRAME_H1 = 16385
TRADE_ACTION_DEAL = 1
ORDER_TYPE_BUY = 0
ORDER_TYPE_SELL = 1

Info = collections.namedtuple("Info", ["connected", "name", "build"])
_up = False

def initialize():
    global _up
    _up = True
    return True

def shutdown():
    global _up
    _up = False

def terminal_info():
    return Info(_up, "Fake Terminal", 4000)

def version():
    return (500, 4000, "01 Jan 2024")

def copy_rates_from_pos(symbol, timeframe, start, count):
    if symbol == "BROKEN":
        raise RuntimeError("no history for " + symbol)
    return [(1704067200 - 60 * (count - 1 - i), 1.1, 1.2, 1.0, 1.15) for i in range(count)]

def order_send(request):
    return {"retcode": 10009, "request": request}
"#;

    // One interpreter per test binary; tests share it serially.
    static BRIDGE: LazyLock<(tempfile::TempDir, Bridge<PythonRuntime>)> = LazyLock::new(|| {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MetaTrader5.py"), FAKE_TERMINAL).unwrap();
        (dir, Bridge::new(PythonRuntime::new()))
    });

    fn bridge() -> &'static Bridge<PythonRuntime> {
        let (dir, bridge) = &*BRIDGE;
        let config = BridgeConfig {
            runtime: RuntimeConfig {
                home: None,
                search_paths: vec![dir.path().to_path_buf()],
            },
            terminal: TerminalConfig {
                module: "MetaTrader5".into(),
            },
        };
        bridge.initialize(&config).unwrap();
        bridge
    }

    #[test]
    #[serial]
    fn named_tuples_become_objects() {
        let info = bridge().eval(&json!({"method": "terminal_info"})).unwrap();
        assert_eq!(info, json!({"connected": true, "name": "Fake Terminal", "build": 4000}));
    }

    #[test]
    #[serial]
    fn tuples_become_arrays() {
        let version = bridge().eval(&json!({"method": "version"})).unwrap();
        assert_eq!(version, json!([500, 4000, "01 Jan 2024"]));
    }

    #[test]
    #[serial]
    fn bars_and_orders_reach_the_module() {
        let bars = bridge()
            .eval(&json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 3}))
            .unwrap();
        assert_eq!(bars.as_array().map(Vec::len), Some(3));
        assert_eq!(bars[2][0], 1704067200);

        let order = bridge()
            .eval(&json!({"method": "open_market_buy", "symbol": "EURUSD", "volume": 0.1}))
            .unwrap();
        assert_eq!(order["retcode"], 10009);
        assert_eq!(
            order["request"],
            json!({"action": 1, "symbol": "EURUSD", "volume": 0.1, "type": 0})
        );
    }

    #[test]
    #[serial]
    fn python_exceptions_surface_as_call_errors() {
        let bridge = bridge();
        let err = bridge
            .eval(&json!({"method": "get_m1_bars", "symbol": "BROKEN", "count": 1}))
            .unwrap_err();
        assert!(matches!(err, BridgeError::ExternalCall(_)));
        assert_eq!(bridge.last_error().as_deref(), Some("no history for BROKEN"));
    }

    #[test]
    #[serial]
    fn eval_from_other_threads() {
        let bridge = bridge();
        std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| s.spawn(|| bridge.eval(&json!({"method": "version"}))))
                .collect();
            for worker in workers {
                assert_eq!(worker.join().unwrap().unwrap()[0], 500);
            }
        });
    }

    #[test]
    #[serial]
    fn home_override_is_scoped_to_bring_up() {
        let host = std::env::var_os("PYTHONHOME");
        unsafe { std::env::set_var("PYTHONHOME", "/host/python") };

        let home = unsafe { HomeOverride::apply(Some(Path::new("/opt/py_runtime"))) };
        assert_eq!(std::env::var_os("PYTHONHOME").as_deref(), Some(OsStr::new("/opt/py_runtime")));
        drop(home);
        assert_eq!(std::env::var_os("PYTHONHOME").as_deref(), Some(OsStr::new("/host/python")));

        // Without an explicit home the host's value is left alone.
        drop(unsafe { HomeOverride::apply(None) });
        assert_eq!(std::env::var_os("PYTHONHOME").as_deref(), Some(OsStr::new("/host/python")));

        unsafe { std::env::remove_var("PYTHONHOME") };
        drop(unsafe { HomeOverride::apply(Some(Path::new("/opt/py_runtime"))) });
        assert_eq!(std::env::var_os("PYTHONHOME"), None);

        match host {
            Some(value) => unsafe { std::env::set_var("PYTHONHOME", value) },
            None => unsafe { std::env::remove_var("PYTHONHOME") },
        }
    }
}
