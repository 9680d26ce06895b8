use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;

use crate::config::BridgeConfig;
use crate::dispatch::Method;
use crate::error::BridgeError;
use crate::error_channel::ErrorChannel;
use crate::marshal::{marshal_in, marshal_out};
use crate::runtime::EmbeddedRuntime;
use crate::terminal::TerminalModule;

/// Set while the runtime is up and the terminal handshake has succeeded.
struct Active {
    module: String,
    since: Instant,
}

/// The bridge: one embedded runtime, its terminal module, and the
/// last-error channel.
///
/// # Threading
///
/// `Bridge` is `Send + Sync`. `initialize` and `shutdown` take the lifecycle
/// lock exclusively; `eval` takes it shared, so any number of callers can
/// queue on the runtime's exclusivity gate while teardown waits for all of
/// them to leave. Gate-held work is serialized; which waiting caller goes
/// next is up to the runtime.
pub struct Bridge<R: EmbeddedRuntime> {
    runtime: R,
    state: RwLock<Option<Active>>,
    errors: ErrorChannel,
}

impl<R: EmbeddedRuntime> Bridge<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            state: RwLock::new(None),
            errors: ErrorChannel::new(),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    /// Message of the most recent failed call, if the most recent call failed.
    pub fn last_error(&self) -> Option<String> {
        self.errors.peek()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    /// Bring the runtime up and open the terminal connection.
    ///
    /// Idempotent: once initialized, further calls succeed without touching
    /// the runtime. A failed attempt leaves nothing running and may be retried.
    pub fn initialize(&self, config: &BridgeConfig) -> Result<(), BridgeError> {
        self.initialize_with(|| Ok(config.clone()))
    }

    /// Like [`initialize`](Self::initialize), but the configuration is only
    /// resolved when the runtime actually has to be brought up.
    pub fn initialize_with(
        &self,
        resolve: impl FnOnce() -> Result<BridgeConfig, BridgeError>,
    ) -> Result<(), BridgeError> {
        let mut state = self.state.write();
        self.errors.clear();

        if state.is_some() {
            tracing::debug!("Bridge already initialized");
            return Ok(());
        }

        let outcome = resolve().and_then(|config| {
            self.bring_up(&config)?;
            *state = Some(Active {
                module: config.terminal.module.clone(),
                since: Instant::now(),
            });
            tracing::info!(module = %config.terminal.module, "Bridge initialized");
            Ok(())
        });
        self.errors.observe(outcome)
    }

    fn bring_up(&self, config: &BridgeConfig) -> Result<(), BridgeError> {
        tracing::info!(
            home = ?config.runtime.home,
            search_paths = config.runtime.search_paths.len(),
            "Bringing up embedded runtime"
        );
        self.runtime.bring_up(&config.runtime).map_err(|fault| {
            BridgeError::RuntimeBringup(fault.describe_or("interpreter did not start"))
        })?;

        let handshake = self.handshake(&config.terminal.module);
        // The initializing thread gives the lock up either way so that a
        // failed handshake can be followed by a clean teardown.
        self.runtime.release_thread();

        if let Err(err) = handshake {
            tracing::warn!(error = %err, "Terminal handshake failed, tearing runtime down");
            self.runtime.tear_down();
            return Err(err);
        }
        Ok(())
    }

    fn handshake(&self, module: &str) -> Result<(), BridgeError> {
        let session = self.runtime.enter();
        let terminal = TerminalModule::import(&session, module).map_err(|fault| {
            BridgeError::Handshake(fault.describe_or("failed to import terminal module"))
        })?;
        let connected = terminal.connect().map_err(|fault| {
            BridgeError::Handshake(fault.describe_or("terminal initialize failed"))
        })?;
        if !connected {
            tracing::warn!(module, "Terminal module reports no connection; queries will return null");
        }
        Ok(())
    }

    /// Close the terminal connection and finalize the runtime.
    ///
    /// A no-op when not initialized. A failing terminal disconnect is
    /// recorded in the error channel but never prevents teardown.
    pub fn shutdown(&self) {
        let mut state = self.state.write();
        self.errors.clear();

        let Some(active) = state.take() else {
            return;
        };

        if let Err(err) = self.disconnect(&active.module) {
            tracing::warn!(error = %err, "Terminal disconnect failed, continuing teardown");
            self.errors.record(err.to_string());
        }
        self.runtime.tear_down();

        tracing::info!(uptime = ?active.since.elapsed(), "Bridge shut down");
    }

    fn disconnect(&self, module: &str) -> Result<(), BridgeError> {
        let session = self.runtime.enter();
        let terminal = match TerminalModule::import(&session, module) {
            Ok(terminal) => terminal,
            Err(fault) => {
                // Nothing was connected through a module that no longer imports.
                tracing::debug!(error = %fault, "Terminal module unavailable at shutdown");
                return Ok(());
            }
        };
        terminal.disconnect().map_err(|fault| {
            BridgeError::Teardown(fault.describe_or("terminal shutdown failed"))
        })
    }

    /// Evaluate one request.
    ///
    /// `Ok(Value::Null)` is a legitimate answer (e.g. no terminal connection).
    pub fn eval(&self, request: &Value) -> Result<Value, BridgeError> {
        self.errors.clear();
        let outcome = self.with_active(|active| self.dispatch(active, request));
        self.errors.observe(outcome)
    }

    /// Evaluate one request given as JSON text, answering with compact JSON text.
    pub fn eval_json(&self, request: &str) -> Result<String, BridgeError> {
        self.errors.clear();
        let outcome = self.with_active(|active| {
            let request: Value = serde_json::from_str(request).map_err(|e| {
                BridgeError::MalformedRequest(format!("request is not valid JSON: {e}"))
            })?;
            let response = self.dispatch(active, &request)?;
            serde_json::to_string(&response)
                .map_err(|e| BridgeError::Marshaling(format!("failed to serialize response: {e}")))
        });
        self.errors.observe(outcome)
    }

    /// Fail a request the caller could not decode before reaching the bridge
    /// (null pointer, invalid UTF-8). An uninitialized bridge still reports
    /// `NotInitialized` first.
    pub fn reject<T>(&self, err: BridgeError) -> Result<T, BridgeError> {
        self.errors.clear();
        let outcome = self.with_active(|_| Err(err));
        self.errors.observe(outcome)
    }

    fn with_active<T>(
        &self,
        f: impl FnOnce(&Active) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let state = self.state.read();
        let active = state.as_ref().ok_or(BridgeError::NotInitialized)?;
        f(active)
    }

    fn dispatch(&self, active: &Active, request: &Value) -> Result<Value, BridgeError> {
        match request {
            Value::Null => return Err(BridgeError::MalformedRequest("request is null".into())),
            Value::Object(_) => {}
            _ => {
                return Err(BridgeError::MalformedRequest(
                    "request must be a JSON object".into(),
                ));
            }
        }

        let session = self.runtime.enter();
        let native = marshal_in(&session, request)?;
        let method = Method::parse(&session, &native)?;
        tracing::debug!(method = method.name(), "Dispatching request");

        let terminal = TerminalModule::import(&session, &active.module).map_err(|fault| {
            BridgeError::ExternalCall(fault.describe_or("failed to import terminal module"))
        })?;
        let result = method.invoke(&terminal)?;
        marshal_out(&session, &result)
    }
}

impl<R: EmbeddedRuntime> Drop for Bridge<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
