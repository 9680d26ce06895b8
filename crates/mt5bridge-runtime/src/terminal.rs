use crate::error::RuntimeFault;
use crate::runtime::{Arg, RuntimeSession};

/// Vendor entry point opening the terminal connection.
const CONNECT: &str = "initialize";
/// Vendor entry point closing the terminal connection.
const DISCONNECT: &str = "shutdown";

/// The vendor terminal module, imported inside one gate-held session.
pub struct TerminalModule<'s, S: RuntimeSession + 's> {
    session: &'s S,
    module: S::Object<'s>,
}

impl<'s, S: RuntimeSession + 's> TerminalModule<'s, S> {
    pub fn import(session: &'s S, name: &str) -> Result<Self, RuntimeFault> {
        let module = session.import(name)?;
        Ok(Self { session, module })
    }

    pub fn session(&self) -> &'s S {
        self.session
    }

    /// Open the terminal connection. Returns the module's own verdict; a
    /// falsy result (no terminal running) is not an error.
    pub fn connect(&self) -> Result<bool, RuntimeFault> {
        let outcome = self.call(CONNECT, &[], &[])?;
        self.session.is_truthy(&outcome)
    }

    pub fn disconnect(&self) -> Result<(), RuntimeFault> {
        self.call(DISCONNECT, &[], &[]).map(drop)
    }

    /// A module-level constant such as `TIMEFRAME_M1`.
    pub fn constant(&self, name: &str) -> Result<S::Object<'s>, RuntimeFault> {
        self.session.get_attr(&self.module, name)
    }

    pub fn call(
        &self,
        entry: &str,
        args: &[Arg<'_, S::Object<'s>>],
        kwargs: &[(&str, Arg<'_, S::Object<'s>>)],
    ) -> Result<S::Object<'s>, RuntimeFault> {
        self.session.call_method(&self.module, entry, args, kwargs)
    }
}
