//! The embedded interpreter as seen by the bridge.
//!
//! The interpreter permits only one native thread to run its code at a time.
//! [`EmbeddedRuntime::enter`] is the only way to obtain a [`RuntimeSession`],
//! and every native object handed out by a session borrows that session.
//! Objects therefore cannot outlive the gate, and dropping the session
//! releases the gate after all of them have released their references.

use crate::config::RuntimeConfig;
use crate::error::RuntimeFault;

/// Argument passed to a runtime call.
pub enum Arg<'a, O> {
    Str(&'a str),
    Int(i64),
    Float(f64),
    Object(&'a O),
    /// A fresh string-keyed mapping built from the given entries.
    Dict(Vec<(&'a str, Arg<'a, O>)>),
}

pub trait EmbeddedRuntime: Send + Sync {
    type Session<'r>: RuntimeSession
    where
        Self: 'r;

    /// Start the interpreter.
    ///
    /// On success the calling thread owns the exclusivity lock until it calls
    /// [`release_thread`](Self::release_thread). On failure nothing is left
    /// running.
    fn bring_up(&self, config: &RuntimeConfig) -> Result<(), RuntimeFault>;

    /// Hand the lock taken by `bring_up` back so other threads can enter.
    /// Must be called on the thread that called `bring_up`.
    fn release_thread(&self);

    /// Finalize the interpreter. The caller must not hold the lock or any
    /// session; the lock is taken internally and never given back.
    fn tear_down(&self);

    /// Block until the calling thread holds the exclusivity gate.
    fn enter(&self) -> Self::Session<'_>;
}

/// Operations available while the exclusivity gate is held.
pub trait RuntimeSession {
    type Object<'s>
    where
        Self: 's;

    fn import<'s>(&'s self, module: &str) -> Result<Self::Object<'s>, RuntimeFault>;

    fn get_attr<'s>(
        &'s self,
        obj: &Self::Object<'s>,
        name: &str,
    ) -> Result<Self::Object<'s>, RuntimeFault>;

    fn call_method<'s>(
        &'s self,
        obj: &Self::Object<'s>,
        name: &str,
        args: &[Arg<'_, Self::Object<'s>>],
        kwargs: &[(&str, Arg<'_, Self::Object<'s>>)],
    ) -> Result<Self::Object<'s>, RuntimeFault>;

    /// Look `key` up in a mapping. Fails if `mapping` is not a mapping.
    fn get_item<'s>(
        &'s self,
        mapping: &Self::Object<'s>,
        key: &str,
    ) -> Result<Option<Self::Object<'s>>, RuntimeFault>;

    fn is_none<'s>(&'s self, obj: &Self::Object<'s>) -> bool;

    fn is_truthy<'s>(&'s self, obj: &Self::Object<'s>) -> Result<bool, RuntimeFault>;

    fn extract_str<'s>(&'s self, obj: &Self::Object<'s>) -> Result<String, RuntimeFault>;

    /// Integer value. Booleans are rejected.
    fn extract_i64<'s>(&'s self, obj: &Self::Object<'s>) -> Result<i64, RuntimeFault>;

    /// Numeric value; integers are widened.
    fn extract_f64<'s>(&'s self, obj: &Self::Object<'s>) -> Result<f64, RuntimeFault>;

    /// Decode JSON text with the runtime's own decoder.
    fn loads<'s>(&'s self, text: &str) -> Result<Self::Object<'s>, RuntimeFault>;

    /// Encode an object as compact JSON text with the runtime's own encoder.
    fn dumps<'s>(&'s self, obj: &Self::Object<'s>) -> Result<String, RuntimeFault>;
}
