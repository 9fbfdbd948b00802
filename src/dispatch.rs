//! Handler storage for the responder side (§4.5, §4.6).
//!
//! [`crate::registry::ContractRegistry`] holds the typed, append-only
//! `(service, method) -> MethodContract` metadata both sides may consult for
//! codecs (§9 Open Question (b): caller-side registration is optional and
//! codec-only). `HandlerRegistry` is the separate, responder-only table that
//! actually answers a dispatch: "call into *this* handler" — kept apart so a
//! caller-side contract registration (codecs only, no handler) can never be
//! mistaken for something dispatchable.

use crate::call::unary::ErasedHandler;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ErasedHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        HandlerRegistry { handlers: RwLock::new(HashMap::new()) }
    }

    pub(crate) fn register(&self, method_path: String, handler: Arc<dyn ErasedHandler>) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| Error::Config("handler registry lock poisoned".into()))?;
        if handlers.contains_key(&method_path) {
            return Err(Error::Config(format!("handler for '{method_path}' already registered")));
        }
        handlers.insert(method_path, handler);
        Ok(())
    }

    pub(crate) fn lookup(&self, method_path: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.read().ok()?.get(method_path).cloned()
    }
}
