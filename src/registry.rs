//! Contract registry: the append-only `methodPath -> MethodContract` map an
//! [`crate::endpoint::Endpoint`] dispatches against (§3, §4.6).

use crate::contract::{MethodContract, ServiceContract};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::RwLock;

/// Maps `/service/method` paths to their registered [`MethodContract`].
///
/// # Thread safety
///
/// Lookups (during dispatch) are far more frequent than registrations
/// (usually all performed once at startup), so the registry is an
/// `RwLock`-guarded map rather than anything lock-free.
pub struct ContractRegistry {
    methods: RwLock<HashMap<String, MethodContract>>,
}

impl Default for ContractRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContractRegistry {
    pub fn new() -> Self {
        ContractRegistry { methods: RwLock::new(HashMap::new()) }
    }

    /// Register every method of a (possibly composed) service contract.
    /// Rejects the whole batch if any method path collides with one
    /// already registered (§3: "append-only; duplicate registration is
    /// rejected").
    pub fn register_service(&self, contract: ServiceContract) -> Result<()> {
        let flattened = contract.flatten()?;
        let mut methods = self.methods.write().map_err(|_| Error::Config("registry lock poisoned".into()))?;
        for method in &flattened {
            if methods.contains_key(&method.method_path()) {
                return Err(Error::Config(format!(
                    "method '{}' already registered",
                    method.method_path()
                )));
            }
        }
        for method in flattened {
            methods.insert(method.method_path(), method);
        }
        Ok(())
    }

    /// Register a single method ad hoc, bypassing `ServiceContract`
    /// composition (§4.6: "ad-hoc method registration without requiring a
    /// full service contract").
    pub fn register_method(&self, method: MethodContract) -> Result<()> {
        let mut methods = self.methods.write().map_err(|_| Error::Config("registry lock poisoned".into()))?;
        let path = method.method_path();
        if methods.contains_key(&path) {
            return Err(Error::Config(format!("method '{}' already registered", path)));
        }
        methods.insert(path, method);
        Ok(())
    }

    /// O(1) lookup by wire method path (§3).
    pub fn lookup(&self, method_path: &str) -> Option<MethodContract> {
        self.methods.read().ok()?.get(method_path).cloned()
    }

    pub fn len(&self) -> usize {
        self.methods.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FnCodec;
    use crate::contract::{ErasedCodecs, Pattern};
    use bytes::Bytes;
    use std::sync::Arc;

    fn string_codec() -> crate::codec::BoxedCodec<String> {
        Arc::new(FnCodec::new(
            |s: &String| Ok(Bytes::copy_from_slice(s.as_bytes())),
            |b: &[u8]| String::from_utf8(b.to_vec()).map_err(|e| Error::Codec(e.to_string())),
        ))
    }

    #[test]
    fn register_then_lookup() {
        let registry = ContractRegistry::new();
        let contract = ServiceContract::new("Echo").with_method(MethodContract::new(
            "Echo",
            "Say",
            Pattern::Unary,
            ErasedCodecs::new(string_codec(), string_codec()),
        ));
        registry.register_service(contract).unwrap();
        assert!(registry.lookup("/Echo/Say").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ContractRegistry::new();
        let make = || {
            ServiceContract::new("Echo").with_method(MethodContract::new(
                "Echo",
                "Say",
                Pattern::Unary,
                ErasedCodecs::new(string_codec(), string_codec()),
            ))
        };
        registry.register_service(make()).unwrap();
        assert!(registry.register_service(make()).is_err());
        // The rejected batch must not have partially overwritten anything.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ad_hoc_method_registration() {
        let registry = ContractRegistry::new();
        let method = MethodContract::new(
            "Adhoc",
            "Ping",
            Pattern::Unary,
            ErasedCodecs::new(string_codec(), string_codec()),
        );
        registry.register_method(method).unwrap();
        assert!(registry.lookup("/Adhoc/Ping").is_some());
    }

    #[test]
    fn unknown_method_lookup_returns_none() {
        let registry = ContractRegistry::new();
        assert!(registry.lookup("/Nope/Nope").is_none());
    }
}
