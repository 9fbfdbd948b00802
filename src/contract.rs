//! Method and service contracts (§3, §4.6).

use crate::codec::{BoxedCodec, Codec};
use std::any::{Any, TypeId};
use std::sync::Arc;

/// Which of the four gRPC-style interaction patterns a method follows
/// (§3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Unary,
    ServerStream,
    ClientStream,
    BidiStream,
}

/// A codec pair erased to `Any` so heterogeneous methods can share one
/// registry, with the original `TypeId`s kept alongside so a caller
/// re-deriving its static types can be checked at registration time (§3:
/// "the registry enforces type consistency at registration").
#[derive(Clone)]
pub struct ErasedCodecs {
    request_type: TypeId,
    response_type: TypeId,
    request_codec: Arc<dyn Any + Send + Sync>,
    response_codec: Arc<dyn Any + Send + Sync>,
}

impl ErasedCodecs {
    pub fn new<Req, Resp>(request_codec: BoxedCodec<Req>, response_codec: BoxedCodec<Resp>) -> Self
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        ErasedCodecs {
            request_type: TypeId::of::<Req>(),
            response_type: TypeId::of::<Resp>(),
            // The erased slot holds the `Arc<dyn Codec<T>>` itself as the
            // `Any` payload (it is `Sized` and `'static`), so downcasting
            // recovers the fat pointer rather than trying to downcast
            // across two different trait objects.
            request_codec: Arc::new(request_codec),
            response_codec: Arc::new(response_codec),
        }
    }

    pub fn request_codec<Req: Send + Sync + 'static>(&self) -> Option<BoxedCodec<Req>> {
        if self.request_type != TypeId::of::<Req>() {
            return None;
        }
        self.request_codec
            .downcast_ref::<BoxedCodec<Req>>()
            .cloned()
    }

    pub fn response_codec<Resp: Send + Sync + 'static>(&self) -> Option<BoxedCodec<Resp>> {
        if self.response_type != TypeId::of::<Resp>() {
            return None;
        }
        self.response_codec
            .downcast_ref::<BoxedCodec<Resp>>()
            .cloned()
    }
}

/// `(serviceName, methodName, pattern, requestCodec, responseCodec)` (§3).
#[derive(Clone)]
pub struct MethodContract {
    pub service_name: String,
    pub method_name: String,
    pub pattern: Pattern,
    pub codecs: ErasedCodecs,
}

impl MethodContract {
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        pattern: Pattern,
        codecs: ErasedCodecs,
    ) -> Self {
        MethodContract {
            service_name: service_name.into(),
            method_name: method_name.into(),
            pattern,
            codecs,
        }
    }

    pub fn method_path(&self) -> String {
        format!("/{}/{}", self.service_name, self.method_name)
    }
}

/// `(serviceName, methods[], subcontracts[])` (§3). A subcontract shares the
/// parent's `service_name` but contributes additional methods; composition
/// happens at `ServiceContract::flatten` time, not at method-call time, so
/// the flattened view handed to the registry is immutable once built (§3
/// lifecycle: "immutable once registered").
pub struct ServiceContract {
    pub service_name: String,
    methods: Vec<MethodContract>,
    subcontracts: Vec<ServiceContract>,
}

impl ServiceContract {
    pub fn new(service_name: impl Into<String>) -> Self {
        ServiceContract {
            service_name: service_name.into(),
            methods: Vec::new(),
            subcontracts: Vec::new(),
        }
    }

    pub fn with_method(mut self, mut method: MethodContract) -> Self {
        method.service_name = self.service_name.clone();
        self.methods.push(method);
        self
    }

    /// Compose a subcontract into this one (§4.6). The subcontract's own
    /// `service_name` is ignored for dispatch purposes — its methods are
    /// reparented onto `self.service_name` — but its method names must
    /// remain prefix-free/unique within the flattened service (checked by
    /// `flatten`).
    pub fn with_subcontract(mut self, subcontract: ServiceContract) -> Self {
        self.subcontracts.push(subcontract);
        self
    }

    /// Flatten this contract and its subcontracts into the
    /// `methodName -> MethodContract` view the registry stores (§3, §4.6).
    /// Fails if any two methods across the tree share a method name.
    pub fn flatten(self) -> crate::Result<Vec<MethodContract>> {
        let mut flattened = Vec::new();
        self.collect_into(&mut flattened)?;
        Ok(flattened)
    }

    fn collect_into(self, out: &mut Vec<MethodContract>) -> crate::Result<()> {
        for mut method in self.methods {
            method.service_name = self.service_name.clone();
            if out.iter().any(|m: &MethodContract| m.method_name == method.method_name) {
                return Err(crate::Error::Config(format!(
                    "duplicate method '{}' in service '{}'",
                    method.method_name, self.service_name
                )));
            }
            out.push(method);
        }
        for sub in self.subcontracts {
            let mut renamed = sub;
            renamed.service_name = self.service_name.clone();
            renamed.collect_into(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FnCodec;
    use bytes::Bytes;

    fn string_codec() -> BoxedCodec<String> {
        Arc::new(FnCodec::new(
            |s: &String| Ok(Bytes::copy_from_slice(s.as_bytes())),
            |b: &[u8]| String::from_utf8(b.to_vec()).map_err(|e| crate::Error::Codec(e.to_string())),
        ))
    }

    #[test]
    fn flatten_reparents_subcontract_methods() {
        let sub = ServiceContract::new("ignored").with_method(MethodContract::new(
            "ignored",
            "Sub",
            Pattern::Unary,
            ErasedCodecs::new(string_codec(), string_codec()),
        ));
        let parent = ServiceContract::new("Echo")
            .with_method(MethodContract::new(
                "Echo",
                "Say",
                Pattern::Unary,
                ErasedCodecs::new(string_codec(), string_codec()),
            ))
            .with_subcontract(sub);

        let flattened = parent.flatten().unwrap();
        assert_eq!(flattened.len(), 2);
        assert!(flattened.iter().all(|m| m.service_name == "Echo"));
        assert!(flattened.iter().any(|m| m.method_name == "Sub"));
    }

    #[test]
    fn flatten_rejects_duplicate_method_names() {
        let contract = ServiceContract::new("Echo")
            .with_method(MethodContract::new(
                "Echo",
                "Say",
                Pattern::Unary,
                ErasedCodecs::new(string_codec(), string_codec()),
            ))
            .with_method(MethodContract::new(
                "Echo",
                "Say",
                Pattern::Unary,
                ErasedCodecs::new(string_codec(), string_codec()),
            ));
        assert!(contract.flatten().is_err());
    }
}
