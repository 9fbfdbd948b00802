//! The top-level handle an application holds (§6): owns one transport
//! connection's multiplexer, registries, and middleware chain, and hands
//! out the caller/responder role-views over them.

use crate::caller::CallerEndpoint;
use crate::middleware::{CircuitBreaker, CircuitBreakerConfig, Middleware, MiddlewareChain, RetryConfig, RetryExecutor};
use crate::mux::{Multiplexer, MultiplexerConfig};
use crate::registry::ContractRegistry;
use crate::responder::ResponderEndpoint;
use crate::transport::Transport;
use crate::dispatch::HandlerRegistry;
use std::sync::Arc;

/// Construction-time configuration for an [`Endpoint`] (§5, §9). All of its
/// nested configs already have sensible `Default`s; resilience policies are
/// opt-in since they apply only to `unary`/`client_stream` calls (§9 design
/// note on why retry/circuit-breaking aren't generic `Middleware` hooks).
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    pub multiplexer: MultiplexerConfig,
    /// `None` disables retry entirely — the default, since blind retries
    /// are only safe for idempotent calls and this crate has no way to know
    /// that about an arbitrary handler.
    pub retry: Option<RetryConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Attached to every `CallContext` (tracing, policy labels) — handy
    /// when a process owns more than one endpoint and logs need to tell
    /// them apart.
    pub label: Option<String>,
}

/// A transport-agnostic RPC endpoint (§3 OVERVIEW, §6): one
/// [`Multiplexer`] plus the registries and middleware both the caller and
/// responder views share. Accepting remote-initiated streams starts the
/// moment the endpoint is constructed (§4.5) — there is no separate
/// `listen`/`serve` call to forget.
pub struct Endpoint {
    mux: Arc<Multiplexer>,
    contracts: Arc<ContractRegistry>,
    handlers: Arc<HandlerRegistry>,
    /// Shared with every `caller()`/`responder()` view handed out, including
    /// the accept loop's own `ResponderEndpoint`: `add_middleware` takes
    /// effect immediately for all of them. Each call snapshots the chain
    /// (a cheap `Vec` clone) once at its start rather than holding the lock
    /// for the call's duration (§4.7).
    middleware: Arc<std::sync::Mutex<MiddlewareChain>>,
    retry: Option<Arc<RetryExecutor>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    label: Option<String>,
}

impl Endpoint {
    pub fn new(transport: Arc<dyn Transport>, config: EndpointConfig) -> Arc<Endpoint> {
        // An unlabelled endpoint still gets a stable identity for log
        // correlation (tracing spans, circuit-breaker diagnostics) — the
        // teacher's `SpeculativeSegment` does the same for anything that
        // needs an identity but wasn't handed one explicitly.
        let label = config.label.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mux = Multiplexer::new(transport, config.multiplexer);
        let contracts = Arc::new(ContractRegistry::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let middleware = Arc::new(std::sync::Mutex::new(MiddlewareChain::new()));
        let retry = config.retry.map(|cfg| Arc::new(RetryExecutor::new(cfg)));
        let circuit_breaker = config
            .circuit_breaker
            .map(|cfg| Arc::new(CircuitBreaker::new(label.clone(), cfg)));

        let endpoint = Arc::new(Endpoint {
            mux,
            contracts,
            handlers,
            middleware,
            retry,
            circuit_breaker,
            label: Some(label),
        });

        endpoint.responder().spawn_accept_loop();
        endpoint
    }

    /// Add a middleware to the chain (§4.7, §6 `addMiddleware(m)`). Takes
    /// effect for every `caller()`/`responder()` view obtained after this
    /// returns; views already handed out keep whatever chain they
    /// snapshotted when created.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.lock().unwrap().push(middleware);
    }

    /// Register every method of a (possibly composed) service contract for
    /// codec lookup (§4.6, §6 `registerServiceContract(c)`). This does not
    /// attach a handler — see [`Endpoint::responder`]'s
    /// `register_unary`/`register_server_stream`/`register_client_stream`/
    /// `register_bidi` for that (§9 Open Question (b): caller-side contract
    /// registration is optional and codec-only).
    pub fn register_service_contract(&self, contract: crate::contract::ServiceContract) -> crate::Result<()> {
        self.contracts.register_service(contract)
    }

    /// The caller-side view: allocate calls against this endpoint's
    /// multiplexer (§4.4).
    pub fn caller(&self) -> CallerEndpoint {
        CallerEndpoint::new(
            self.mux.clone(),
            self.middleware.clone(),
            self.retry.clone(),
            self.circuit_breaker.clone(),
            self.label.clone(),
        )
    }

    /// The responder-side view: register handlers and (once, internally)
    /// drive the accept loop (§4.5, §4.6).
    pub fn responder(&self) -> ResponderEndpoint {
        ResponderEndpoint::new(
            self.mux.clone(),
            self.contracts.clone(),
            self.handlers.clone(),
            self.middleware.clone(),
            self.label.clone(),
        )
    }

    /// Close the underlying transport (§6 `close()`): every in-flight call
    /// observes a synthetic `UNAVAILABLE` trailer (§4.2, §7 class 4).
    pub async fn close(&self) {
        self.mux.close().await;
    }
}
