//! Service registration and method dispatch.
//!
//! A [`ServiceRegistry`] maps service names to handlers. Most handlers are
//! assembled from typed async closures with [`ServiceBuilder`]; the
//! [`ServiceHandler`] trait is the escape hatch for services that want the
//! raw payload.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RpcError};

/// Boxed future returned by type-erased method functions.
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A service able to answer method invocations on raw payloads.
///
/// Implement this directly only when you need control over payload
/// decoding; otherwise build the service from typed closures.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Invoke `method` with the raw request payload.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::UnknownMethod`] for a method the service does
    /// not provide; any other error is reported to the caller as a failed
    /// handler.
    async fn invoke(&self, method: &str, payload: Bytes) -> Result<Bytes>;

    /// Methods this service answers, for diagnostics.
    fn method_names(&self) -> Vec<String>;
}

/// Object-safe face of one registered method.
trait MethodFn: Send + Sync {
    fn call(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

/// Adapter that erases the concrete request and response types of an async
/// closure behind [`MethodFn`].
struct Method<F, TReq, TResp> {
    func: F,
    _phantom: PhantomData<fn(TReq) -> TResp>,
}

impl<F, Fut, TReq, TResp> MethodFn for Method<F, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TResp>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    fn call(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        // ---
        let request: TReq = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(err) => return Box::pin(async move { Err(RpcError::Serialization(err)) }),
        };
        let fut = (self.func)(request);
        Box::pin(async move {
            let response = fut.await?;
            Ok(Bytes::from(serde_json::to_vec(&response)?))
        })
    }
}

/// Builder assembling a service from typed async methods.
///
/// # Example
///
/// ```
/// use wire_rpc::{ServiceBuilder, ServiceRegistry};
///
/// let mut registry = ServiceRegistry::new();
/// registry.register(
///     "Math",
///     ServiceBuilder::new().method("add", |terms: (i32, i32)| async move {
///         Ok(terms.0 + terms.1)
///     }),
/// );
/// ```
#[derive(Default)]
pub struct ServiceBuilder {
    methods: HashMap<String, Arc<dyn MethodFn>>,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a typed async method.
    ///
    /// The request payload is deserialized into `TReq` before `func` runs,
    /// and the `TResp` it produces is serialized into the response payload.
    /// A payload that does not parse as `TReq` fails the call without
    /// invoking `func`.
    pub fn method<F, Fut, TReq, TResp>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
    {
        // ---
        self.methods.insert(
            name.to_string(),
            Arc::new(Method {
                func,
                _phantom: PhantomData,
            }),
        );
        self
    }

    fn build(self) -> MethodService {
        MethodService {
            methods: self.methods,
        }
    }
}

/// Service backed by the closures collected in a [`ServiceBuilder`].
struct MethodService {
    methods: HashMap<String, Arc<dyn MethodFn>>,
}

#[async_trait]
impl ServiceHandler for MethodService {
    async fn invoke(&self, method: &str, payload: Bytes) -> Result<Bytes> {
        // ---
        let func = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))?;
        func.call(payload).await
    }

    fn method_names(&self) -> Vec<String> {
        // ---
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Maps service names to their handlers.
///
/// Registration happens before the registry is handed to a channel or
/// server; afterwards the registry is shared read-only.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service assembled from typed closures.
    ///
    /// Registering the same name twice replaces the earlier service.
    pub fn register(&mut self, service: impl Into<String>, builder: ServiceBuilder) {
        // ---
        self.services.insert(service.into(), Arc::new(builder.build()));
    }

    /// Register a hand-implemented [`ServiceHandler`].
    pub fn register_handler(&mut self, service: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        // ---
        self.services.insert(service.into(), handler);
    }

    /// Names of all registered services.
    pub fn service_names(&self) -> Vec<String> {
        // ---
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Methods provided by `service`, or `None` if it is not registered.
    pub fn method_names(&self, service: &str) -> Option<Vec<String>> {
        // ---
        self.services
            .get(service)
            .map(|handler| handler.method_names())
    }

    /// Route one invocation to the named service.
    ///
    /// Service names are matched verbatim; in particular the empty string
    /// is an ordinary, never-registered name.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::UnknownService`] when no such service exists,
    /// otherwise whatever the handler returns.
    pub async fn dispatch(&self, service: &str, method: &str, payload: Bytes) -> Result<Bytes> {
        // ---
        let handler = self
            .services
            .get(service)
            .cloned()
            .ok_or_else(|| RpcError::UnknownService(service.to_string()))?;
        handler.invoke(method, payload).await
    }
}
