//! Named services and their handler tables.
//!
//! A [`Service`] maps method names to async handlers. Handlers take the
//! request's positional arguments and settle with a JSON value or an
//! [`ErrorResponse`]. A method may declare how many arguments it takes;
//! calls that break the contract are rejected before the handler runs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use calbridge_core::BoxFuture;
use calbridge_protocol::{ErrorCode, ErrorResponse};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

pub type HandlerResult = Result<Value, ErrorResponse>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;
type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

struct Method {
    arity: Option<usize>,
    handler: Handler,
}

/// A handler table.
#[derive(Default)]
pub struct Service {
    methods: HashMap<String, Method>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("Service").field("methods", &names).finish()
    }
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a method taking any number of arguments.
    pub fn method<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(name.into(), None, handler)
    }

    /// Adds a method that must be called with exactly `arity` arguments.
    pub fn method_with_arity<F, Fut>(self, name: impl Into<String>, arity: usize, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(name.into(), Some(arity), handler)
    }

    fn insert<F, Fut>(mut self, name: String, arity: Option<usize>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| -> HandlerFuture { Box::pin(handler(args)) });
        self.methods.insert(name, Method { arity, handler });
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Starts `method`. The contract is checked immediately; the returned
    /// future runs the handler.
    pub fn call(&self, method: &str, args: Vec<Value>) -> HandlerFuture {
        let Some(entry) = self.methods.get(method) else {
            let error = ErrorResponse::new(
                ErrorCode::MethodNotFound,
                format!("no method named {}", method),
            );
            return Box::pin(async move { Err(error) });
        };
        if let Some(arity) = entry.arity
            && args.len() != arity
        {
            let error = ErrorResponse::invalid_request("arguments length doesn't match contract")
                .with_detail(serde_json::json!({
                    "method": method,
                    "expected": arity,
                    "received": args.len(),
                }));
            return Box::pin(async move { Err(error) });
        }
        (entry.handler)(args)
    }
}

/// Services of one worker, by name.
///
/// Every change to the registered set is published on [`subscribe`], which
/// is how the bridge knows to announce readiness again.
///
/// [`subscribe`]: ServiceRegistry::subscribe
pub struct ServiceRegistry {
    services: RwLock<BTreeMap<String, Arc<Service>>>,
    names: watch::Sender<Vec<String>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let (names, _) = watch::channel(Vec::new());
        Self {
            services: RwLock::new(BTreeMap::new()),
            names,
        }
    }

    /// Registers `service` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, service: Service) -> Option<Arc<Service>> {
        let name = name.into();
        let previous = {
            let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
            let previous = services.insert(name.clone(), Arc::new(service));
            self.publish(&services);
            previous
        };
        if previous.is_some() {
            info!(service = %name, "service replaced");
        } else {
            info!(service = %name, "service registered");
        }
        previous
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let removed = services.remove(name).is_some();
        if removed {
            self.publish(&services);
            debug!(service = %name, "service unregistered");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.names.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.names.subscribe()
    }

    fn publish(&self, services: &BTreeMap<String, Arc<Service>>) {
        let names: Vec<String> = services.keys().cloned().collect();
        self.names.send_replace(names);
    }
}

/// Positional argument `index` as a string.
pub fn arg_str(args: &[Value], index: usize, name: &str) -> Result<String, ErrorResponse> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ErrorResponse::invalid_request(format!("argument {} must be a string", name)))
}

/// Positional argument decoded into `T`.
pub fn arg<T: serde::de::DeserializeOwned>(
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<T, ErrorResponse> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| ErrorResponse::invalid_request(format!("missing argument {}", name)))?;
    serde_json::from_value(value)
        .map_err(|e| ErrorResponse::invalid_request(format!("invalid argument {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Service {
        Service::new()
            .method("echo", |args| async move { Ok(Value::Array(args)) })
            .method_with_arity("pair", 2, |args| async move { Ok(json!([args[1], args[0]])) })
    }

    #[tokio::test]
    async fn calls_registered_method() {
        let service = echo();
        assert_eq!(service.call("echo", vec![json!(1)]).await.unwrap(), json!([1]));
        assert_eq!(
            service.call("pair", vec![json!("a"), json!("b")]).await.unwrap(),
            json!(["b", "a"])
        );
    }

    #[tokio::test]
    async fn contract_violation_is_invalid_request() {
        let err = echo().call("pair", vec![json!("a")]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        assert_eq!(err.message, "arguments length doesn't match contract");
        assert_eq!(err.detail["expected"], 2);
    }

    #[tokio::test]
    async fn undeclared_method_is_not_found() {
        let err = echo().call("missing", vec![]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MethodNotFound);
    }

    #[test]
    fn registry_publishes_name_changes() {
        let registry = ServiceRegistry::new();
        let mut names = registry.subscribe();
        assert!(names.borrow_and_update().is_empty());

        assert!(registry.register("calendar", echo()).is_none());
        assert!(names.has_changed().unwrap());
        assert_eq!(*names.borrow_and_update(), vec!["calendar".to_string()]);

        assert!(registry.register("calendar", echo()).is_some());
        assert!(registry.unregister("calendar"));
        assert!(!registry.unregister("calendar"));
        assert!(registry.names().is_empty());
        assert!(registry.get("calendar").is_none());
    }

    #[test]
    fn argument_helpers() {
        let args = vec![json!("work"), json!({"id": "x"})];
        assert_eq!(arg_str(&args, 0, "accountId").unwrap(), "work");
        assert!(arg_str(&args, 1, "accountId").is_err());
        let value: serde_json::Map<String, Value> = arg(&args, 1, "event").unwrap();
        assert_eq!(value["id"], "x");
        assert_eq!(arg::<String>(&args, 2, "x").unwrap_err().code, ErrorCode::InvalidRequest);
    }
}
