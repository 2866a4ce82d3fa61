//! Gateway methods callable by the host over the bridge

use std::collections::HashMap;
use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use super::frame::ResponseFrame;

/// Context passed to every method handler
#[derive(Debug, Clone)]
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub args: Value,
    /// Connection the request arrived on
    pub client_id: String,
}

/// The result a method handler produces
pub type MethodResult = Result<Value, String>;

/// A boxed async method handler
pub type HandlerFn = Box<dyn Fn(MethodContext) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Name → handler table
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.method_names())
            .finish()
    }
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a boxed handler, replacing any previous one
    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        let method = method.into();
        if self.handlers.insert(method.clone(), handler).is_some() {
            tracing::debug!(method, "bridge method handler replaced");
        }
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(MethodContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.register(method, Box::new(move |ctx| handler(ctx).boxed()));
    }

    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler for `ctx.method` and build the matching response
    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let request_id = ctx.request_id.clone();
        let method = ctx.method.clone();
        let client_id = ctx.client_id.clone();

        let Some(handler) = self.handlers.get(&method) else {
            tracing::warn!(method, client_id = %client_id, "unknown bridge method");
            return ResponseFrame::err(request_id, format!("unknown method: {method}"));
        };

        tracing::debug!(method, request_id = %request_id, client_id = %client_id, "dispatching bridge method");
        match handler(ctx).await {
            Ok(result) => ResponseFrame::ok(request_id, result),
            Err(error) => {
                tracing::warn!(method, request_id = %request_id, error = %error, "bridge method failed");
                ResponseFrame::err(request_id, error)
            }
        }
    }
}

/// Pull a required string argument out of `args`
///
/// # Errors
///
/// Returns a message naming the missing field
pub fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, String> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing string argument: {field}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx(method: &str, args: Value) -> MethodContext {
        MethodContext {
            request_id: "req-1".into(),
            method: method.into(),
            args,
            client_id: "bridge-conn-1".into(),
        }
    }

    #[tokio::test]
    async fn dispatches_registered_method() {
        let mut registry = MethodRegistry::new();
        registry.register_fn("echo", |ctx| async move { Ok(ctx.args) });

        let response = registry.dispatch(ctx("echo", json!({"a": 1}))).await;
        assert_eq!(response, ResponseFrame::ok("req-1", json!({"a": 1})));
    }

    #[tokio::test]
    async fn unknown_method_is_an_error_response() {
        let registry = MethodRegistry::new();
        let response = registry.dispatch(ctx("nope", Value::Null)).await;
        assert_eq!(response, ResponseFrame::err("req-1", "unknown method: nope"));
    }

    #[tokio::test]
    async fn handler_error_is_forwarded() {
        let mut registry = MethodRegistry::new();
        registry.register_fn("fail", |_| async { Err("bad input".to_string()) });

        let response = registry.dispatch(ctx("fail", Value::Null)).await;
        assert_eq!(response.outcome, Err("bad input".to_string()));
    }

    #[test]
    fn required_str_reports_field() {
        let args = json!({"lane": "cron", "max": 2});
        assert_eq!(required_str(&args, "lane"), Ok("cron"));
        assert_eq!(
            required_str(&args, "max"),
            Err("missing string argument: max".to_string())
        );
    }

    #[test]
    fn method_names_sorted() {
        let mut registry = MethodRegistry::new();
        registry.register_fn("lanes.status", |_| async { Ok(Value::Null) });
        registry.register_fn("cron.list", |_| async { Ok(Value::Null) });
        assert_eq!(registry.method_names(), vec!["cron.list", "lanes.status"]);
        assert!(registry.contains("cron.list"));
    }
}
