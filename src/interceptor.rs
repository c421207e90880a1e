//! Request/response/error hook chain, run in registration order (C8, §4.8).

use std::sync::Arc;

use parking_lot::RwLock;

use crate::descriptor::RequestDescriptor;
use crate::error::{factory, ErrorContext, RequestError, Result};
use crate::transport::TransportValue;

/// One interceptor: any subset of the three hooks may be `None` (§4.8).
///
/// `on_request` transforms the outgoing descriptor; `on_response`
/// transforms the settled value; `on_error` may recover from a failure by
/// returning `Ok`, or replace it by returning a different `Err`.
pub struct Interceptor {
    pub name: Option<String>,
    pub on_request: Option<Arc<dyn Fn(RequestDescriptor) -> Result<RequestDescriptor> + Send + Sync>>,
    pub on_response: Option<Arc<dyn Fn(TransportValue, &RequestDescriptor) -> Result<TransportValue> + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(RequestError, &RequestDescriptor) -> Result<TransportValue> + Send + Sync>>,
}

impl Interceptor {
    pub fn new() -> Self {
        Self {
            name: None,
            on_request: None,
            on_response: None,
            on_error: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_request(
        mut self,
        hook: impl Fn(RequestDescriptor) -> Result<RequestDescriptor> + Send + Sync + 'static,
    ) -> Self {
        self.on_request = Some(Arc::new(hook));
        self
    }

    pub fn on_response(
        mut self,
        hook: impl Fn(TransportValue, &RequestDescriptor) -> Result<TransportValue> + Send + Sync + 'static,
    ) -> Self {
        self.on_response = Some(Arc::new(hook));
        self
    }

    pub fn on_error(
        mut self,
        hook: impl Fn(RequestError, &RequestDescriptor) -> Result<TransportValue> + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    fn has_any_hook(&self) -> bool {
        self.on_request.is_some() || self.on_response.is_some() || self.on_error.is_some()
    }
}

impl Default for Interceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InterceptorStats {
    pub count: usize,
    pub request_hooks: usize,
    pub response_hooks: usize,
    pub error_hooks: usize,
}

/// Ordered interceptor pipeline (§4.8).
pub struct InterceptorChain {
    interceptors: RwLock<Vec<Arc<Interceptor>>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self {
            interceptors: RwLock::new(Vec::new()),
        }
    }

    /// Register an interceptor. Rejects one with no hooks bound (§4.8).
    pub fn add(&self, interceptor: Interceptor) -> Result<()> {
        if !interceptor.has_any_hook() {
            return Err(factory::validation(
                "Request interceptor must return a valid config object",
                ErrorContext::new(),
            ));
        }
        self.interceptors.write().push(Arc::new(interceptor));
        Ok(())
    }

    /// Remove every interceptor registered under `name`.
    pub fn remove(&self, name: &str) {
        self.interceptors.write().retain(|i| i.name.as_deref() != Some(name));
    }

    pub fn clear(&self) {
        self.interceptors.write().clear();
    }

    pub fn count(&self) -> usize {
        self.interceptors.read().len()
    }

    pub fn stats(&self) -> InterceptorStats {
        let interceptors = self.interceptors.read();
        InterceptorStats {
            count: interceptors.len(),
            request_hooks: interceptors.iter().filter(|i| i.on_request.is_some()).count(),
            response_hooks: interceptors.iter().filter(|i| i.on_response.is_some()).count(),
            error_hooks: interceptors.iter().filter(|i| i.on_error.is_some()).count(),
        }
    }

    /// Run every `on_request` hook in registration order.
    pub fn run_request(&self, mut descriptor: RequestDescriptor) -> Result<RequestDescriptor> {
        let interceptors = self.interceptors.read().clone();
        for interceptor in interceptors.iter() {
            if let Some(hook) = &interceptor.on_request {
                descriptor = hook(descriptor)?;
            }
        }
        Ok(descriptor)
    }

    /// Run every `on_response` hook in registration order.
    pub fn run_response(&self, mut value: TransportValue, descriptor: &RequestDescriptor) -> Result<TransportValue> {
        let interceptors = self.interceptors.read().clone();
        for interceptor in interceptors.iter() {
            if let Some(hook) = &interceptor.on_response {
                value = hook(value, descriptor)?;
            }
        }
        Ok(value)
    }

    /// Run `on_error` hooks in registration order with recovery semantics:
    /// the first hook that returns `Ok` wins and later hooks are skipped;
    /// a hook that returns `Err` replaces the propagating error for the
    /// next hook (§4.8).
    pub fn run_error(&self, error: RequestError, descriptor: &RequestDescriptor) -> Result<TransportValue> {
        let interceptors = self.interceptors.read().clone();
        let mut current = error;
        for interceptor in interceptors.iter() {
            if let Some(hook) = &interceptor.on_error {
                match hook(current, descriptor) {
                    Ok(value) => return Ok(value),
                    Err(next) => current = next,
                }
            } else {
                // interceptor has no error hook; current error carries through untouched
            }
        }
        Err(current)
    }
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::new()
    }
}
