//! Thin outer façade (A3, §6) satisfying the construction and forwarding
//! contract.
//!
//! Deliberately minimal: convenience wrappers (typed verb helpers, upload/
//! download, pagination walkers) stay out of scope (spec.md §1) — this is
//! only the management surface the external caller-facing binder needs.

use std::sync::Arc;

use crate::cache::{CacheConfig, CacheStats};
use crate::config::GlobalConfig;
use crate::descriptor::RequestDescriptor;
use crate::error::{factory, ErrorContext, Result};
use crate::interceptor::Interceptor;
use crate::pipeline::{PipelineStats, RequestPipeline};
use crate::transport::Transport;

/// Caller-facing entry point. Built either from a [`Transport`] (in which
/// case it constructs its own [`RequestPipeline`]) or from a pre-built
/// pipeline — exactly one of the two must be supplied (§6).
pub struct Client {
    pipeline: Arc<RequestPipeline>,
}

/// Builder mirroring the source's duck-typed constructor: accepts either a
/// `requestor` (transport) or a `requestCore` (pipeline) option, and fails
/// construction if neither is given (§6).
#[derive(Default)]
pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    pipeline: Option<Arc<RequestPipeline>>,
    global: GlobalConfig,
    cache_config: Option<CacheConfig>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<RequestPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn global_config(mut self, global: GlobalConfig) -> Self {
        self.global = global;
        self
    }

    pub fn cache_config(mut self, cache_config: CacheConfig) -> Self {
        self.cache_config = Some(cache_config);
        self
    }

    pub fn build(self) -> Result<Client> {
        if let Some(pipeline) = self.pipeline {
            return Ok(Client { pipeline });
        }
        if let Some(transport) = self.transport {
            let pipeline = Arc::new(RequestPipeline::with_cache(transport, self.global, self.cache_config));
            return Ok(Client { pipeline });
        }
        Err(factory::validation(
            "Must provide either requestor or requestCore option",
            ErrorContext::new(),
        ))
    }
}

impl Client {
    pub fn new_with_transport(transport: Arc<dyn Transport>, global: GlobalConfig) -> Self {
        ClientBuilder::new()
            .transport(transport)
            .global_config(global)
            .build()
            .expect("transport is always provided")
    }

    pub fn new_with_pipeline(pipeline: Arc<RequestPipeline>) -> Self {
        ClientBuilder::new().pipeline(pipeline).build().expect("pipeline is always provided")
    }

    pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<crate::transport::TransportValue> {
        self.pipeline.execute(descriptor).await
    }

    pub fn set_global_config(&self, global: GlobalConfig) {
        self.pipeline.set_global_config(global);
    }

    pub fn add_interceptor(&self, interceptor: Interceptor) -> Result<()> {
        self.pipeline.add_interceptor(interceptor)
    }

    pub fn clear_interceptors(&self) {
        self.pipeline.clear_interceptors();
    }

    pub fn clear_cache(&self, key: Option<&str>) {
        self.pipeline.clear_cache(key);
    }

    pub fn get_cache_stats(&self) -> Option<CacheStats> {
        self.pipeline.cache_stats()
    }

    pub fn get_all_stats(&self) -> PipelineStats {
        self.pipeline.all_stats()
    }

    pub fn destroy(&self) {
        self.pipeline.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_without_transport_or_pipeline_fails() {
        let err = ClientBuilder::new().build().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
        assert!(err.message.contains("requestor"));
    }

    #[tokio::test]
    async fn build_with_transport_constructs_a_working_client() {
        use crate::descriptor::{Method, RequestDescriptor};
        use crate::transport::{MockTransport, TransportValue};

        let transport = MockTransport::new();
        transport.add_response("GET", "/x", Ok(TransportValue::Text("ok".to_string())));

        let client = ClientBuilder::new()
            .transport(Arc::new(transport))
            .build()
            .unwrap();

        let result = client
            .execute(RequestDescriptor::new("/x", Method::Get))
            .await
            .unwrap();
        assert_eq!(result, TransportValue::Text("ok".to_string()));
    }
}
