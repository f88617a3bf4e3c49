use crate::method::{Handler, Method, MethodOptions, MethodRegistry, MethodResult};
use crate::service::ServiceInner;
use async_trait::async_trait;
use nxsugar_core::error::ERR_INTERNAL;
use nxsugar_core::{JsonRpcError, Task};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

pub(crate) const SCHEMA: &str = "@schema";
pub(crate) const INFO: &str = "@info";
pub(crate) const PING: &str = "@ping";

/// Register `@schema`, `@info` and `@ping` on `registry`.
pub(crate) fn register(registry: &MethodRegistry, service: Weak<ServiceInner>) {
    let quiet = MethodOptions {
        disable_pull_log: true,
        ..Default::default()
    };
    registry.register(
        SCHEMA,
        Method::new(SchemaHandler {
            service: service.clone(),
        })
        .with_options(quiet),
    );
    registry.register(INFO, Method::new(InfoHandler { service }).with_options(quiet));
    registry.register(PING, Method::new(PingHandler).with_options(quiet));
}

fn service_gone() -> JsonRpcError {
    JsonRpcError::new(ERR_INTERNAL, "service dropped", None)
}

struct SchemaHandler {
    service: Weak<ServiceInner>,
}

#[async_trait]
impl Handler for SchemaHandler {
    async fn call(&self, _task: &mut Task) -> MethodResult {
        let service = self.service.upgrade().ok_or_else(service_gone)?;
        Ok(service.registry.schema())
    }
}

struct InfoHandler {
    service: Weak<ServiceInner>,
}

#[async_trait]
impl Handler for InfoHandler {
    async fn call(&self, _task: &mut Task) -> MethodResult {
        let service = self.service.upgrade().ok_or_else(service_gone)?;
        Ok(info(&service))
    }
}

struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn call(&self, _task: &mut Task) -> MethodResult {
        Ok(json!("pong"))
    }
}

fn info(service: &Arc<ServiceInner>) -> Value {
    let config = service.config.read().clone();
    let mut stats = serde_json::to_value(service.stats.snapshot()).unwrap_or_else(|_| json!({}));
    if let Some(stats) = stats.as_object_mut() {
        stats.insert("threadsMax".to_string(), json!(config.max_threads));
    }
    let uptime = chrono::Utc::now()
        .signed_duration_since(service.started)
        .num_milliseconds() as f64
        / 1000.0;

    json!({
        "name": config.name,
        "description": config.description,
        "version": config.version,
        "path": config.path,
        "testing": config.testing,
        "started": service.started.to_rfc3339(),
        "uptime": uptime,
        "hostname": hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default(),
        "user": std::env::var("USER").unwrap_or_default(),
        "directory": std::env::current_dir()
            .map(|d| d.display().to_string())
            .unwrap_or_default(),
        "pid": std::process::id(),
        "stats": stats,
    })
}
