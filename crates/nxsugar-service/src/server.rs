use crate::config::{ServerConfig, ServiceConfig};
use crate::error::{Result, ServiceError};
use crate::service::Service;
use nxsugar_core::Connector;
use parking_lot::Mutex;
use tracing::{error, info};

/// Several services sharing one broker connection.
pub struct Server {
    defaults: ServiceConfig,
    services: Mutex<Vec<Service>>,
}

impl Server {
    /// Services added later start from `defaults`.
    pub fn new(defaults: ServiceConfig) -> Self {
        Server {
            defaults,
            services: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.defaults())
    }

    /// Add a service on `path` configured with the server defaults.
    pub fn add_service(&self, name: &str, path: &str) -> Service {
        let mut config = self.defaults.clone();
        config.name = name.to_string();
        config.path = path.to_string();
        self.add_configured_service(config)
    }

    pub fn add_configured_service(&self, config: ServiceConfig) -> Service {
        let service = Service::new(config);
        self.services.lock().push(service.clone());
        service
    }

    pub fn services(&self) -> Vec<Service> {
        self.services.lock().clone()
    }

    /// Connect once and serve every service over that connection.
    ///
    /// Returns after all services stopped, with the first error any of them reported.
    pub async fn serve(&self, connector: &dyn Connector) -> Result<()> {
        let services = self.services();
        if services.is_empty() {
            return Err(ServiceError::NoServices);
        }

        let url = connector.url();
        let conn = connector
            .connect()
            .await
            .map_err(|source| ServiceError::Connect { url: url.clone(), source })?;
        info!("Connected to nexus server at {} ({} services)", url, services.len());

        let runs = services.into_iter().map(|service| {
            let conn = conn.clone();
            tokio::spawn(async move { service.serve_conn(conn).await })
        });

        let mut outcome = Ok(());
        for joined in futures::future::join_all(runs).await {
            let res = match joined {
                Ok(res) => res,
                Err(e) => {
                    error!("service run aborted: {}", e);
                    continue;
                }
            };
            if outcome.is_ok() {
                outcome = res;
            }
        }
        conn.close().await;
        outcome
    }

    pub fn graceful_stop(&self) {
        for service in self.services() {
            service.graceful_stop();
        }
    }

    pub fn stop(&self) {
        for service in self.services() {
            service.stop();
        }
    }
}
