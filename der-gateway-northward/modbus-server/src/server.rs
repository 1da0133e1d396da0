use crate::{config::ModbusServerConfig, registry::UnitRegistry, service::ModbusRequestService};
use der_gateway_sdk::DriverResult;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Modbus TCP server over a [`UnitRegistry`].
#[derive(Debug)]
pub struct ModbusServer {
    config: ModbusServerConfig,
    registry: Arc<UnitRegistry>,
}

impl ModbusServer {
    /// Create a server whose registry is seeded from `config.units`.
    pub fn new(config: ModbusServerConfig) -> DriverResult<Self> {
        let registry = Arc::new(UnitRegistry::from_config(&config)?);
        Ok(Self::with_registry(config, registry))
    }

    /// Serve an existing registry, e.g. one also updated by southward drivers.
    pub fn with_registry(config: ModbusServerConfig, registry: Arc<UnitRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &ModbusServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    pub fn service(&self) -> ModbusRequestService {
        ModbusRequestService::new(
            Arc::clone(&self.registry),
            self.config.allow_writes,
            self.config.auto_create_units,
        )
        .with_request_throttle(self.config.request_throttle())
    }

    /// Bind the configured address and serve until `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) -> DriverResult<()> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, cancel).await
    }

    /// Serve connections from an already bound listener until `cancel` fires.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> DriverResult<()> {
        let local_addr = listener.local_addr()?;
        info!(
            %local_addr,
            units = ?self.registry.unit_ids(),
            allow_writes = self.config.allow_writes,
            throttle_ms = self.config.request_throttle_ms,
            "Modbus server listening"
        );

        let server = Server::new(listener);
        let service = self.service();
        let on_connected = move |stream, socket_addr: SocketAddr| {
            let service = service.for_connection();
            async move {
                debug!(%socket_addr, "Modbus client connected");
                accept_tcp_connection(stream, socket_addr, move |_socket_addr| {
                    Ok(Some(service.clone()))
                })
            }
        };
        let on_process_error = |err| {
            error!("Modbus server connection error: {err}");
        };

        tokio::select! {
            res = server.serve(&on_connected, on_process_error) => {
                res?;
                Ok(())
            }
            _ = cancel.cancelled() => {
                info!(%local_addr, "Modbus server stopped");
                Ok(())
            }
        }
    }
}
