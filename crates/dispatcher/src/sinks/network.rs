//! NetworkSink - streams records to a TCP collector, optionally over TLS
//!
//! Records are written back to back on one connection; a record never spans
//! two writes of different batches. A broken connection is dropped and
//! re-established on the next batch.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, instrument, warn};

use contracts::{ContractError, DestinationSpec, LogSink, NetworkSpec, TransportSecurity};

/// An established collector connection
enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.write_all(buf).await,
            Connection::Tls(stream) => stream.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.flush().await,
            Connection::Tls(stream) => stream.flush().await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.shutdown().await,
            Connection::Tls(stream) => stream.shutdown().await,
        }
    }
}

/// Sink that sends encoded records to `host:port`
pub struct NetworkSink {
    name: String,
    address: String,
    settings: NetworkSpec,
    /// Trust anchors replacing the platform roots
    roots: Option<RootCertStore>,
    tls: Option<Arc<ClientConfig>>,
    connection: Option<Connection>,
}

impl NetworkSink {
    pub fn new(name: impl Into<String>, address: impl Into<String>, settings: NetworkSpec) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            settings,
            roots: None,
            tls: None,
            connection: None,
        }
    }

    /// Trust only `roots`, for collectors behind a private CA
    pub fn with_root_certificates(mut self, roots: RootCertStore) -> Self {
        self.roots = Some(roots);
        self.tls = None;
        self
    }

    pub fn from_spec(spec: &DestinationSpec) -> Self {
        Self::new(
            &spec.name,
            &spec.target,
            spec.network.clone().unwrap_or_default(),
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Host part of the target address, without IPv6 brackets
    fn host(&self) -> &str {
        let host = self
            .address
            .rsplit_once(':')
            .map_or(self.address.as_str(), |(host, _)| host);
        host.trim_start_matches('[').trim_end_matches(']')
    }

    fn tls_config(&mut self) -> Result<Arc<ClientConfig>, ContractError> {
        if let Some(config) = &self.tls {
            return Ok(Arc::clone(config));
        }

        let roots = match self.roots.clone() {
            Some(roots) => roots,
            None => self.native_roots()?,
        };
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ContractError::sink_fatal(&self.name, e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let config = Arc::new(config);
        self.tls = Some(Arc::clone(&config));
        Ok(config)
    }

    fn native_roots(&self) -> Result<RootCertStore, ContractError> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            debug!(sink = %self.name, error = %err, "Skipping unreadable native certificate");
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        if added == 0 {
            return Err(ContractError::sink_fatal(
                &self.name,
                "no trusted root certificates available",
            ));
        }
        debug!(sink = %self.name, added, ignored, "Loaded native root certificates");
        Ok(roots)
    }

    async fn connect(&mut self) -> Result<Connection, ContractError> {
        let connect_timeout = Duration::from_millis(self.settings.connect_timeout_ms);
        let stream = match timeout(connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ContractError::sink_transient(
                    &self.name,
                    format!("connect to {} failed: {e}", self.address),
                ));
            }
            Err(_) => {
                return Err(ContractError::sink_transient(
                    &self.name,
                    format!("connect to {} timed out", self.address),
                ));
            }
        };
        // records are already batched
        let _ = stream.set_nodelay(true);

        match self.settings.transport_security {
            TransportSecurity::Plain => Ok(Connection::Plain(stream)),
            TransportSecurity::Tls => {
                let config = self.tls_config()?;
                let server = self
                    .settings
                    .server_name
                    .clone()
                    .unwrap_or_else(|| self.host().to_string());
                let server_name = ServerName::try_from(server.clone()).map_err(|e| {
                    ContractError::sink_fatal(&self.name, format!("invalid server name '{server}': {e}"))
                })?;

                let handshake = TlsConnector::from(config).connect(server_name, stream);
                match timeout(connect_timeout, handshake).await {
                    Ok(Ok(tls)) => Ok(Connection::Tls(Box::new(tls))),
                    Ok(Err(e)) => Err(classify_handshake_error(&self.name, &e)),
                    Err(_) => Err(ContractError::sink_transient(
                        &self.name,
                        "TLS handshake timed out",
                    )),
                }
            }
        }
    }

    async fn send(&mut self, batch: &[Vec<u8>]) -> Result<(), ContractError> {
        let write_timeout = Duration::from_millis(self.settings.write_timeout_ms);
        let frame_size = self.settings.batch_size.max(1);
        let name = self.name.clone();
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| ContractError::sink_transient(&name, "not connected"))?;

        for chunk in batch.chunks(frame_size) {
            let mut buf = Vec::with_capacity(chunk.iter().map(Vec::len).sum());
            for record in chunk {
                buf.extend_from_slice(record);
            }
            let write = async {
                connection.write_all(&buf).await?;
                connection.flush().await
            };
            match timeout(write_timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(ContractError::sink_transient(&name, e.to_string())),
                Err(_) => return Err(ContractError::sink_transient(&name, "write timed out")),
            }
        }
        Ok(())
    }
}

/// Certificate problems will not go away by retrying
fn classify_handshake_error(sink_name: &str, err: &std::io::Error) -> ContractError {
    let rustls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match rustls_error {
        Some(rustls::Error::InvalidCertificate(reason)) => ContractError::sink_fatal(
            sink_name,
            format!("TLS certificate rejected: {reason:?}"),
        ),
        _ => ContractError::sink_transient(sink_name, format!("TLS handshake failed: {err}")),
    }
}

impl LogSink for NetworkSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "network_sink_open", skip(self), fields(sink = %self.name, addr = %self.address))]
    async fn open(&mut self) -> Result<(), ContractError> {
        let connection = self.connect().await?;
        self.connection = Some(connection);
        debug!(
            sink = %self.name,
            target = %self.address,
            tls = matches!(self.settings.transport_security, TransportSecurity::Tls),
            "NetworkSink connected"
        );
        Ok(())
    }

    #[instrument(
        name = "network_sink_write",
        skip(self, batch),
        fields(sink = %self.name, records = batch.len())
    )]
    async fn write_batch(&mut self, batch: &[Vec<u8>]) -> Result<(), ContractError> {
        if self.connection.is_none() {
            self.open().await?;
        }
        let result = self.send(batch).await;
        if let Err(e) = &result {
            warn!(sink = %self.name, error = %e, "Dropping broken connection");
            self.connection = None;
        }
        result
    }

    async fn flush(&mut self) -> Result<(), ContractError> {
        if let Some(connection) = self.connection.as_mut() {
            connection
                .flush()
                .await
                .map_err(|e| ContractError::sink_transient(&self.name, e.to_string()))?;
        }
        Ok(())
    }

    #[instrument(name = "network_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), ContractError> {
        if let Some(mut connection) = self.connection.take() {
            // peer may already be gone
            let _ = connection.flush().await;
            let _ = connection.shutdown().await;
        }
        debug!(sink = %self.name, "NetworkSink closed");
        Ok(())
    }
}
