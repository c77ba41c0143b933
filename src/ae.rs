//! Application entity module
//!
//! An [`ApplicationEntity`] bundles the identity and configuration
//! of one DICOM node:
//! its AE title, the presentation contexts it requests or supports,
//! its timeouts and its maximum PDU length.
//! From it, outbound associations are initiated with
//! [`associate`](ApplicationEntity::associate)
//! and an acceptor loop is started with
//! [`serve`](ApplicationEntity::serve),
//! which runs one independent [`Association`] per inbound connection.

use snafu::{ResultExt, Snafu};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::association::client::ClientAssociationOptions;
use crate::association::server::ServerAssociationOptions;
use crate::association::Association;
use crate::config::NetworkOptions;
use crate::dimse::service::ServiceHandlers;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to bind the server socket
    Bind { source: std::io::Error },

    /// failed to query the bound socket address
    LocalAddr { source: std::io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The identity and configuration of a DICOM application entity.
///
/// Cloning is cheap enough for the common pattern of
/// deriving per-connection options;
/// each association takes a snapshot of the configuration,
/// so later mutation does not affect live associations.
#[derive(Debug, Clone)]
pub struct ApplicationEntity {
    ae_title: String,
    /// presentation contexts proposed on outbound associations
    requested_contexts: Vec<(String, Vec<String>)>,
    /// abstract syntaxes admitted on inbound associations
    supported_abstract_syntaxes: Vec<String>,
    /// transfer syntaxes admitted on inbound associations
    supported_transfer_syntaxes: Vec<String>,
    max_pdu_length: u32,
    acse_timeout: Duration,
    dimse_timeout: Option<Duration>,
    network_timeout: Option<Duration>,
    network_options: NetworkOptions,
}

impl ApplicationEntity {
    /// Create an application entity with the given AE title.
    pub fn new(ae_title: impl Into<String>) -> Self {
        ApplicationEntity {
            ae_title: ae_title.into(),
            requested_contexts: Vec::new(),
            supported_abstract_syntaxes: Vec::new(),
            supported_transfer_syntaxes: Vec::new(),
            max_pdu_length: crate::pdu::DEFAULT_MAX_PDU,
            acse_timeout: crate::association::client::DEFAULT_ACSE_TIMEOUT,
            dimse_timeout: None,
            network_timeout: Some(crate::association::client::DEFAULT_NETWORK_TIMEOUT),
            network_options: NetworkOptions::default(),
        }
    }

    /// The AE title of this application entity.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// Request this presentation context on outbound associations.
    pub fn with_requested_context(
        mut self,
        abstract_syntax_uid: impl Into<String>,
        transfer_syntax_uids: Vec<String>,
    ) -> Self {
        self.requested_contexts
            .push((abstract_syntax_uid.into(), transfer_syntax_uids));
        self
    }

    /// Support this abstract syntax on inbound associations.
    pub fn with_supported_abstract_syntax(mut self, abstract_syntax_uid: impl Into<String>) -> Self {
        self.supported_abstract_syntaxes
            .push(abstract_syntax_uid.into());
        self
    }

    /// Admit this transfer syntax on inbound associations.
    pub fn with_supported_transfer_syntax(mut self, transfer_syntax_uid: impl Into<String>) -> Self {
        self.supported_transfer_syntaxes
            .push(transfer_syntax_uid.into());
        self
    }

    /// Override the maximum PDU length this node advertises.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override the ACSE timeout.
    pub fn acse_timeout(mut self, timeout: Duration) -> Self {
        self.acse_timeout = timeout;
        self
    }

    /// Set the DIMSE timeout.
    pub fn dimse_timeout(mut self, timeout: Duration) -> Self {
        self.dimse_timeout = Some(timeout);
        self
    }

    /// Override the network timeout.
    pub fn network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }

    /// Replace the process-wide service options
    /// snapshotted by each association.
    pub fn network_options(mut self, options: NetworkOptions) -> Self {
        self.network_options = options;
        self
    }

    fn client_options(&self) -> ClientAssociationOptions {
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.ae_title.clone())
            .max_pdu_length(self.max_pdu_length)
            .acse_timeout(self.acse_timeout)
            .network_options(self.network_options.clone());
        for (abstract_syntax, transfer_syntaxes) in &self.requested_contexts {
            options = options
                .with_presentation_context(abstract_syntax.clone(), transfer_syntaxes.clone());
        }
        if let Some(timeout) = self.dimse_timeout {
            options = options.dimse_timeout(timeout);
        }
        if let Some(timeout) = self.network_timeout {
            options = options.network_timeout(timeout);
        }
        options
    }

    fn server_options(&self) -> ServerAssociationOptions<'static, crate::association::server::AcceptAny> {
        let mut options = ServerAssociationOptions::new()
            .ae_title(self.ae_title.clone())
            .max_pdu_length(self.max_pdu_length)
            .acse_timeout(self.acse_timeout)
            .network_options(self.network_options.clone());
        for abstract_syntax in &self.supported_abstract_syntaxes {
            options = options.with_abstract_syntax(abstract_syntax.clone());
        }
        for transfer_syntax in &self.supported_transfer_syntaxes {
            options = options.with_transfer_syntax(transfer_syntax.clone());
        }
        if let Some(timeout) = self.dimse_timeout {
            options = options.dimse_timeout(timeout);
        }
        if let Some(timeout) = self.network_timeout {
            options = options.network_timeout(timeout);
        }
        options
    }

    /// Request an association with the node at the given address,
    /// proposing the requested presentation contexts.
    ///
    /// Blocks until the association is established,
    /// rejected or failed.
    pub fn associate<A: ToSocketAddrs>(
        &self,
        address: A,
    ) -> Result<Association, crate::association::Error> {
        self.client_options().establish(address)
    }

    /// Request an association with the node at the given
    /// `AETITLE@host:port` address.
    pub fn associate_with(
        &self,
        ae_address: &str,
    ) -> Result<Association, crate::association::Error> {
        self.client_options().establish_with(ae_address)
    }

    /// Bind a TCP listener on the given address
    /// and serve inbound associations,
    /// one independent worker thread per connection.
    ///
    /// The handler factory is invoked once per association,
    /// so each connection gets its own handler table.
    /// The returned [`ServerHandle`] stops the listener
    /// and drains in-flight associations on
    /// [`shutdown`](ServerHandle::shutdown).
    pub fn serve<A, F>(&self, bind_address: A, handler_factory: F) -> Result<ServerHandle>
    where
        A: ToSocketAddrs,
        F: Fn() -> ServiceHandlers + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(bind_address).context(BindSnafu)?;
        let local_addr = listener.local_addr().context(LocalAddrSnafu)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let workers: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let options = self.server_options();
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_workers = Arc::clone(&workers);
        let accept = std::thread::spawn(move || {
            tracing::info!("listening for associations on {}", local_addr);
            loop {
                let (stream, peer_addr) = match listener.accept() {
                    Ok(connection) => connection,
                    Err(e) => {
                        if accept_shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::warn!("failed to accept connection: {}", e);
                        continue;
                    }
                };
                if accept_shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let options = options.clone();
                let handlers = handler_factory();
                let worker = std::thread::spawn(move || {
                    serve_connection(options, stream, handlers, peer_addr)
                });
                accept_workers
                    .lock()
                    .expect("worker registry poisoned")
                    .push(worker);
            }
            tracing::debug!("association listener on {} stopped", local_addr);
        });

        Ok(ServerHandle {
            local_addr,
            shutdown,
            accept: Some(accept),
            workers,
        })
    }
}

fn serve_connection(
    options: ServerAssociationOptions<'static, crate::association::server::AcceptAny>,
    stream: TcpStream,
    handlers: ServiceHandlers,
    peer_addr: std::net::SocketAddr,
) {
    match options.establish(stream) {
        Ok(mut association) => {
            association.set_handlers(handlers);
            if let Err(e) = association.serve() {
                tracing::warn!("association with {} ended with error: {}", peer_addr, e);
            }
        }
        Err(e) => {
            tracing::debug!("could not establish association with {}: {}", peer_addr, e);
        }
    }
}

/// A handle over a running association listener.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: std::net::SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept: Option<std::thread::JoinHandle<()>>,
    workers: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>>,
}

impl ServerHandle {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections
    /// and wait for in-flight associations to finish.
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // unblock the accept loop with a no-op connection
        let _ = TcpStream::connect(self.local_addr);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
        let workers = std::mem::take(
            &mut *self.workers.lock().expect("worker registry poisoned"),
        );
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.accept.is_some() {
            self.shutdown_impl();
        }
    }
}
