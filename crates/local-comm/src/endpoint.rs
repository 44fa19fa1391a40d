//! Endpoint: named services and the request loop that serves them.
//!
//! Each [`Endpoint::register`] binds a Unix listener at the service's
//! rendezvous path. [`Endpoint::run`] then waits for readiness across every
//! listener, accepts one connection from a ready one, and handles it to
//! completion before waiting again.
//!
//! # Concurrency
//!
//! Exactly one request is in flight per endpoint, across all services. The
//! callback runs on tokio's blocking pool, but the loop awaits it before
//! accepting anything else, so a slow callback stalls every service of the
//! endpoint. Listeners are polled round-robin so a busy service cannot starve
//! the others.
//!
//! # Segment ownership
//!
//! The endpoint only borrows the caller's input segment (close, never
//! destroy). It creates the output segment and hands ownership to the caller
//! once the response has been written; if the response cannot be written the
//! endpoint still owns the segment and destroys it.

use crate::address::{remove_stale_socket, socket_path};
use crate::cancel::CancellationToken;
use crate::client::ServiceCaller;
use crate::config::CommOptions;
use crate::protocol::{self, with_timeout, Request, Response};
use crate::segment::{Ownership, Segment};
use crate::{LocalCommError, Result};
use futures::future::select_all;
use nix::sys::socket::{listen, Backlog};
use std::fmt::Display;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Response text for requests that are not well-formed `process` requests.
pub const ERR_BAD_REQUEST: &str = "bad request";
/// Response text when the named input segment cannot be attached.
pub const ERR_INPUT_NOT_FOUND: &str = "input shm not found";

/// Outcome of an application callback; the error text is sent to the caller.
pub type CallbackResult = std::result::Result<Vec<u8>, String>;

type Callback = Arc<dyn Fn(&[u8]) -> CallbackResult + Send + Sync>;

/// Rendezvous socket file, removed when dropped.
///
/// Removal only happens while the path still names the file this endpoint
/// bound. Another endpoint that re-registered the same name keeps its socket.
#[derive(Debug)]
struct SocketFile {
    path: PathBuf,
    identity: (u64, u64),
}

impl SocketFile {
    fn new(path: PathBuf) -> std::io::Result<Self> {
        let identity = file_identity(&path)?;
        Ok(Self { path, identity })
    }

    fn is_ours(&self) -> bool {
        file_identity(&self.path).is_ok_and(|identity| identity == self.identity)
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if !self.is_ours() {
            debug!("Socket {} was replaced, leaving it", self.path.display());
            return;
        }
        match remove_stale_socket(&self.path) {
            Ok(()) => debug!("Removed socket {}", self.path.display()),
            Err(e) => warn!("Failed to remove socket {}: {}", self.path.display(), e),
        }
    }
}

fn file_identity(path: &Path) -> std::io::Result<(u64, u64)> {
    let meta = std::fs::symlink_metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

/// A bound but not yet served service.
struct Registration {
    name: String,
    // Field order matters: the listener closes before the file is unlinked.
    listener: StdUnixListener,
    socket: SocketFile,
    callback: Callback,
}

impl Registration {
    fn activate(self) -> Result<ActiveService> {
        Ok(ActiveService {
            name: self.name,
            listener: UnixListener::from_std(self.listener)?,
            _socket: self.socket,
            callback: self.callback,
        })
    }
}

/// A service inside a running loop.
struct ActiveService {
    name: String,
    listener: UnixListener,
    _socket: SocketFile,
    callback: Callback,
}

/// Process-scoped registry of services.
///
/// Independent endpoints in one process do not share state; two endpoints
/// can only conflict by registering the same rendezvous path.
pub struct Endpoint {
    options: CommOptions,
    registrations: Vec<Registration>,
    shutdown: CancellationToken,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint {
    /// Create an empty endpoint with default options.
    pub fn new() -> Self {
        Self::with_options(CommOptions::default())
    }

    /// Create an empty endpoint with explicit options.
    pub fn with_options(options: CommOptions) -> Self {
        Self {
            options,
            registrations: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Options shared with callers created by this endpoint.
    pub fn options(&self) -> &CommOptions {
        &self.options
    }

    /// Create a caller for `service` using this endpoint's options.
    pub fn create_service_caller(&self, service: impl Into<String>) -> ServiceCaller {
        ServiceCaller::with_options(service, self.options.clone())
    }

    /// Names of the currently registered services, in registration order.
    pub fn service_names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    /// Token that stops [`Endpoint::run`] within one poll interval.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register `callback` under `name` and start listening for it.
    ///
    /// Any leftover socket file at the rendezvous path is removed first.
    ///
    /// # Errors
    ///
    /// [`LocalCommError::Registration`] if the name is empty, already
    /// registered, or maps onto the same path as an existing registration.
    /// I/O errors if the socket cannot be bound.
    pub fn register<F, E>(&mut self, name: impl Into<String>, callback: F) -> Result<()>
    where
        F: Fn(&[u8]) -> std::result::Result<Vec<u8>, E> + Send + Sync + 'static,
        E: Display,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(LocalCommError::registration("service name must not be empty"));
        }
        if self.registrations.iter().any(|r| r.name == name) {
            return Err(LocalCommError::registration(format!(
                "service '{}' already exists",
                name
            )));
        }

        let path = socket_path(&self.options.socket_dir, &name);
        if let Some(existing) = self.registrations.iter().find(|r| r.socket.path == path) {
            return Err(LocalCommError::registration(format!(
                "service '{}' maps to the same address as '{}'",
                name, existing.name
            )));
        }

        std::fs::create_dir_all(&self.options.socket_dir)?;
        remove_stale_socket(&path)?;
        let listener = StdUnixListener::bind(&path)?;
        let socket = match SocketFile::new(path.clone()) {
            Ok(socket) => socket,
            Err(e) => {
                drop(listener);
                remove_stale_socket(&path)?;
                return Err(e.into());
            }
        };
        self.configure(&listener, &socket.path)?;

        info!("Registered service '{}' at {}", name, socket.path.display());

        let callback: Callback =
            Arc::new(move |input: &[u8]| callback(input).map_err(|e| e.to_string()));
        self.registrations.push(Registration {
            name,
            listener,
            socket,
            callback,
        });
        Ok(())
    }

    fn configure(&self, listener: &StdUnixListener, path: &Path) -> Result<()> {
        // std listens with its own default backlog; listening again applies ours.
        let backlog = Backlog::new(self.options.listen_backlog).map_err(std::io::Error::from)?;
        listen(listener, backlog).map_err(std::io::Error::from)?;
        listener.set_nonblocking(true)?;

        if let Some(mode) = self.options.socket_mode {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    /// Serve all registered services until interrupted.
    ///
    /// Stops when the shutdown token is cancelled or, if enabled in the
    /// options, on Ctrl+C. On exit every listener is closed, every socket
    /// file removed and the registry cleared; register again before the
    /// next `run`.
    ///
    /// # Errors
    ///
    /// [`LocalCommError::Registration`] if nothing is registered. Failures of
    /// individual requests are logged and never end the loop.
    pub async fn run(&mut self) -> Result<()> {
        if self.registrations.is_empty() {
            return Err(LocalCommError::registration(
                "no services registered; call register(...) first",
            ));
        }

        let registrations = std::mem::take(&mut self.registrations);
        let mut services = Vec::with_capacity(registrations.len());
        for registration in registrations {
            services.push(registration.activate()?);
        }

        let interrupt = self
            .options
            .interrupt_on_ctrl_c
            .then(|| spawn_interrupt_watch(self.shutdown.clone()));

        info!(
            "Endpoint serving {} service(s): {}",
            services.len(),
            services
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.serve(&services).await;

        if let Some(task) = interrupt {
            task.abort();
        }
        for service in services {
            info!("Closing service '{}'", service.name);
        }
        self.shutdown.reset();
        Ok(())
    }

    async fn serve(&self, services: &[ActiveService]) {
        let mut next = 0usize;

        while !self.shutdown.is_cancelled() {
            let start = next;
            let accepts = (0..services.len()).map(move |offset| {
                let index = (start + offset) % services.len();
                Box::pin(async move { (index, services[index].listener.accept().await) })
            });

            let ((index, accepted), _, _) =
                match tokio::time::timeout(self.options.poll_interval, select_all(accepts)).await {
                    Ok(ready) => ready,
                    Err(_) => continue,
                };
            next = (index + 1) % services.len();

            let service = &services[index];
            match accepted {
                Ok((stream, _)) => self.handle_connection(service, stream).await,
                Err(e) => {
                    error!("Accept failed on service '{}': {}", service.name, e);
                    tokio::time::sleep(self.options.retry_interval).await;
                }
            }
        }

        info!("Endpoint shutting down");
    }

    async fn handle_connection(&self, service: &ActiveService, mut stream: UnixStream) {
        debug!("Connection on service '{}'", service.name);
        if let Err(e) = self.process_request(service, &mut stream).await {
            warn!("Request on service '{}' failed: {}", service.name, e);
        }
        // The connection closes here whatever the outcome.
    }

    async fn process_request(
        &self,
        service: &ActiveService,
        stream: &mut UnixStream,
    ) -> Result<()> {
        let io_timeout = self.options.server_io_timeout;

        let received = with_timeout(io_timeout, protocol::receive::<_, Request>(stream)).await;
        let request = match received {
            Ok(request) => request,
            Err(e @ LocalCommError::MalformedMessage { .. }) => {
                self.reply(stream, &Response::failure(ERR_BAD_REQUEST)).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let input = match Segment::attach(&request.segment, Ownership::Borrower) {
            Ok(segment) => segment,
            Err(e) => {
                self.reply(stream, &Response::failure(ERR_INPUT_NOT_FOUND)).await?;
                return Err(e);
            }
        };
        let input_bytes = match copy_out(input, request.size) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.reply(stream, &Response::failure(ERR_BAD_REQUEST)).await?;
                return Err(e);
            }
        };

        let output_bytes = match invoke(service.callback.clone(), input_bytes).await {
            Ok(bytes) => bytes,
            Err(message) => {
                warn!("Callback for service '{}' failed: {}", service.name, message);
                let response = Response::failure(format!("callback error: {}", message));
                return self.reply(stream, &response).await;
            }
        };

        let mut output = match Segment::create(&self.options.segment_prefix, output_bytes.len())
            .and_then(|mut segment| segment.write(&output_bytes).map(|_| segment))
        {
            Ok(segment) => segment,
            Err(e) => {
                let response = Response::failure(format!("output shm error: {}", e));
                self.reply(stream, &response).await?;
                return Err(e);
            }
        };

        let response = Response::Success {
            segment: output.name().to_string(),
            size: output_bytes.len() as u64,
        };
        // If this fails, `output` still owns the block and destroys it on drop.
        self.reply(stream, &response).await?;

        output.release_ownership();
        output.close();
        debug!(
            "Service '{}' answered {} bytes via {}",
            service.name,
            output_bytes.len(),
            output.name()
        );
        Ok(())
    }

    async fn reply(&self, stream: &mut UnixStream, response: &Response) -> Result<()> {
        with_timeout(self.options.server_io_timeout, protocol::send(stream, response)).await
    }
}

/// Copy `size` bytes out of a borrowed input segment, then close it.
fn copy_out(mut input: Segment, size: u64) -> Result<Vec<u8>> {
    let copied = usize::try_from(size)
        .map_err(|_| LocalCommError::malformed(format!("size {} too large", size)))
        .and_then(|len| input.read(len));
    input.close();
    copied
}

async fn invoke(callback: Callback, input: Vec<u8>) -> CallbackResult {
    match tokio::task::spawn_blocking(move || callback(&input)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err("callback panicked".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn spawn_interrupt_watch(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping endpoint");
                token.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl+C: {}", e),
        }
    })
}
