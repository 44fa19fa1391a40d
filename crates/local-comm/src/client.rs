//! Service caller: the client side of a call.
//!
//! [`ServiceCaller::call`] connects to the service's rendezvous socket,
//! stages the payload in a fresh segment, sends the descriptor and copies the
//! result out of the segment the endpoint names in its response.
//!
//! # Segment ownership
//!
//! The caller destroys both segments involved in a call: the input segment it
//! created, and the output segment the endpoint created and handed over. The
//! input segment is destroyed on every exit path.
//!
//! # Thread Safety
//!
//! A caller holds no connection between calls and no locks. Each call opens
//! its own connection, so sequential reuse is the intended pattern; callers
//! wanting parallel calls should use one caller per task.

use crate::address::socket_path;
use crate::config::CommOptions;
use crate::protocol::{self, with_timeout, Request, Response};
use crate::segment::{Ownership, Segment};
use crate::{LocalCommError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::debug;

/// Client handle for one named service.
#[derive(Debug, Clone)]
pub struct ServiceCaller {
    service: String,
    path: PathBuf,
    options: CommOptions,
}

impl ServiceCaller {
    /// Create a caller for `service` with default options.
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_options(service, CommOptions::default())
    }

    /// Create a caller for `service` with explicit options.
    pub fn with_options(service: impl Into<String>, options: CommOptions) -> Self {
        let service = service.into();
        let path = socket_path(&options.socket_dir, &service);
        Self {
            service,
            path,
            options,
        }
    }

    /// Name of the target service.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Rendezvous socket the caller connects to.
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Send `payload` to the service and return its result bytes.
    ///
    /// `timeout` bounds each send/receive on the control connection; it
    /// does not cover the connect phase, which is governed by the configured
    /// connect timeout.
    ///
    /// # Errors
    ///
    /// - [`LocalCommError::ServiceUnavailable`] if the socket cannot be reached
    ///   before the connect deadline.
    /// - [`LocalCommError::Server`] if the endpoint reported a failure, or
    ///   closed without a well-formed response.
    /// - Any transport error for socket, framing or segment failures.
    pub async fn call(&self, payload: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        // Connect before creating anything so an absent service leaks nothing.
        let mut stream = self.connect().await?;

        let mut input = Segment::create(&self.options.segment_prefix, payload.len())?;
        let result = match input.write(payload) {
            Ok(()) => {
                let request = Request {
                    segment: input.name().to_string(),
                    size: payload.len() as u64,
                };
                self.exchange(&mut stream, &request, timeout).await
            }
            Err(e) => Err(e),
        };
        drop(stream);

        input.close();
        let released = input.destroy();

        let output = result?;
        released?;
        Ok(output)
    }

    async fn connect(&self) -> Result<UnixStream> {
        let deadline = Instant::now() + self.options.connect_timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match UnixStream::connect(&self.path).await {
                Ok(stream) => {
                    debug!(
                        "Connected to service '{}' after {} attempt(s)",
                        self.service, attempts
                    );
                    return Ok(stream);
                }
                Err(e) if is_retryable_connect(&e) => {
                    if Instant::now() >= deadline {
                        debug!(
                            "Giving up on service '{}' after {} attempt(s): {}",
                            self.service, attempts, e
                        );
                        return Err(LocalCommError::ServiceUnavailable {
                            service: self.service.clone(),
                            timeout: self.options.connect_timeout,
                        });
                    }
                    tokio::time::sleep(self.options.retry_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn exchange(
        &self,
        stream: &mut UnixStream,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        with_timeout(timeout, protocol::send(stream, request)).await?;

        let received = with_timeout(timeout, protocol::receive::<_, Response>(stream)).await;
        let response = match received {
            Ok(response) => response,
            Err(
                e @ (LocalCommError::ConnectionClosed | LocalCommError::MalformedMessage { .. }),
            ) => {
                debug!("No usable response from '{}': {}", self.service, e);
                Response::failure(Response::UNKNOWN_ERROR)
            }
            Err(e) => return Err(e),
        };

        match response {
            Response::Failure { message } => Err(LocalCommError::Server {
                service: self.service.clone(),
                message,
            }),
            Response::Success { segment, size } => {
                // The endpoint handed this segment over; destroying it is ours.
                let mut output = Segment::attach(&segment, Ownership::Owner)?;
                let copied = usize::try_from(size)
                    .map_err(|_| LocalCommError::malformed(format!("out_size {} too large", size)))
                    .and_then(|len| output.read(len));
                output.close();
                let released = output.destroy();

                let bytes = copied?;
                released?;
                debug!(
                    "Call to '{}' returned {} bytes via {}",
                    self.service,
                    bytes.len(),
                    segment
                );
                Ok(bytes)
            }
        }
    }
}

/// Connect failures that mean "not accepting yet" rather than a broken path.
///
/// A full listen queue surfaces as `WouldBlock` from a non-blocking connect.
fn is_retryable_connect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> CommOptions {
        CommOptions::new()
            .with_socket_dir(dir.path())
            .with_connect_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_caller_targets_rendezvous_path() {
        let dir = TempDir::new().unwrap();
        let caller = ServiceCaller::with_options("my service", options(&dir));

        assert_eq!(caller.service(), "my service");
        assert_eq!(
            caller.socket_path(),
            dir.path().join("local_comm_my_service.sock")
        );
    }

    #[tokio::test]
    async fn test_call_absent_service_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let caller = ServiceCaller::with_options("nobody", options(&dir));

        let result = caller.call(b"ping", None).await;
        match result {
            Err(LocalCommError::ServiceUnavailable { service, .. }) => {
                assert_eq!(service, "nobody");
            }
            other => panic!("Expected ServiceUnavailable, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_retried_then_unavailable() {
        let dir = TempDir::new().unwrap();
        let caller = ServiceCaller::with_options("stale", options(&dir));

        // A bound-then-dropped listener leaves a socket file nobody accepts on.
        drop(std::os::unix::net::UnixListener::bind(caller.socket_path()).unwrap());

        let result = caller.call(b"ping", None).await;
        assert!(matches!(
            result,
            Err(LocalCommError::ServiceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_peer_closing_without_response_is_unknown_server_error() {
        let dir = TempDir::new().unwrap();
        let caller =
            ServiceCaller::with_options("mute", options(&dir).with_segment_prefix("lcseg_mute_"));
        let listener = tokio::net::UnixListener::bind(caller.socket_path()).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request: Request = protocol::receive(&mut stream).await.unwrap();
            request
        });

        let result = caller.call(b"abc", Some(Duration::from_secs(5))).await;
        match result {
            Err(LocalCommError::Server { message, .. }) => assert_eq!(message, "unknown error"),
            other => panic!("Expected Server error, got: {:?}", other),
        }

        // The input segment was destroyed even though the call failed.
        let request = server.await.unwrap();
        assert_eq!(request.size, 3);
        assert!(matches!(
            Segment::attach(&request.segment, Ownership::Borrower),
            Err(LocalCommError::SegmentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let dir = TempDir::new().unwrap();
        let caller = ServiceCaller::with_options("slow", options(&dir));
        let listener = tokio::net::UnixListener::bind(caller.socket_path()).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let result = caller.call(b"abc", Some(Duration::from_millis(100))).await;
        assert!(matches!(result, Err(LocalCommError::Timeout(_))));
        server.abort();
    }

    #[tokio::test]
    async fn test_full_listen_queue_is_retried_then_unavailable() {
        use nix::sys::socket::{listen, Backlog};

        let dir = TempDir::new().unwrap();
        let caller = ServiceCaller::with_options("busy", options(&dir));

        // Nobody accepts, so pending connects fill the queue.
        let listener = std::os::unix::net::UnixListener::bind(caller.socket_path()).unwrap();
        listen(&listener, Backlog::new(0).unwrap()).unwrap();
        let mut pending = Vec::new();
        loop {
            match UnixStream::connect(caller.socket_path()).await {
                Ok(stream) => pending.push(stream),
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::WouldBlock);
                    break;
                }
            }
            assert!(pending.len() < 64, "listen queue never filled");
        }

        let started = Instant::now();
        let result = caller.call(b"x", None).await;
        assert!(
            matches!(result, Err(LocalCommError::ServiceUnavailable { .. })),
            "Expected ServiceUnavailable, got: {:?}",
            result
        );
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_retryable_connect_kinds() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::ConnectionRefused,
            ErrorKind::WouldBlock,
        ] {
            assert!(is_retryable_connect(&std::io::Error::from(kind)));
        }
        let denied = std::io::Error::from(ErrorKind::PermissionDenied);
        assert!(!is_retryable_connect(&denied));
    }
}
