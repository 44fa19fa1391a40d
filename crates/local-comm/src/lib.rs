//! local-comm - zero-copy RPC between processes on one machine.
//!
//! A small Unix-socket control channel coordinates a handoff through named
//! POSIX shared memory segments, so payload bytes never pass through the
//! socket. Each connection carries exactly one request and one response.
//!
//! # Example
//!
//! ```rust,no_run
//! use local_comm::{Endpoint, ServiceCaller};
//!
//! #[tokio::main]
//! async fn main() -> local_comm::Result<()> {
//!     // Server process
//!     let mut endpoint = Endpoint::new();
//!     endpoint.register("example", |_input: &[u8]| {
//!         Ok::<_, String>(b"chris".to_vec())
//!     })?;
//!     tokio::spawn(async move { endpoint.run().await });
//!
//!     // Client process
//!     let caller = ServiceCaller::new("example");
//!     let reply = caller.call(b"hello, whats your name?", None).await?;
//!     assert_eq!(reply, b"chris");
//!     Ok(())
//! }
//! ```
//!
//! # Protocol
//!
//! 1. The caller connects to `<socket_dir>/local_comm_<name>.sock`, retrying
//!    until its connect timeout.
//! 2. It copies the payload into a fresh segment and sends
//!    `{"op":"process","shm":<name>,"size":<n>}`.
//! 3. The endpoint copies the input out, closes its mapping, runs the
//!    callback, writes the result into a new segment and answers
//!    `{"ok":true,"out_shm":<name>,"out_size":<n>}` (or
//!    `{"ok":false,"err":<text>}`).
//! 4. The caller copies the result out and destroys both segments.
//!
//! Linux only: segments live under `/dev/shm` and sockets on the filesystem.

pub mod address;
pub mod cancel;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod segment;

pub use cancel::CancellationToken;
pub use client::ServiceCaller;
pub use config::{CommOptions, LocalCommConfig};
pub use endpoint::{CallbackResult, Endpoint};
pub use error::{ErrorCategory, LocalCommError, Result};
pub use protocol::{ControlMessage, Request, Response};
pub use segment::{Ownership, Segment};
