//! Async conda client with streaming progress.
//!
//! ```no_run
//! use conda_stream::{Client, Invocation, TransportKind};
//!
//! # async fn example() -> conda_stream::Result<()> {
//! let call = Client::default().invoke(
//!     TransportKind::Pipe,
//!     Invocation::new("install").flag("quiet", false).arg("numpy"),
//! );
//! call.on_progress(|message| println!("progress: {message}"));
//!
//! let result = call.await?;
//! println!("{result:#}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod deferred;
pub mod error;
pub mod invocation;
pub mod server;
pub mod streaming;
pub mod transport;

pub use client::{invoke, Client};
pub use config::Config;
pub use deferred::{CancelHandle, Deferred, Progress};
pub use error::{CallError, ConfigError, FrameError, Result};
pub use invocation::Invocation;
pub use transport::{Transport, TransportEvent, TransportKind};
