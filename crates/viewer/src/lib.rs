//! # Shellcast Viewer Library
//!
//! Client side of Shellcast: everything a viewer needs to follow a session
//! across network blips.
//!
//! - [`ConnectionManager`]: push connection with `/health` liveness checks
//!   and exponential reconnect backoff
//! - [`OffsetCursor`]: de-duplicates scrollback replayed after a reconnect
//!   and reports gaps and restarted streams
//! - [`CatchUpClient`]: offset-addressed polling for viewers without a push
//!   connection
//!
//! ## Example
//!
//! ```rust,no_run
//! use viewer::{ConnectionManager, ViewerConfig, ViewerEvent};
//!
//! # async fn run() -> viewer::Result<()> {
//! let manager = ConnectionManager::new(ViewerConfig::new("http://127.0.0.1:7681", "main"))?;
//! if let Some(mut events) = manager.start() {
//!     while let Some(event) = events.recv().await {
//!         if let ViewerEvent::Output(bytes) = event {
//!             print!("{}", String::from_utf8_lossy(&bytes));
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod catchup;
pub mod cursor;
pub mod error;
pub mod manager;

pub use backoff::Backoff;
pub use catchup::CatchUpClient;
pub use cursor::{Gap, OffsetCursor, Replay};
pub use error::{Result, ViewerError};
pub use manager::{ConnectionManager, ConnectionStatus, StopReason, ViewerConfig, ViewerEvent};
