//! Per-key delay dispatch.
//!
//! A [`Dispatcher`] reads an ordered stream of keyed [`Request`]s. Requests
//! for keys without an active worker execute immediately on the dispatcher.
//! A delay-flagged request instead spawns a worker that takes exclusive
//! ownership of its key: every later request for that key is queued on the
//! worker, which executes them in arrival order and retires once the key has
//! been idle for one [`DelayConfig::window`].
//!
//! ```no_run
//! use delaycall::{DelayConfig, Dispatcher, Request, SinkError, sink_fn};
//!
//! # async fn example() -> delaycall::Result<()> {
//! let sink = sink_fn(|req: Request| async move {
//!     println!("{} -> {}", req.key(), req.payload());
//!     Ok::<(), SinkError>(())
//! });
//! let dispatcher = Dispatcher::new(DelayConfig::default(), sink)?;
//!
//! dispatcher.handle(Request::delayed("user1", "task000", 0)).await?;
//! dispatcher.handle(Request::new("user1", "task001", 1)).await?;
//! dispatcher.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatcher;
mod error;
mod event;
mod monitor;
mod request;
mod routing;
mod sink;
mod worker;

pub use crate::config::*;
pub use crate::dispatcher::{DispatchStats, Dispatched, Dispatcher, KeyStatus, RunSummary};
pub use crate::error::*;
pub use crate::event::{DispatchEvent, ExecutionPath, Receipt};
pub use crate::monitor::*;
pub use crate::request::*;
pub use crate::sink::*;
