use crate::{Request, SinkError};
use std::sync::Arc;

/// The operation invoked once per accepted request.
///
/// Implementations are shared between the dispatcher and every active worker,
/// so they must be `Send + Sync`. The returned future must be `Send` so that it
/// can run on a spawned worker task.
///
/// Calls for the same key never overlap: whichever component owns the key
/// awaits each call before issuing the next one.
pub trait ExecutionSink: Send + Sync + 'static {
    fn execute(&self, request: &Request) -> impl Future<Output = Result<(), SinkError>> + Send;
}

impl<S: ExecutionSink> ExecutionSink for Arc<S> {
    fn execute(&self, request: &Request) -> impl Future<Output = Result<(), SinkError>> + Send {
        (**self).execute(request)
    }
}

/// Adapts an async closure into an [`ExecutionSink`].
///
/// The closure receives an owned clone of each request.
pub struct FnSink<F>(F);

/// Wraps `f` as an [`ExecutionSink`].
pub const fn sink_fn<F, Fut>(f: F) -> FnSink<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SinkError>> + Send,
{
    FnSink(f)
}

impl<F, Fut> ExecutionSink for FnSink<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SinkError>> + Send,
{
    fn execute(&self, request: &Request) -> impl Future<Output = Result<(), SinkError>> + Send {
        (self.0)(request.clone())
    }
}
