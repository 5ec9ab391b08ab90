use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{panic_message, HandlerError};
use crate::session::VirtualSession;

/// What a middleware decided about the connection.
pub enum Next {
    /// Hand the session to the next middleware (or the connection handlers).
    Continue,
    /// Stop here without an error. The session stays registered but no
    /// connection handler runs for it.
    Halt,
    /// Abort the chain. The error is logged at debug level only and is not
    /// relayed to the client.
    Reject(HandlerError),
}

pub(crate) type Middleware = Arc<dyn Fn(VirtualSession) -> BoxFuture<'static, Next> + Send + Sync>;

pub(crate) enum ChainOutcome {
    Admitted,
    Halted { index: usize },
    Rejected { index: usize, error: HandlerError },
    Panicked { index: usize, message: String },
}

/// Runs middlewares in registration order, one at a time.
///
/// Iterates by index rather than nesting continuations, so chain length does
/// not grow the stack. A middleware that never resolves leaves the chain
/// pending; the caller is responsible for abandoning it on teardown.
pub(crate) async fn run_chain(session: &VirtualSession, chain: &[Middleware]) -> ChainOutcome {
    for (index, middleware) in chain.iter().enumerate() {
        let step = AssertUnwindSafe(async { middleware(session.clone()).await })
            .catch_unwind()
            .await;
        match step {
            Ok(Next::Continue) => continue,
            Ok(Next::Halt) => return ChainOutcome::Halted { index },
            Ok(Next::Reject(error)) => return ChainOutcome::Rejected { index, error },
            Err(payload) => {
                return ChainOutcome::Panicked {
                    index,
                    message: panic_message(payload.as_ref()),
                }
            }
        }
    }
    ChainOutcome::Admitted
}
