//! Cancellation plumbing shared by every public operation in the
//! workspace. Callers hand a token down the stack; blocking work either
//! checks it between steps ([`bail_if_canceled`]) or races it outright
//! ([`run_cancellable`]).

use crate::error::{Error, Result};

pub use tokio_util::sync::CancellationToken;

/// Fail fast with [`Error::Canceled`] if `token` has already fired.
pub fn bail_if_canceled(token: &CancellationToken, op: &str) -> Result<()> {
    if token.is_cancelled() {
        return Err(Error::Canceled(op.to_string()));
    }
    Ok(())
}

/// Race `fut` against cancellation, surfacing [`Error::Canceled`] if the
/// token fires first. For RPC-shaped futures with no checkpoint of their
/// own to poll the token at.
pub async fn run_cancellable<T, F>(token: &CancellationToken, op: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Canceled(op.to_string())),
        out = fut => out,
    }
}
