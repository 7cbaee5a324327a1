use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Notify;

/// Cooperative cancellation for one build session.
///
/// Clones share state; `cancel` is observed by every clone. The tracker and
/// request bodies check the token at suspension points and surface
/// [`BuildAbortedError`], which callers must treat as distinct from an
/// ordinary request failure: it is never cached and never recorded as an
/// error invalidation reason.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
  inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
  cancelled: AtomicBool,
  notify: Notify,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.inner.cancelled.store(true, Ordering::SeqCst);
    self.inner.notify.notify_waiters();
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::SeqCst)
  }

  /// Errors once `cancel` has been called.
  pub fn check(&self) -> Result<(), BuildAbortedError> {
    if self.is_cancelled() {
      Err(BuildAbortedError)
    } else {
      Ok(())
    }
  }

  /// Resolves when the token is cancelled.
  pub async fn cancelled(&self) {
    loop {
      if self.is_cancelled() {
        return;
      }
      // Register interest before re-checking so a concurrent `cancel` between
      // the check and the await cannot be missed.
      let notified = self.inner.notify.notified();
      if self.is_cancelled() {
        return;
      }
      notified.await;
    }
  }
}

/// An external abort signal fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("build aborted")]
pub struct BuildAbortedError;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn check_reflects_cancellation() {
    let token = CancellationToken::new();
    assert!(token.check().is_ok());

    token.cancel();
    assert!(token.is_cancelled());
    assert_eq!(token.check(), Err(BuildAbortedError));
  }

  #[test]
  fn clones_share_state() {
    let token = CancellationToken::new();
    let clone = token.clone();
    token.cancel();
    assert!(clone.is_cancelled());
  }

  #[tokio::test]
  async fn cancelled_wakes_waiters() {
    let token = CancellationToken::new();
    let waiter = token.clone();

    let handle = tokio::spawn(async move {
      waiter.cancelled().await;
    });

    token.cancel();
    handle.await.unwrap();
  }
}
