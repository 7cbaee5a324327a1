use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::hash::Hasher;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dyn_hash::DynHash;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use keystone_core::cancellation::CancellationToken;
use keystone_core::hash::IdentifierHasher;
use keystone_core::types::BuildOptions;
use keystone_core::types::CacheKey;
use keystone_core::types::Invalidation;
use keystone_core::types::RequestId;
use keystone_core::types::RequestInvalidation;
use keystone_filesystem::FileSystemRef;

use super::request_tracker::TrackerInner;

/// Payload a request computes. The engine never inspects it; the bounds
/// exist so results can be shared between concurrent callers and persisted
/// across runs.
pub trait RequestPayload:
  Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> RequestPayload for T where
  T: Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

pub type RunRequestError = anyhow::Error;

/// One memoizable unit of work.
///
/// Implementations hash their inputs; two requests with equal hashes are the
/// same unit of work and share one cached result and at most one concurrent
/// execution.
#[async_trait]
pub trait Request<R: RequestPayload>: DynHash + Send + Sync + Debug + 'static {
  /// Stable identity: the concrete type plus the request's own `Hash`.
  fn id(&self) -> RequestId {
    let mut hasher = IdentifierHasher::default();
    self.type_id().hash(&mut hasher);
    self.dyn_hash(&mut hasher);
    RequestId::new(hasher.finish())
  }

  /// Short tag stored on the request node for diagnostics.
  fn kind(&self) -> &'static str {
    "request"
  }

  async fn run(
    &self,
    request_context: RunRequestContext<R>,
  ) -> Result<ResultAndInvalidations<R>, RunRequestError>;
}

dyn_hash::hash_trait_object!(<R> Request<R> where R: RequestPayload);

/// What a request run settles to: the computed payload, the conditions that
/// should invalidate it, and an optional external cache key under which the
/// payload is persisted separately from the graph.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultAndInvalidations<R> {
  pub result: R,
  pub invalidations: Vec<Invalidation>,
  pub cache_key: Option<CacheKey>,
}

impl<R> ResultAndInvalidations<R> {
  pub fn new(result: R) -> Self {
    Self {
      result,
      invalidations: Vec::new(),
      cache_key: None,
    }
  }

  pub fn with_invalidations(result: R, invalidations: Vec<Invalidation>) -> Self {
    Self {
      result,
      invalidations,
      cache_key: None,
    }
  }
}

/// This is the API for requests to call back onto the `RequestTracker`.
///
/// We want to avoid exposing internals of the request tracker to the
/// implementations so that we can change this.
pub struct RunRequestContext<R: RequestPayload> {
  request_id: RequestId,
  parent_request_id: Option<RequestId>,
  previous_invalidations: Vec<RequestInvalidation>,
  previous_sub_requests: Vec<RequestId>,
  sub_requests: Arc<Mutex<Vec<RequestId>>>,
  tracker: Arc<TrackerInner<R>>,
  cancellation: CancellationToken,
}

impl<R: RequestPayload> RunRequestContext<R> {
  #[allow(clippy::too_many_arguments)]
  pub(super) fn new(
    request_id: RequestId,
    parent_request_id: Option<RequestId>,
    previous_invalidations: Vec<RequestInvalidation>,
    previous_sub_requests: Vec<RequestId>,
    tracker: Arc<TrackerInner<R>>,
    cancellation: CancellationToken,
  ) -> Self {
    Self {
      request_id,
      parent_request_id,
      previous_invalidations,
      previous_sub_requests,
      sub_requests: Arc::new(Mutex::new(Vec::new())),
      tracker,
      cancellation,
    }
  }

  pub fn request_id(&self) -> RequestId {
    self.request_id
  }

  pub fn parent_request_id(&self) -> Option<RequestId> {
    self.parent_request_id
  }

  /// The invalidation conditions the previous completed run of this request
  /// declared, snapshotted when the current run started.
  pub fn previous_invalidations(&self) -> &[RequestInvalidation] {
    &self.previous_invalidations
  }

  /// The sub-requests the previous completed run of this request invoked.
  pub fn previous_sub_requests(&self) -> &[RequestId] {
    &self.previous_sub_requests
  }

  /// The subset of [`Self::previous_sub_requests`] that is currently invalid.
  pub async fn invalid_sub_requests(&self) -> Vec<RequestId> {
    self
      .tracker
      .invalid_subset(&self.previous_sub_requests)
      .await
  }

  /// The result the previous completed run stored, or `None` when there is
  /// none. When `cache_key` is given, the stored result is only returned if
  /// it was stored under the same key.
  pub async fn previous_result(
    &self,
    cache_key: Option<&CacheKey>,
  ) -> anyhow::Result<Option<Arc<R>>> {
    self
      .tracker
      .previous_result(self.request_id, cache_key)
      .await
  }

  /// Run a child request of the current request.
  ///
  /// This is how the sub-request tree is built: the tracker records an edge
  /// from this request to the child, and invalidating the child later
  /// invalidates this request too.
  pub async fn run_request(&self, request: impl Request<R>) -> anyhow::Result<Arc<R>> {
    let request: Arc<dyn Request<R>> = Arc::new(request);
    self.sub_requests.lock().push(request.id());
    self
      .tracker
      .clone()
      .run_request_inner(
        request,
        Some(self.request_id),
        false,
        self.cancellation.clone(),
      )
      .await
  }

  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancellation
  }

  pub fn file_system(&self) -> &FileSystemRef {
    self.tracker.file_system()
  }

  pub fn options(&self) -> &Arc<BuildOptions> {
    self.tracker.build_options()
  }

  pub fn project_root(&self) -> &Path {
    self.tracker.project_root()
  }

  /// The sub-request ids invoked so far during this run.
  pub(super) fn sub_request_log(&self) -> Arc<Mutex<Vec<RequestId>>> {
    self.sub_requests.clone()
  }
}
