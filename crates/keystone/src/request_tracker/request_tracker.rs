use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::RwLock;

use keystone_cache::Cache;
use keystone_cache::CacheRef;
use keystone_core::cancellation::BuildAbortedError;
use keystone_core::cancellation::CancellationToken;
use keystone_core::config_key::ConfigKeyHasherRef;
use keystone_core::key_path::value_at_key_path;
use keystone_core::types::flag_enabled_or;
use keystone_core::types::BuildOptions;
use keystone_core::types::CacheKey;
use keystone_core::types::Invalidation;
use keystone_core::types::InvalidateReason;
use keystone_core::types::RequestId;
use keystone_core::types::RequestInvalidation;
use keystone_filesystem::FileSystemRef;

use crate::watch::WatchEvent;
use crate::watch::Watcher;
use crate::watch::WatcherRef;

use super::fs_events::FsEventsContext;
use super::request::Request;
use super::request::RequestPayload;
use super::request::ResultAndInvalidations;
use super::request::RunRequestContext;
use super::request::RunRequestError;
use super::request_graph::hash_option_value;
use super::request_graph::OptionInvalidationPolicy;
use super::request_graph::RequestGraph;
use super::request_graph::RequestGraphEdge;
use super::request_graph::ResolvedInvalidation;
use super::request_graph::DEFERRED_ORPHAN_SWEEP;
use super::request_graph::NODES_PER_CHUNK;
use super::serialization::CacheKeys;
use super::serialization::CacheLoadError;

/// Default budget for one file-system event scan before the responder bails
/// out in favour of a clean rebuild.
pub const DEFAULT_EVENT_SCAN_BUDGET: Duration = Duration::from_millis(500);

/// How many changed options are reported when build options differ between
/// generations.
const TOP_CHANGED_OPTIONS: usize = 10;

pub struct RequestTrackerOptions {
  pub cache: CacheRef,
  pub file_system: FileSystemRef,
  pub watcher: WatcherRef,
  pub config_key_hasher: ConfigKeyHasherRef,
  pub build_options: Arc<BuildOptions>,
  pub option_policy: OptionInvalidationPolicy,
  pub project_root: PathBuf,
  /// Where the watcher snapshot for cold-start reconciliation lives.
  pub snapshot_path: PathBuf,
  pub event_scan_budget: Duration,
  pub nodes_per_chunk: usize,
}

impl RequestTrackerOptions {
  pub fn new(
    cache: CacheRef,
    file_system: FileSystemRef,
    watcher: WatcherRef,
    config_key_hasher: ConfigKeyHasherRef,
    build_options: Arc<BuildOptions>,
    project_root: PathBuf,
  ) -> Self {
    let snapshot_path = project_root.join(".keystone").join("snapshot.txt");
    Self {
      cache,
      file_system,
      watcher,
      config_key_hasher,
      build_options,
      option_policy: OptionInvalidationPolicy::default(),
      project_root,
      snapshot_path,
      event_scan_budget: DEFAULT_EVENT_SCAN_BUDGET,
      nodes_per_chunk: NODES_PER_CHUNK,
    }
  }
}

#[derive(Clone, Debug, Default)]
pub struct RunRequestOptions {
  /// Re-run even when a valid cached result exists.
  pub force: bool,
  pub cancellation: CancellationToken,
}

#[derive(Clone, Debug)]
enum BroadcastOutcome<R> {
  Success(Arc<R>),
  Failed,
  Aborted,
}

/// How one `run_request` call proceeds after consulting the graph and the
/// in-flight table.
enum Claim<R: RequestPayload> {
  Cached(Option<Arc<R>>, Option<CacheKey>),
  Wait(broadcast::Receiver<BroadcastOutcome<R>>),
  Run {
    tx: broadcast::Sender<BroadcastOutcome<R>>,
    previous_invalidations: Vec<RequestInvalidation>,
    previous_sub_requests: Vec<RequestId>,
  },
}

/// [`RequestTracker`] runs build work items and constructs a graph of their
/// dependencies.
///
/// Whenever a [`Request`] implementation needs the result of another piece of
/// work, it makes a call back into the tracker through its
/// [`RunRequestContext`]. The tracker verifies whether the piece of work has
/// already been completed and still holds, returns the memoized result if
/// so, and otherwise executes it, deduplicating against an identical request
/// that is already in flight.
pub struct RequestTracker<R: RequestPayload> {
  pub(super) inner: Arc<TrackerInner<R>>,
}

impl<R: RequestPayload> Clone for RequestTracker<R> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

pub(super) struct TrackerInner<R: RequestPayload> {
  pub(super) graph: RwLock<RequestGraph<R>>,
  pending: Mutex<HashMap<RequestId, broadcast::Sender<BroadcastOutcome<R>>>>,
  cache: CacheRef,
  file_system: FileSystemRef,
  watcher: WatcherRef,
  config_key_hasher: ConfigKeyHasherRef,
  build_options: Arc<BuildOptions>,
  project_root: PathBuf,
  snapshot_path: PathBuf,
  event_scan_budget: Duration,
  nodes_per_chunk: usize,
  cache_keys: CacheKeys,
}

impl<R: RequestPayload> RequestTracker<R> {
  pub fn new(options: RequestTrackerOptions) -> Self {
    let graph = RequestGraph::with_chunk_size(options.nodes_per_chunk);
    Self::from_parts(options, graph)
  }

  /// Restore the previous generation's graph and reconcile it with what
  /// changed since the last snapshot. Any unusable cache (missing, corrupt,
  /// written by another version, or too expensive to reconcile) degrades to
  /// an empty graph and a full rebuild. Returns whether a generation was
  /// restored.
  pub fn load_or_new(options: RequestTrackerOptions) -> (Self, bool) {
    let cache_keys = CacheKeys::new(&options.build_options);
    let loaded = match RequestGraph::load_from_cache(&options.cache, &cache_keys) {
      Ok(graph) => Some(graph),
      Err(CacheLoadError::Missing) => {
        tracing::debug!("no cache generation found; starting clean");
        None
      }
      Err(error @ CacheLoadError::VersionMismatch { .. }) => {
        tracing::warn!(%error, "cache generation written by an incompatible version; starting clean");
        None
      }
      Err(error @ CacheLoadError::Corrupt(_)) => {
        tracing::warn!(%error, "corrupt cache generation; starting clean");
        None
      }
      Err(CacheLoadError::Io(error)) => {
        tracing::warn!(%error, "cache read failed; starting clean");
        None
      }
    };

    let mut restored = false;
    let graph = match loaded {
      Some(mut graph) => match Self::reconcile(&mut graph, &options) {
        Ok(()) => {
          restored = true;
          graph
        }
        Err(error) => {
          tracing::warn!(%error, "could not reconcile restored graph; starting clean");
          RequestGraph::with_chunk_size(options.nodes_per_chunk)
        }
      },
      None => RequestGraph::with_chunk_size(options.nodes_per_chunk),
    };

    (Self::from_parts(options, graph), restored)
  }

  /// Start-of-process invalidation passes plus snapshot replay.
  fn reconcile(graph: &mut RequestGraph<R>, options: &RequestTrackerOptions) -> anyhow::Result<()> {
    graph.invalidate_unpredictable_nodes();
    graph.invalidate_on_build_nodes();

    let changed_env = graph.invalidate_env_nodes(&options.build_options.env);
    if !changed_env.is_empty() {
      tracing::info!(?changed_env, "environment changed since last build");
    }

    let changed_options =
      graph.invalidate_option_nodes(&options.build_options.options, &options.option_policy);
    if !changed_options.is_empty() {
      let top: Vec<(&str, usize)> = changed_options
        .iter()
        .take(TOP_CHANGED_OPTIONS)
        .map(|change| (change.key.as_str(), change.invalidated_requests))
        .collect();
      tracing::info!(?top, "build options changed since last build");
    }

    let events = options
      .watcher
      .events_since(&options.project_root, &options.snapshot_path)?;
    let context = FsEventsContext {
      project_root: &options.project_root,
      config_key_hasher: options.config_key_hasher.as_ref(),
      feature_flags: &options.build_options.feature_flags,
    };
    let response = graph.respond_to_fs_events(&context, &events, options.event_scan_budget)?;
    tracing::info!(
      events = events.len(),
      invalidated_paths = response.invalidations_by_path.len(),
      "reconciled file-system state since last snapshot"
    );
    Ok(())
  }

  fn from_parts(options: RequestTrackerOptions, graph: RequestGraph<R>) -> Self {
    let cache_keys = CacheKeys::new(&options.build_options);
    RequestTracker {
      inner: Arc::new(TrackerInner {
        graph: RwLock::new(graph),
        pending: Mutex::new(HashMap::new()),
        cache: options.cache,
        file_system: options.file_system,
        watcher: options.watcher,
        config_key_hasher: options.config_key_hasher,
        build_options: options.build_options,
        project_root: options.project_root,
        snapshot_path: options.snapshot_path,
        event_scan_budget: options.event_scan_budget,
        nodes_per_chunk: options.nodes_per_chunk,
        cache_keys,
      }),
    }
  }

  /// Run a request that has no parent and return its (possibly memoized)
  /// result.
  pub async fn run_request(&self, request: impl Request<R>) -> anyhow::Result<Arc<R>> {
    self
      .run_request_with_options(request, RunRequestOptions::default())
      .await
  }

  pub async fn run_request_with_options(
    &self,
    request: impl Request<R>,
    options: RunRequestOptions,
  ) -> anyhow::Result<Arc<R>> {
    let request: Arc<dyn Request<R>> = Arc::new(request);
    self
      .inner
      .clone()
      .run_request_inner(request, None, options.force, options.cancellation)
      .await
  }

  pub async fn has_valid_result(&self, request_id: RequestId) -> bool {
    let graph = self.inner.graph.read().await;
    graph
      .request_index(request_id)
      .is_some_and(|index| graph.is_valid(index))
  }

  pub async fn get_invalidations(&self, request_id: RequestId) -> Vec<RequestInvalidation> {
    self.inner.graph.read().await.get_invalidations(request_id)
  }

  pub async fn invalid_request_ids(&self) -> Vec<RequestId> {
    self.inner.graph.read().await.invalid_request_ids()
  }

  /// Per-build invalidation pass: requests that opted into re-running every
  /// build go stale now. Call once at the start of each incremental build.
  pub async fn invalidate_for_build(&self) {
    self.inner.graph.write().await.invalidate_on_build_nodes();
  }

  /// Apply a watcher batch to the graph. When scanning blows its latency
  /// budget the graph is discarded entirely; a full rebuild is cheaper than
  /// trusting a partially applied batch. Returns whether any cached result
  /// went stale.
  #[tracing::instrument(level = "info", skip_all, fields(events = events.len()))]
  pub async fn respond_to_fs_events(&self, events: &[WatchEvent]) -> bool {
    let inner = &self.inner;
    let mut graph = inner.graph.write().await;
    let context = FsEventsContext {
      project_root: &inner.project_root,
      config_key_hasher: inner.config_key_hasher.as_ref(),
      feature_flags: &inner.build_options.feature_flags,
    };

    match graph.respond_to_fs_events(&context, events, inner.event_scan_budget) {
      Ok(response) => response.did_invalidate,
      Err(bailout) => {
        tracing::warn!(%bailout, "discarding request graph; next build starts clean");
        *graph = RequestGraph::with_chunk_size(inner.nodes_per_chunk);
        true
      }
    }
  }

  /// Persist dirty chunks, stripped large results, the header and a fresh
  /// watcher snapshot, bracketed by the blob store's transaction so an
  /// interrupted write leaves the previous generation intact.
  #[tracing::instrument(level = "info", skip_all)]
  pub async fn write_to_cache(&self, cancellation: Option<CancellationToken>) -> anyhow::Result<()> {
    let token = cancellation.unwrap_or_default();
    let inner = &self.inner;

    inner.cache.start_transaction()?;

    let write = async {
      let payload = {
        let graph = inner.graph.read().await;
        graph.collect_cache_payload(&inner.cache_keys)?
      };

      for (key, bytes) in &payload.result_blobs {
        token.check()?;
        inner.cache.set_large_blob(key, bytes)?;
      }

      let mut written = Vec::with_capacity(payload.chunks.len());
      for (chunk, key, bytes) in &payload.chunks {
        token.check()?;
        inner.cache.set_blob(key, bytes)?;
        written.push(*chunk);
      }

      token.check()?;
      inner.cache.set_blob(&payload.header_key, &payload.header)?;

      inner
        .watcher
        .write_snapshot(&inner.project_root, &inner.snapshot_path)?;
      anyhow::Ok((written, payload.stripped))
    }
    .await;

    match write {
      Ok((written, stripped)) => {
        inner.cache.commit_transaction()?;
        let mut graph = inner.graph.write().await;
        graph.mark_chunks_clean(&written);
        graph.apply_stripped(&stripped);
        tracing::debug!(chunks = written.len(), "cache write committed");
        Ok(())
      }
      Err(error) if error.downcast_ref::<BuildAbortedError>().is_some() => {
        // Caller-initiated abort: the staged write is abandoned and the
        // previous generation stays current.
        tracing::debug!("cache write aborted");
        Ok(())
      }
      Err(error) => Err(error),
    }
  }
}

impl<R: RequestPayload> TrackerInner<R> {
  pub(super) fn file_system(&self) -> &FileSystemRef {
    &self.file_system
  }

  pub(super) fn build_options(&self) -> &Arc<BuildOptions> {
    &self.build_options
  }

  pub(super) fn project_root(&self) -> &Path {
    &self.project_root
  }

  pub(super) async fn run_request_inner(
    self: Arc<Self>,
    request: Arc<dyn Request<R>>,
    parent: Option<RequestId>,
    force: bool,
    cancellation: CancellationToken,
  ) -> anyhow::Result<Arc<R>> {
    let request_id = request.id();
    let kind = request.kind();

    loop {
      cancellation.check()?;

      let claim = {
        let mut graph = self.graph.write().await;
        let index = graph.ensure_request_node(request_id, kind);
        match parent {
          Some(parent_id) => {
            if let Some(parent_index) = graph.request_index(parent_id) {
              graph.link_subrequest(parent_index, index);
            }
          }
          None => graph.link_to_root(index),
        }

        if !force && graph.is_valid(index) {
          let (result, cache_key) = graph.stored_result(index);
          Claim::Cached(result, cache_key)
        } else {
          let mut pending = self.pending.lock();
          if let Some(tx) = pending.get(&request_id) {
            Claim::Wait(tx.subscribe())
          } else {
            let (tx, _rx) = broadcast::channel(1);
            pending.insert(request_id, tx.clone());
            drop(pending);

            let previous_invalidations = graph.get_invalidations(request_id);
            let previous_sub_requests: Vec<RequestId> = graph
              .connected_targets(index, RequestGraphEdge::Subrequest)
              .into_iter()
              .map(|child| graph.request_node(child).id)
              .collect();
            graph.start_request(index);
            Claim::Run {
              tx,
              previous_invalidations,
              previous_sub_requests,
            }
          }
        }
      };

      match claim {
        Claim::Cached(result, cache_key) => {
          tracing::trace!(%request_id, "request served from cache");
          match self.resolve_stored(request_id, result, cache_key).await {
            Ok(result) => return Ok(result),
            Err(error) => {
              tracing::warn!(%request_id, %error, "cached result unavailable; re-running");
              let mut graph = self.graph.write().await;
              if let Some(index) = graph.request_index(request_id) {
                graph.invalidate_node(index, InvalidateReason::ERROR);
              }
              continue;
            }
          }
        }
        Claim::Wait(mut rx) => {
          tracing::trace!(%request_id, "awaiting in-flight run of identical request");
          match rx.recv().await {
            Ok(BroadcastOutcome::Success(result)) => return Ok(result),
            Ok(BroadcastOutcome::Aborted) => return Err(BuildAbortedError.into()),
            // The in-flight run failed (or its sender vanished); take over
            // and run it ourselves.
            Ok(BroadcastOutcome::Failed) | Err(_) => continue,
          }
        }
        Claim::Run {
          tx,
          previous_invalidations,
          previous_sub_requests,
        } => {
          tracing::debug!(%request_id, kind, "running request");
          let context = RunRequestContext::new(
            request_id,
            parent,
            previous_invalidations,
            previous_sub_requests,
            self.clone(),
            cancellation.clone(),
          );
          let sub_request_log = context.sub_request_log();

          let run_result = request.run(context).await;

          let sub_requests: Vec<RequestId> = sub_request_log.lock().clone();
          let outcome = self
            .settle(request_id, run_result, &sub_requests, &cancellation)
            .await;

          self.pending.lock().remove(&request_id);
          let _ = tx.send(match &outcome {
            Ok(result) => BroadcastOutcome::Success(result.clone()),
            Err(error) if error.downcast_ref::<BuildAbortedError>().is_some() => {
              BroadcastOutcome::Aborted
            }
            Err(_) => BroadcastOutcome::Failed,
          });

          return outcome;
        }
      }
    }
  }

  /// Record a settled run: replace the sub-request edges with what this run
  /// actually invoked, then either store the result and its invalidations or
  /// mark the failure.
  async fn settle(
    &self,
    request_id: RequestId,
    run_result: Result<ResultAndInvalidations<R>, RunRequestError>,
    sub_requests: &[RequestId],
    cancellation: &CancellationToken,
  ) -> anyhow::Result<Arc<R>> {
    let eager_orphans = !flag_enabled_or(
      &self.build_options.feature_flags,
      DEFERRED_ORPHAN_SWEEP,
      true,
    );

    let resolved = match &run_result {
      Ok(outcome) => self.resolve_invalidations(&outcome.invalidations),
      Err(_) => Vec::new(),
    };

    let mut graph = self.graph.write().await;
    let Some(index) = graph.request_index(request_id) else {
      panic!("request node {request_id} vanished while its run was in flight");
    };

    graph.replace_subrequests(index, sub_requests, eager_orphans);

    if cancellation.is_cancelled() {
      graph.abandon_request(index);
      return Err(BuildAbortedError.into());
    }

    match run_result {
      Ok(ResultAndInvalidations {
        result, cache_key, ..
      }) => {
        let result = Arc::new(result);
        graph.complete_request(index, result.clone(), cache_key, resolved, eager_orphans);
        Ok(result)
      }
      Err(error) => {
        if error.downcast_ref::<BuildAbortedError>().is_some() {
          graph.abandon_request(index);
        } else {
          tracing::debug!(%request_id, %error, "request failed");
          graph.fail_request(index);
        }
        Err(error)
      }
    }
  }

  /// Turn declared invalidations into graph registrations, capturing the
  /// state values observed right now (env value, option hash, config-key
  /// content hash).
  fn resolve_invalidations(&self, invalidations: &[Invalidation]) -> Vec<ResolvedInvalidation> {
    invalidations
      .iter()
      .map(|invalidation| match invalidation {
        Invalidation::FileUpdate(path) => ResolvedInvalidation::FileUpdate(path.clone()),
        Invalidation::FileDelete(path) => ResolvedInvalidation::FileDelete(path.clone()),
        Invalidation::FileCreate(input) => ResolvedInvalidation::FileCreate(input.clone()),
        Invalidation::EnvChange(key) => ResolvedInvalidation::Env {
          key: key.clone(),
          value: self.build_options.env.get(key).cloned(),
        },
        Invalidation::OptionChange(key) => {
          let value = value_at_key_path(&self.build_options.options, key);
          ResolvedInvalidation::Option {
            key: key.clone(),
            hash: hash_option_value(value),
            original_value: value.cloned().unwrap_or(serde_json::Value::Null),
          }
        }
        Invalidation::ConfigKeyChange {
          file_path,
          key_path,
        } => {
          let content_hash = match self
            .config_key_hasher
            .hash_config_key(file_path, key_path)
          {
            Ok(hash) => hash,
            Err(error) => {
              tracing::warn!(
                file = %file_path.display(),
                key = %key_path,
                %error,
                "failed to hash config key at declaration time"
              );
              None
            }
          };
          ResolvedInvalidation::ConfigKey {
            file_path: file_path.clone(),
            key_path: key_path.clone(),
            content_hash,
          }
        }
        Invalidation::Startup => ResolvedInvalidation::Startup,
        Invalidation::Build => ResolvedInvalidation::Build,
      })
      .collect()
  }

  /// A valid result may have been stripped to the blob store; fetch it back
  /// and re-hydrate the node on demand.
  async fn resolve_stored(
    &self,
    request_id: RequestId,
    result: Option<Arc<R>>,
    cache_key: Option<CacheKey>,
  ) -> anyhow::Result<Arc<R>> {
    if let Some(result) = result {
      return Ok(result);
    }
    let Some(key) = cache_key else {
      anyhow::bail!("request {request_id} is valid but has no stored result");
    };

    let bytes = self.cache.get_large_blob(&key)?;
    let value: R = serde_json::from_slice(&bytes)?;
    let result = Arc::new(value);
    self
      .graph
      .write()
      .await
      .store_hydrated_result(request_id, result.clone());
    Ok(result)
  }

  pub(super) async fn previous_result(
    &self,
    request_id: RequestId,
    expected_key: Option<&CacheKey>,
  ) -> anyhow::Result<Option<Arc<R>>> {
    let stored = {
      let graph = self.graph.read().await;
      graph
        .request_index(request_id)
        .map(|index| graph.stored_result(index))
    };
    let Some((result, cache_key)) = stored else {
      return Ok(None);
    };

    if let Some(expected) = expected_key {
      if cache_key.as_ref() != Some(expected) {
        return Ok(None);
      }
    }

    if let Some(result) = result {
      return Ok(Some(result));
    }
    let Some(key) = cache_key else {
      return Ok(None);
    };

    match self.cache.get_large_blob(&key) {
      Ok(bytes) => {
        let value: R = serde_json::from_slice(&bytes)?;
        let result = Arc::new(value);
        self
          .graph
          .write()
          .await
          .store_hydrated_result(request_id, result.clone());
        Ok(Some(result))
      }
      Err(error) => {
        tracing::warn!(%request_id, %error, "previous result missing from blob store");
        Ok(None)
      }
    }
  }

  pub(super) async fn invalid_subset(&self, ids: &[RequestId]) -> Vec<RequestId> {
    let graph = self.graph.read().await;
    ids
      .iter()
      .copied()
      .filter(|id| {
        graph
          .request_index(*id)
          .is_some_and(|index| graph.invalid_requests.contains(&index))
      })
      .collect()
  }
}
