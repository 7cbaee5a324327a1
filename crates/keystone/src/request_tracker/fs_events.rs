use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use petgraph::graph::NodeIndex;

use keystone_core::config_key::ConfigKeyHasher;
use keystone_core::types::flag_enabled;
use keystone_core::types::flag_enabled_or;
use keystone_core::types::FeatureFlags;
use keystone_core::types::InvalidateReason;

use crate::watch::WatchEvent;
use crate::watch::WatchEventType;

use super::request::RequestPayload;
use super::request_graph::file_content_key;
use super::request_graph::file_name_content_key;
use super::request_graph::RequestGraph;
use super::request_graph::RequestGraphEdge;
use super::request_graph::RequestGraphNode;
use super::request_graph::CONFIG_KEY_CREATE_INVALIDATION;
use super::request_graph::DEFERRED_ORPHAN_SWEEP;

/// How many events are processed before the scan's total latency is
/// projected and checked against the caller's budget.
const BAILOUT_SAMPLE_SIZE: usize = 128;

/// State the responder needs besides the event batch itself.
pub struct FsEventsContext<'a> {
  pub project_root: &'a Path,
  pub config_key_hasher: &'a dyn ConfigKeyHasher,
  pub feature_flags: &'a FeatureFlags,
}

#[derive(Debug, Default)]
pub struct FsEventsResponse {
  pub did_invalidate: bool,
  /// Newly invalidated requests per event path, for diagnostics.
  pub invalidations_by_path: HashMap<PathBuf, usize>,
}

/// The invalidation scan was projected to blow its latency budget. The
/// caller's fallback is to discard the graph and rebuild from scratch rather
/// than trust a partially applied batch.
#[derive(Debug, thiserror::Error)]
#[error(
  "scanning {event_count} file-system events projected to take {projected_ms}ms, over the {budget_ms}ms budget"
)]
pub struct EventScanBailout {
  pub event_count: usize,
  pub projected_ms: u128,
  pub budget_ms: u128,
}

impl<R: RequestPayload> RequestGraph<R> {
  /// Consume a batch of watcher events and mark every affected request
  /// stale. Events are processed in order; under the deferred-sweep flag a
  /// request already invalidated during this batch is not revisited, making
  /// batch processing idempotent per node regardless of duplicate edges.
  #[tracing::instrument(level = "info", skip_all, fields(events = events.len()))]
  pub fn respond_to_fs_events(
    &mut self,
    context: &FsEventsContext<'_>,
    events: &[WatchEvent],
    budget: Duration,
  ) -> Result<FsEventsResponse, EventScanBailout> {
    let deferred_sweep = flag_enabled_or(context.feature_flags, DEFERRED_ORPHAN_SWEEP, true);
    let config_keys_on_create = flag_enabled(context.feature_flags, CONFIG_KEY_CREATE_INVALIDATION);

    let started = Instant::now();
    let mut response = FsEventsResponse::default();
    let mut memo: Option<HashSet<NodeIndex>> = deferred_sweep.then(HashSet::new);

    for (scanned, event) in events.iter().enumerate() {
      if scanned + 1 == BAILOUT_SAMPLE_SIZE && events.len() > BAILOUT_SAMPLE_SIZE {
        let projected = started
          .elapsed()
          .mul_f64(events.len() as f64 / BAILOUT_SAMPLE_SIZE as f64);
        if projected > budget {
          tracing::warn!(
            events = events.len(),
            ?projected,
            ?budget,
            "invalidation scan over budget"
          );
          return Err(EventScanBailout {
            event_count: events.len(),
            projected_ms: projected.as_millis(),
            budget_ms: budget.as_millis(),
          });
        }
      }

      // A create of the project root itself means the whole project moved;
      // no recorded edge can be trusted to cover that.
      if event.kind == WatchEventType::Create && event.path == context.project_root {
        tracing::warn!(
          project_root = %context.project_root.display(),
          "project root replaced; invalidating every request"
        );
        let requests: Vec<NodeIndex> = self
          .graph
          .node_indices()
          .filter(|index| {
            matches!(
              self.graph.node_weight(*index),
              Some(RequestGraphNode::Request(_))
            )
          })
          .collect();
        let newly_invalid = requests.len();
        for index in requests {
          self.invalidate_node(index, InvalidateReason::FILE_CREATE);
        }
        response.did_invalidate = newly_invalid > 0;
        *response
          .invalidations_by_path
          .entry(event.path.clone())
          .or_default() += newly_invalid;
        return Ok(response);
      }

      let invalid_before = self.invalid_requests.len();
      self.apply_event(context, event, config_keys_on_create, !deferred_sweep, &mut memo);

      let newly_invalid = self.invalid_requests.len().saturating_sub(invalid_before);
      if newly_invalid > 0 {
        response.did_invalidate = true;
        *response
          .invalidations_by_path
          .entry(event.path.clone())
          .or_default() += newly_invalid;
      }
    }

    if deferred_sweep {
      self.sweep_orphans();
    }

    Ok(response)
  }

  fn apply_event(
    &mut self,
    context: &FsEventsContext<'_>,
    event: &WatchEvent,
    config_keys_on_create: bool,
    eager_orphans: bool,
    memo: &mut Option<HashSet<NodeIndex>>,
  ) {
    let file_index = self.content_keys.get(&file_content_key(&event.path)).copied();

    // Update edges fire for updates and deletes, and also for creates of a
    // path we already track: some platforms report updates as creates.
    let fires_update = matches!(event.kind, WatchEventType::Update | WatchEventType::Delete)
      || (event.kind == WatchEventType::Create && file_index.is_some());
    if fires_update {
      if let Some(index) = file_index {
        for owner in self.connected_sources(index, RequestGraphEdge::InvalidatedByUpdate) {
          self.invalidate_with_memo(owner, InvalidateReason::FILE_UPDATE, memo);
        }
      }
    }

    match event.kind {
      WatchEventType::Update => {
        self.invalidate_config_keys(context, &event.path, false, memo);
      }
      WatchEventType::Create => {
        if let Some(index) = file_index {
          for owner in self.connected_sources(index, RequestGraphEdge::InvalidatedByCreate) {
            self.invalidate_with_memo(owner, InvalidateReason::FILE_CREATE, memo);
          }
        }

        self.invalidate_create_above_matches(&event.path, memo);
        self.invalidate_glob_matches(&event.path, memo);

        if config_keys_on_create {
          self.invalidate_config_keys(context, &event.path, false, memo);
        }
      }
      WatchEventType::Delete => {
        if let Some(index) = file_index {
          for owner in self.connected_sources(index, RequestGraphEdge::InvalidatedByDelete) {
            self.invalidate_with_memo(owner, InvalidateReason::FILE_DELETE, memo);
          }
        }

        self.invalidate_config_keys(context, &event.path, true, memo);

        if let Some(index) = file_index {
          self.remove_node(index, eager_orphans);
        }
      }
    }
  }

  fn invalidate_with_memo(
    &mut self,
    index: NodeIndex,
    reason: InvalidateReason,
    memo: &mut Option<HashSet<NodeIndex>>,
  ) {
    if let Some(memo) = memo {
      if !memo.insert(index) {
        return;
      }
    }
    self.invalidate_node(index, reason);
  }

  /// Match a created path against the reversed-segment file-name trie.
  ///
  /// Watchers may deliver only the leaf event for a deep create (the event
  /// for `a/node_modules/pkg/index.js` without one for `a/node_modules`), so
  /// every ancestor of the created path is checked against the trie.
  fn invalidate_create_above_matches(
    &mut self,
    created: &Path,
    memo: &mut Option<HashSet<NodeIndex>>,
  ) {
    let mut candidate = Some(created.to_path_buf());
    while let Some(path) = candidate {
      candidate = path.parent().map(Path::to_path_buf);

      let Some(segment) = path.file_name().map(|s| s.to_string_lossy().into_owned()) else {
        continue;
      };
      let Some(&name_index) = self.content_keys.get(&file_name_content_key(&segment)) else {
        continue;
      };

      // The search-path file nodes wired into this trie level.
      let matches: Vec<(NodeIndex, PathBuf)> = self
        .connected_sources(name_index, RequestGraphEdge::InvalidatedByCreateAbove)
        .into_iter()
        .filter_map(|index| match self.graph.node_weight(index) {
          Some(RequestGraphNode::File(file)) => Some((index, file.path.clone())),
          _ => None,
        })
        .collect();
      if !matches.is_empty() {
        self.walk_file_name_chain(name_index, &path, &matches, memo);
      }
    }
  }

  fn walk_file_name_chain(
    &mut self,
    start: NodeIndex,
    created: &Path,
    matches: &[(NodeIndex, PathBuf)],
    memo: &mut Option<HashSet<NodeIndex>>,
  ) {
    let mut name_index = start;
    let mut current = created.to_path_buf();

    loop {
      let Some(dirname) = current.parent().map(Path::to_path_buf) else {
        break;
      };

      for (match_index, search_path) in matches {
        // The chain's tail edge marks the level the full pattern matched at;
        // fire when the search path sits at or below the directory the new
        // entry appeared in.
        if !self.has_edge(name_index, *match_index, RequestGraphEdge::InvalidatedByCreateAbove) {
          continue;
        }
        let search_dir = search_path.parent().unwrap_or(search_path.as_path());
        if search_dir.starts_with(&dirname) {
          for owner in self.connected_sources(*match_index, RequestGraphEdge::InvalidatedByCreate)
          {
            self.invalidate_with_memo(owner, InvalidateReason::FILE_CREATE, memo);
          }
        }
      }

      // Climb to the file-name node of the parent directory, while the trie
      // has a matching dirname link.
      let Some(segment) = dirname.file_name().map(|s| s.to_string_lossy().into_owned()) else {
        break;
      };
      let Some(&parent_index) = self.content_keys.get(&file_name_content_key(&segment)) else {
        break;
      };
      if !self.has_edge(name_index, parent_index, RequestGraphEdge::Dirname) {
        break;
      }
      name_index = parent_index;
      current = dirname;
    }
  }

  fn invalidate_glob_matches(&mut self, created: &Path, memo: &mut Option<HashSet<NodeIndex>>) {
    let created = created.to_string_lossy().into_owned();
    for index in self.glob_nodes.iter().copied().collect::<Vec<_>>() {
      let Some(RequestGraphNode::Glob(node)) = self.graph.node_weight(index) else {
        continue;
      };
      if !glob_match::glob_match(&node.pattern, &created) {
        continue;
      }
      for owner in self.connected_sources(index, RequestGraphEdge::InvalidatedByCreate) {
        self.invalidate_with_memo(owner, InvalidateReason::FILE_CREATE, memo);
      }
    }
  }

  /// Re-hash the config keys owned by a touched file and invalidate only the
  /// requests whose sub-key actually changed.
  fn invalidate_config_keys(
    &mut self,
    context: &FsEventsContext<'_>,
    path: &Path,
    deleted: bool,
    memo: &mut Option<HashSet<NodeIndex>>,
  ) {
    let Some(indices) = self.config_key_nodes_by_file.get(path).cloned() else {
      return;
    };

    for index in indices {
      let Some(RequestGraphNode::ConfigKey(node)) = self.graph.node_weight(index) else {
        continue;
      };
      let file_path = node.file_path.clone();
      let key_path = node.key_path.clone();
      let stored_hash = node.content_hash.clone();

      let changed = if deleted {
        true
      } else {
        match context.config_key_hasher.hash_config_key(&file_path, &key_path) {
          Ok(current) => current != stored_hash,
          Err(error) => {
            tracing::warn!(
              file = %file_path.display(),
              key = %key_path,
              %error,
              "failed to re-hash config key; invalidating dependents"
            );
            true
          }
        }
      };
      if !changed {
        continue;
      }

      let reason = if deleted {
        InvalidateReason::FILE_DELETE
      } else {
        InvalidateReason::FILE_UPDATE
      };
      for owner in self.connected_sources(index, RequestGraphEdge::InvalidatedByUpdate) {
        self.invalidate_with_memo(owner, reason, memo);
      }

      if deleted {
        self.remove_node(index, false);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;
  use std::sync::Arc;

  use keystone_core::config_key::JsonConfigKeyHasher;
  use keystone_core::config_key::MockConfigKeyHasher;
  use keystone_core::types::FileCreateInvalidation;
  use keystone_filesystem::FileSystem;
  use keystone_filesystem::InMemoryFileSystem;

  use super::*;

  use crate::request_tracker::request_graph::RequestGraph;
  use keystone_core::types::RequestId;

  const BUDGET: Duration = Duration::from_secs(5);

  fn completed_request(graph: &mut RequestGraph<String>, id: u64) -> NodeIndex {
    let index = graph.ensure_request_node(RequestId::new(id), "test");
    graph.link_to_root(index);
    graph.complete_request(index, Arc::new(format!("result-{id}")), None, Vec::new(), false);
    index
  }

  fn respond(
    graph: &mut RequestGraph<String>,
    events: &[WatchEvent],
  ) -> Result<FsEventsResponse, EventScanBailout> {
    let hasher = MockConfigKeyHasher::new();
    let flags = FeatureFlags::default();
    let context = FsEventsContext {
      project_root: Path::new("/project"),
      config_key_hasher: &hasher,
      feature_flags: &flags,
    };
    graph.respond_to_fs_events(&context, events, BUDGET)
  }

  #[test]
  fn update_event_fires_update_edges_only() {
    let mut graph = RequestGraph::<String>::new();
    let on_update = completed_request(&mut graph, 1);
    let on_delete = completed_request(&mut graph, 2);
    graph.invalidate_on_file_update(on_update, Path::new("/project/a.js"));
    graph.invalidate_on_file_delete(on_delete, Path::new("/project/a.js"));

    let response = respond(&mut graph, &[WatchEvent::update("/project/a.js")]).unwrap();

    assert!(response.did_invalidate);
    assert!(graph.invalid_requests.contains(&on_update));
    assert!(!graph.invalid_requests.contains(&on_delete));
    assert_eq!(
      response.invalidations_by_path.get(Path::new("/project/a.js")),
      Some(&1)
    );
  }

  #[test]
  fn delete_event_fires_update_and_delete_edges_and_drops_the_file_node() {
    let mut graph = RequestGraph::<String>::new();
    let on_update = completed_request(&mut graph, 1);
    let on_delete = completed_request(&mut graph, 2);
    graph.invalidate_on_file_update(on_update, Path::new("/project/a.js"));
    graph.invalidate_on_file_delete(on_delete, Path::new("/project/a.js"));

    respond(&mut graph, &[WatchEvent::delete("/project/a.js")]).unwrap();

    assert!(graph.invalid_requests.contains(&on_update));
    assert!(graph.invalid_requests.contains(&on_delete));
    assert!(!graph
      .content_keys
      .contains_key(&file_content_key(Path::new("/project/a.js"))));
  }

  #[test]
  fn create_of_a_known_path_is_treated_as_an_update() {
    let mut graph = RequestGraph::<String>::new();
    let request = completed_request(&mut graph, 1);
    graph.invalidate_on_file_update(request, Path::new("/project/a.js"));

    // Some platforms report updates as creates.
    let response = respond(&mut graph, &[WatchEvent::create("/project/a.js")]).unwrap();

    assert!(response.did_invalidate);
    assert!(graph.invalid_requests.contains(&request));
  }

  #[test]
  fn create_above_matches_ancestor_directories_of_the_search_path() {
    let mut graph = RequestGraph::<String>::new();
    let request = completed_request(&mut graph, 1);
    graph.invalidate_on_file_create(
      request,
      &FileCreateInvalidation::FileNameAbove {
        file_name: "node_modules".into(),
        above_path: PathBuf::from("/project/src/index.js"),
      },
    );

    let response = respond(
      &mut graph,
      &[WatchEvent::create("/project/node_modules/pkg/index.js")],
    )
    .unwrap();

    assert!(response.did_invalidate);
    assert!(graph.invalid_requests.contains(&request));
  }

  #[test]
  fn create_above_ignores_paths_outside_the_search_chain() {
    let mut graph = RequestGraph::<String>::new();
    let request = completed_request(&mut graph, 1);
    graph.invalidate_on_file_create(
      request,
      &FileCreateInvalidation::FileNameAbove {
        file_name: "node_modules".into(),
        above_path: PathBuf::from("/project/src/index.js"),
      },
    );

    let response = respond(&mut graph, &[WatchEvent::create("/other/node_modules/pkg")]).unwrap();

    assert!(!response.did_invalidate);
    assert!(!graph.invalid_requests.contains(&request));
  }

  #[test]
  fn multi_segment_file_names_match_through_the_trie() {
    let mut graph = RequestGraph::<String>::new();
    let request = completed_request(&mut graph, 1);
    graph.invalidate_on_file_create(
      request,
      &FileCreateInvalidation::FileNameAbove {
        file_name: "node_modules/lodash".into(),
        above_path: PathBuf::from("/project/src/deep/index.js"),
      },
    );

    let miss = respond(
      &mut graph,
      &[WatchEvent::create("/project/node_modules/underscore")],
    )
    .unwrap();
    assert!(!miss.did_invalidate);

    let hit = respond(
      &mut graph,
      &[WatchEvent::create("/project/node_modules/lodash")],
    )
    .unwrap();
    assert!(hit.did_invalidate);
    assert!(graph.invalid_requests.contains(&request));
  }

  #[test]
  fn glob_matches_invalidate_their_owners() {
    let mut graph = RequestGraph::<String>::new();
    let request = completed_request(&mut graph, 1);
    graph.invalidate_on_file_create(
      request,
      &FileCreateInvalidation::Glob("/project/**/*.config.js".into()),
    );

    let miss = respond(&mut graph, &[WatchEvent::create("/project/readme.md")]).unwrap();
    assert!(!miss.did_invalidate);

    let hit = respond(
      &mut graph,
      &[WatchEvent::create("/project/packages/app/jest.config.js")],
    )
    .unwrap();
    assert!(hit.did_invalidate);
  }

  #[test]
  fn config_key_invalidation_is_granular_per_sub_key() {
    let fs = Arc::new(InMemoryFileSystem::default());
    let config = PathBuf::from("/project/package.json");
    fs.write(&config, br#"{"name": "app", "sideEffects": false}"#)
      .unwrap();
    let hasher = JsonConfigKeyHasher::new(fs.clone());

    let mut graph = RequestGraph::<String>::new();
    let request = completed_request(&mut graph, 1);
    let content_hash = hasher.hash_config_key(&config, "sideEffects").unwrap();
    graph.invalidate_on_config_key_change(
      request,
      config.clone(),
      "sideEffects".into(),
      content_hash,
    );

    let flags = FeatureFlags::default();
    let context = FsEventsContext {
      project_root: Path::new("/project"),
      config_key_hasher: &hasher,
      feature_flags: &flags,
    };

    // An edit to an unrelated key leaves the request valid.
    fs.write(&config, br#"{"name": "renamed", "sideEffects": false}"#)
      .unwrap();
    let response = graph
      .respond_to_fs_events(&context, &[WatchEvent::update(&config)], BUDGET)
      .unwrap();
    assert!(!response.did_invalidate);

    fs.write(&config, br#"{"name": "renamed", "sideEffects": true}"#)
      .unwrap();
    let response = graph
      .respond_to_fs_events(&context, &[WatchEvent::update(&config)], BUDGET)
      .unwrap();
    assert!(response.did_invalidate);
    assert!(graph.invalid_requests.contains(&request));
  }

  #[test]
  fn deleting_a_config_file_invalidates_its_key_owners() {
    let fs = Arc::new(InMemoryFileSystem::default());
    let config = PathBuf::from("/project/package.json");
    fs.write(&config, br#"{"sideEffects": false}"#).unwrap();
    let hasher = JsonConfigKeyHasher::new(fs.clone());

    let mut graph = RequestGraph::<String>::new();
    let request = completed_request(&mut graph, 1);
    let content_hash = hasher.hash_config_key(&config, "sideEffects").unwrap();
    graph.invalidate_on_config_key_change(
      request,
      config.clone(),
      "sideEffects".into(),
      content_hash,
    );

    let flags = FeatureFlags::default();
    let context = FsEventsContext {
      project_root: Path::new("/project"),
      config_key_hasher: &hasher,
      feature_flags: &flags,
    };
    let response = graph
      .respond_to_fs_events(&context, &[WatchEvent::delete(&config)], BUDGET)
      .unwrap();

    assert!(response.did_invalidate);
    assert!(graph.invalid_requests.contains(&request));
    assert!(graph.config_key_nodes_by_file.is_empty());
  }

  #[test]
  fn creating_the_project_root_invalidates_everything() {
    let mut graph = RequestGraph::<String>::new();
    let a = completed_request(&mut graph, 1);
    let b = completed_request(&mut graph, 2);

    let response = respond(&mut graph, &[WatchEvent::create("/project")]).unwrap();

    assert!(response.did_invalidate);
    assert!(graph.invalid_requests.contains(&a));
    assert!(graph.invalid_requests.contains(&b));
  }

  #[test]
  fn batch_processing_sweeps_orphans_by_default() {
    let mut graph = RequestGraph::<String>::new();
    let request = completed_request(&mut graph, 1);
    graph.invalidate_on_file_delete(request, Path::new("/project/a.js"));
    graph.invalidate_on_file_update(request, Path::new("/project/b.js"));

    respond(&mut graph, &[WatchEvent::delete("/project/a.js")]).unwrap();

    // Root, the request, and the still-watched b.js file node survive.
    assert_eq!(graph.node_count(), 3);
  }

  #[test]
  fn over_budget_scans_bail_out() {
    let mut graph = RequestGraph::<String>::new();
    let request = completed_request(&mut graph, 1);
    graph.invalidate_on_file_update(request, Path::new("/project/a.js"));

    let events: Vec<WatchEvent> = (0..512)
      .map(|i| WatchEvent::update(format!("/project/src/module-{i}.js")))
      .collect();

    let hasher = MockConfigKeyHasher::new();
    let flags = FeatureFlags::default();
    let context = FsEventsContext {
      project_root: Path::new("/project"),
      config_key_hasher: &hasher,
      feature_flags: &flags,
    };
    let result = graph.respond_to_fs_events(&context, &events, Duration::from_nanos(1));

    assert!(result.is_err());
    let bailout = result.unwrap_err();
    assert_eq!(bailout.event_count, 512);
  }
}
