use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use petgraph::graph::EdgeIndex;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::Dfs;
use petgraph::visit::EdgeRef;
use petgraph::visit::IntoEdgeReferences;
use petgraph::visit::NodeIndexable;
use petgraph::Direction;
use serde::Deserialize;
use serde::Serialize;

use keystone_core::hash::hash_bytes;
use keystone_core::key_path::value_at_key_path;
use keystone_core::types::CacheKey;
use keystone_core::types::ContentKey;
use keystone_core::types::FileCreateInvalidation;
use keystone_core::types::InvalidateReason;
use keystone_core::types::RequestId;
use keystone_core::types::RequestInvalidation;

use super::request::RequestPayload;

/// Split the serialized node array into chunks of this many index slots.
/// Sized so that serializing a single chunk stays within a small wall-clock
/// budget, keeping cache writes interruptible.
pub const NODES_PER_CHUNK: usize = 16_384;

/// Feature flag: defer orphan removal to one sweep after each file-system
/// event batch, and skip nodes already invalidated during the batch. On by
/// default; turning it off restores eager per-edge orphan removal.
pub const DEFERRED_ORPHAN_SWEEP: &str = "deferredOrphanSweep";

/// Feature flag: re-hash config keys for create events too, not only for
/// update and delete events.
pub const CONFIG_KEY_CREATE_INVALIDATION: &str = "configKeyCreateInvalidation";

pub(super) fn root_content_key() -> ContentKey {
  ContentKey::new("root")
}

pub(super) fn file_content_key(path: &Path) -> ContentKey {
  ContentKey::new(format!("file:{}", path.display()))
}

pub(super) fn file_name_content_key(segment: &str) -> ContentKey {
  ContentKey::new(format!("file_name:{segment}"))
}

fn glob_content_key(pattern: &str) -> ContentKey {
  ContentKey::new(format!("glob:{pattern}"))
}

fn env_content_key(key: &str) -> ContentKey {
  ContentKey::new(format!("env:{key}"))
}

fn option_content_key(key: &str) -> ContentKey {
  ContentKey::new(format!("option:{key}"))
}

fn config_key_content_key(file_path: &Path, key_path: &str) -> ContentKey {
  ContentKey::new(format!("config_key:{}:{key_path}", file_path.display()))
}

fn request_content_key(request_id: RequestId) -> ContentKey {
  ContentKey::new(format!("request:{request_id}"))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
  pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileNameNode {
  pub segment: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobNode {
  pub pattern: String,
}

/// Last-known value of one environment variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvNode {
  pub key: String,
  pub value: Option<String>,
}

/// Last-known hash of one (possibly dotted-path) build option.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptionNode {
  pub key: String,
  pub hash: String,
  pub original_value: serde_json::Value,
}

/// Last-known hash of one sub-key inside a config file. Lets a config edit
/// invalidate only the requests that read the touched section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigKeyNode {
  pub file_path: PathBuf,
  pub key_path: String,
  pub content_hash: Option<String>,
}

/// One memoized unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestNode<R> {
  pub id: RequestId,
  pub kind: String,
  pub invalidate_reason: InvalidateReason,
  pub result: Option<Arc<R>>,
  pub result_cache_key: Option<CacheKey>,
}

/// One unit of external state or cached work tracked by the invalidation
/// graph, identified by a stable content key plus a dense graph index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RequestGraphNode<R> {
  Root,
  File(FileNode),
  FileName(FileNameNode),
  Glob(GlobNode),
  Env(EnvNode),
  Option(OptionNode),
  ConfigKey(ConfigKeyNode),
  Request(RequestNode<R>),
}

impl<R> RequestGraphNode<R> {
  pub fn content_key(&self) -> ContentKey {
    match self {
      RequestGraphNode::Root => root_content_key(),
      RequestGraphNode::File(node) => file_content_key(&node.path),
      RequestGraphNode::FileName(node) => file_name_content_key(&node.segment),
      RequestGraphNode::Glob(node) => glob_content_key(&node.pattern),
      RequestGraphNode::Env(node) => env_content_key(&node.key),
      RequestGraphNode::Option(node) => option_content_key(&node.key),
      RequestGraphNode::ConfigKey(node) => config_key_content_key(&node.file_path, &node.key_path),
      RequestGraphNode::Request(node) => request_content_key(node.id),
    }
  }
}

/// Why an edge exists: which kind of state change it routes to which request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RequestGraphEdge {
  /// Parent request to the child request it invoked.
  Subrequest,
  InvalidatedByUpdate,
  InvalidatedByDelete,
  InvalidatedByCreate,
  /// Wiring between a search-path file node and the reversed-segment
  /// file-name trie used for "created above" matching.
  InvalidatedByCreateAbove,
  /// Links consecutive `FileName` segments into the trie.
  Dirname,
}

/// An [`keystone_core::types::Invalidation`] with the observed state resolved
/// at declaration time: the env value, option hash and config-key content
/// hash the request saw while running.
#[derive(Clone, Debug)]
pub(crate) enum ResolvedInvalidation {
  FileUpdate(PathBuf),
  FileDelete(PathBuf),
  FileCreate(FileCreateInvalidation),
  Env {
    key: String,
    value: Option<String>,
  },
  Option {
    key: String,
    hash: String,
    original_value: serde_json::Value,
  },
  ConfigKey {
    file_path: PathBuf,
    key_path: String,
    content_hash: Option<String>,
  },
  Startup,
  Build,
}

/// Controls which build-option changes may invalidate cached work. Noisy
/// options (per-process instance ids and the like) are suppressed here.
#[derive(Clone, Debug, Default)]
pub struct OptionInvalidationPolicy {
  pub ignored_keys: HashSet<String>,
  pub ignored_prefixes: Vec<String>,
}

impl OptionInvalidationPolicy {
  fn is_ignored(&self, key: &str) -> bool {
    self.ignored_keys.contains(key)
      || self
        .ignored_prefixes
        .iter()
        .any(|prefix| key.starts_with(prefix.as_str()))
  }
}

/// One changed option and how many requests it invalidated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptionInvalidation {
  pub key: String,
  pub invalidated_requests: usize,
}

pub(super) fn hash_option_value(value: Option<&serde_json::Value>) -> String {
  match value {
    Some(value) => hash_bytes(value.to_string().as_bytes()),
    None => hash_bytes(b"__absent__"),
  }
}

/// Dirty flags per fixed-size range of node index slots. Any mutation inside
/// a range forces that chunk to be rewritten on the next cache write.
#[derive(Debug)]
pub(super) struct ChunkTracker {
  nodes_per_chunk: usize,
  dirty: Vec<bool>,
}

impl ChunkTracker {
  pub(super) fn new(nodes_per_chunk: usize) -> Self {
    debug_assert!(nodes_per_chunk > 0);
    Self {
      nodes_per_chunk,
      dirty: Vec::new(),
    }
  }

  pub(super) fn nodes_per_chunk(&self) -> usize {
    self.nodes_per_chunk
  }

  pub(super) fn mark_dirty(&mut self, index: NodeIndex) {
    let chunk = index.index() / self.nodes_per_chunk;
    if chunk >= self.dirty.len() {
      // Chunks that come into existence start dirty.
      self.dirty.resize(chunk + 1, true);
    }
    self.dirty[chunk] = true;
  }

  /// Chunks needing a rewrite, given the current chunk count. Chunks the
  /// tracker has never seen are treated as dirty.
  pub(super) fn dirty_chunks(&self, chunk_count: usize) -> Vec<usize> {
    (0..chunk_count)
      .filter(|chunk| self.dirty.get(*chunk).copied().unwrap_or(true))
      .collect()
  }

  pub(super) fn mark_clean(&mut self, chunks: &[usize], chunk_count: usize) {
    if self.dirty.len() < chunk_count {
      self.dirty.resize(chunk_count, true);
    }
    for chunk in chunks {
      if *chunk < self.dirty.len() {
        self.dirty[*chunk] = false;
      }
    }
  }

  pub(super) fn mark_all_clean(&mut self, chunk_count: usize) {
    self.dirty = vec![false; chunk_count];
  }
}

/// The invalidation graph: one node per unit of external state (file, glob,
/// file-name segment, env var, build option, config key) and one per cached
/// request, with typed edges recording why a request goes stale when a piece
/// of state changes.
///
/// The graph exclusively owns node storage; callers address nodes through
/// indices and get views or short-lived mutable handles, never retained
/// references.
pub struct RequestGraph<R: RequestPayload> {
  pub(super) graph: StableDiGraph<RequestGraphNode<R>, RequestGraphEdge>,
  pub(super) root: NodeIndex,
  pub(super) content_keys: HashMap<ContentKey, NodeIndex>,
  pub(super) invalid_requests: HashSet<NodeIndex>,
  pub(super) incomplete_requests: HashSet<NodeIndex>,
  pub(super) glob_nodes: HashSet<NodeIndex>,
  pub(super) env_nodes: HashSet<NodeIndex>,
  pub(super) option_nodes: HashSet<NodeIndex>,
  pub(super) unpredictable_requests: HashSet<NodeIndex>,
  pub(super) on_build_requests: HashSet<NodeIndex>,
  pub(super) config_key_nodes_by_file: HashMap<PathBuf, HashSet<NodeIndex>>,
  pub(super) chunks: ChunkTracker,
}

impl<R: RequestPayload> Default for RequestGraph<R> {
  fn default() -> Self {
    Self::new()
  }
}

impl<R: RequestPayload> RequestGraph<R> {
  pub fn new() -> Self {
    Self::with_chunk_size(NODES_PER_CHUNK)
  }

  pub fn with_chunk_size(nodes_per_chunk: usize) -> Self {
    let mut graph = StableDiGraph::new();
    let root = graph.add_node(RequestGraphNode::Root);

    let mut content_keys = HashMap::new();
    content_keys.insert(root_content_key(), root);

    let mut chunks = ChunkTracker::new(nodes_per_chunk);
    chunks.mark_dirty(root);

    RequestGraph {
      graph,
      root,
      content_keys,
      invalid_requests: HashSet::new(),
      incomplete_requests: HashSet::new(),
      glob_nodes: HashSet::new(),
      env_nodes: HashSet::new(),
      option_nodes: HashSet::new(),
      unpredictable_requests: HashSet::new(),
      on_build_requests: HashSet::new(),
      config_key_nodes_by_file: HashMap::new(),
      chunks,
    }
  }

  pub fn root(&self) -> NodeIndex {
    self.root
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  /// Upper bound of node index slots, including vacancies left by removals.
  pub(super) fn total_slots(&self) -> usize {
    self.graph.node_bound()
  }

  /// Idempotent by content key: re-adding a node that already exists returns
  /// the existing index and changes nothing, including a request node's
  /// stored result.
  pub fn add_node(&mut self, node: RequestGraphNode<R>) -> NodeIndex {
    let content_key = node.content_key();
    if let Some(existing) = self.content_keys.get(&content_key) {
      return *existing;
    }

    let index = self.graph.add_node(node);
    self.content_keys.insert(content_key, index);
    self.chunks.mark_dirty(index);

    match self.graph.node_weight(index) {
      Some(RequestGraphNode::Glob(_)) => {
        self.glob_nodes.insert(index);
      }
      Some(RequestGraphNode::Env(_)) => {
        self.env_nodes.insert(index);
      }
      Some(RequestGraphNode::Option(_)) => {
        self.option_nodes.insert(index);
      }
      Some(RequestGraphNode::ConfigKey(node)) => {
        let file_path = node.file_path.clone();
        self
          .config_key_nodes_by_file
          .entry(file_path)
          .or_default()
          .insert(index);
      }
      _ => {}
    }

    index
  }

  /// Remove a node and all incident edges. With `remove_orphans`, any
  /// neighbour left without incoming edges is removed too, recursively, so
  /// file-name trie and glob nodes do not leak across builds where a
  /// dependency disappears.
  pub fn remove_node(&mut self, index: NodeIndex, remove_orphans: bool) {
    if index == self.root {
      debug_assert!(false, "attempted to remove the graph root");
      return;
    }

    let neighbors: Vec<NodeIndex> = self.graph.neighbors_undirected(index).collect();

    let removed_info = self.graph.node_weight(index).map(|node| {
      let config_file = match node {
        RequestGraphNode::ConfigKey(node) => Some(node.file_path.clone()),
        _ => None,
      };
      (node.content_key(), config_file)
    });

    if let Some((content_key, config_file)) = removed_info {
      self.content_keys.remove(&content_key);
      if let Some(file_path) = config_file {
        if let Some(nodes) = self.config_key_nodes_by_file.get_mut(&file_path) {
          nodes.remove(&index);
          if nodes.is_empty() {
            self.config_key_nodes_by_file.remove(&file_path);
          }
        }
      }
    }

    self.invalid_requests.remove(&index);
    self.incomplete_requests.remove(&index);
    self.glob_nodes.remove(&index);
    self.env_nodes.remove(&index);
    self.option_nodes.remove(&index);
    self.unpredictable_requests.remove(&index);
    self.on_build_requests.remove(&index);

    self.graph.remove_node(index);
    self.chunks.mark_dirty(index);

    if remove_orphans {
      for neighbor in neighbors {
        if neighbor == self.root || self.graph.node_weight(neighbor).is_none() {
          continue;
        }
        if self.is_orphaned(neighbor) {
          self.remove_node(neighbor, true);
        }
      }
    }
  }

  fn is_orphaned(&self, index: NodeIndex) -> bool {
    self
      .graph
      .edges_directed(index, Direction::Incoming)
      .next()
      .is_none()
  }

  /// Remove every node no longer reachable from the root.
  pub fn sweep_orphans(&mut self) {
    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&self.graph, self.root);
    while let Some(index) = dfs.next(&self.graph) {
      reachable.insert(index);
    }

    let unreachable: Vec<NodeIndex> = self
      .graph
      .node_indices()
      .filter(|index| !reachable.contains(index))
      .collect();
    for index in unreachable {
      if self.graph.node_weight(index).is_some() {
        self.remove_node(index, false);
      }
    }
  }

  pub(super) fn has_edge(&self, from: NodeIndex, to: NodeIndex, edge: RequestGraphEdge) -> bool {
    self
      .graph
      .edges_connecting(from, to)
      .any(|reference| *reference.weight() == edge)
  }

  pub(super) fn ensure_edge(&mut self, from: NodeIndex, to: NodeIndex, edge: RequestGraphEdge) {
    if !self.has_edge(from, to, edge) {
      self.graph.add_edge(from, to, edge);
    }
  }

  /// Sources of incoming edges of the given type.
  pub(super) fn connected_sources(
    &self,
    index: NodeIndex,
    edge: RequestGraphEdge,
  ) -> Vec<NodeIndex> {
    self
      .graph
      .edges_directed(index, Direction::Incoming)
      .filter(|reference| *reference.weight() == edge)
      .map(|reference| reference.source())
      .collect()
  }

  /// Targets of outgoing edges of the given type.
  pub(super) fn connected_targets(
    &self,
    index: NodeIndex,
    edge: RequestGraphEdge,
  ) -> Vec<NodeIndex> {
    self
      .graph
      .edges_directed(index, Direction::Outgoing)
      .filter(|reference| *reference.weight() == edge)
      .map(|reference| reference.target())
      .collect()
  }

  pub fn request_index(&self, request_id: RequestId) -> Option<NodeIndex> {
    self
      .content_keys
      .get(&request_content_key(request_id))
      .copied()
  }

  /// Add the request node on first reference. New requests start invalid so
  /// they run on the initial build.
  pub(super) fn ensure_request_node(&mut self, request_id: RequestId, kind: &str) -> NodeIndex {
    if let Some(index) = self.request_index(request_id) {
      return index;
    }

    let index = self.add_node(RequestGraphNode::Request(RequestNode {
      id: request_id,
      kind: kind.to_string(),
      invalidate_reason: InvalidateReason::INITIAL_BUILD,
      result: None,
      result_cache_key: None,
    }));
    self.invalid_requests.insert(index);
    index
  }

  pub(super) fn request_node(&self, index: NodeIndex) -> &RequestNode<R> {
    match self.graph.node_weight(index) {
      Some(RequestGraphNode::Request(node)) => node,
      other => panic!("expected a request node at {index:?}, found {other:?}"),
    }
  }

  pub(super) fn request_node_mut(&mut self, index: NodeIndex) -> &mut RequestNode<R> {
    match self.graph.node_weight_mut(index) {
      Some(RequestGraphNode::Request(node)) => node,
      other => panic!("expected a request node at {index:?}, found {other:?}"),
    }
  }

  pub(super) fn is_valid(&self, index: NodeIndex) -> bool {
    if self.invalid_requests.contains(&index) || self.incomplete_requests.contains(&index) {
      return false;
    }
    match self.graph.node_weight(index) {
      Some(RequestGraphNode::Request(node)) => {
        node.result.is_some() || node.result_cache_key.is_some()
      }
      _ => false,
    }
  }

  pub(super) fn stored_result(&self, index: NodeIndex) -> (Option<Arc<R>>, Option<CacheKey>) {
    let node = self.request_node(index);
    (node.result.clone(), node.result_cache_key.clone())
  }

  /// Put a result loaded back from the blob store onto its node so the next
  /// read is served from memory. The chunk is not marked dirty: with
  /// `result_cache_key` set the result is stripped again at serialization
  /// time, so the persisted form is unchanged.
  pub(super) fn store_hydrated_result(&mut self, request_id: RequestId, result: Arc<R>) {
    if let Some(index) = self.request_index(request_id) {
      self.request_node_mut(index).result = Some(result);
    }
  }

  pub(super) fn start_request(&mut self, index: NodeIndex) {
    self.invalid_requests.remove(&index);
    self.incomplete_requests.insert(index);
    self.chunks.mark_dirty(index);
  }

  /// The run was aborted before settling; leave the node stale so the next
  /// build retries it.
  pub(super) fn abandon_request(&mut self, index: NodeIndex) {
    self.incomplete_requests.remove(&index);
    self.invalid_requests.insert(index);
    self.chunks.mark_dirty(index);
  }

  pub(super) fn fail_request(&mut self, index: NodeIndex) {
    self.incomplete_requests.remove(&index);
    self.invalidate_node(index, InvalidateReason::ERROR);
  }

  pub(super) fn complete_request(
    &mut self,
    index: NodeIndex,
    result: Arc<R>,
    cache_key: Option<CacheKey>,
    invalidations: Vec<ResolvedInvalidation>,
    eager_orphans: bool,
  ) {
    self.clear_invalidation_edges(index, eager_orphans);
    self.unpredictable_requests.remove(&index);
    self.on_build_requests.remove(&index);

    for invalidation in invalidations {
      match invalidation {
        ResolvedInvalidation::FileUpdate(path) => self.invalidate_on_file_update(index, &path),
        ResolvedInvalidation::FileDelete(path) => self.invalidate_on_file_delete(index, &path),
        ResolvedInvalidation::FileCreate(input) => self.invalidate_on_file_create(index, &input),
        ResolvedInvalidation::Env { key, value } => {
          self.invalidate_on_env_change(index, key, value)
        }
        ResolvedInvalidation::Option {
          key,
          hash,
          original_value,
        } => self.invalidate_on_option_change(index, key, hash, original_value),
        ResolvedInvalidation::ConfigKey {
          file_path,
          key_path,
          content_hash,
        } => self.invalidate_on_config_key_change(index, file_path, key_path, content_hash),
        ResolvedInvalidation::Startup => {
          self.unpredictable_requests.insert(index);
        }
        ResolvedInvalidation::Build => {
          self.on_build_requests.insert(index);
        }
      }
    }

    let node = self.request_node_mut(index);
    node.invalidate_reason = InvalidateReason::empty();
    node.result = Some(result);
    node.result_cache_key = cache_key;

    self.invalid_requests.remove(&index);
    self.incomplete_requests.remove(&index);
    self.chunks.mark_dirty(index);
  }

  /// Drop the invalidation edges a previous run declared. Called on
  /// successful completion only, so a failed run keeps reacting to the state
  /// it had declared before.
  fn clear_invalidation_edges(&mut self, index: NodeIndex, remove_orphans: bool) {
    let edges: Vec<(EdgeIndex, NodeIndex)> = self
      .graph
      .edges_directed(index, Direction::Outgoing)
      .filter(|reference| {
        matches!(
          reference.weight(),
          RequestGraphEdge::InvalidatedByUpdate
            | RequestGraphEdge::InvalidatedByDelete
            | RequestGraphEdge::InvalidatedByCreate
        )
      })
      .map(|reference| (reference.id(), reference.target()))
      .collect();

    for (edge, _) in &edges {
      self.graph.remove_edge(*edge);
    }

    if remove_orphans {
      for (_, target) in edges {
        if self.graph.node_weight(target).is_some() && self.is_orphaned(target) {
          self.remove_node(target, true);
        }
      }
    }
  }

  pub(super) fn link_subrequest(&mut self, parent: NodeIndex, child: NodeIndex) {
    self.ensure_edge(parent, child, RequestGraphEdge::Subrequest);
  }

  pub(super) fn link_to_root(&mut self, child: NodeIndex) {
    self.ensure_edge(self.root, child, RequestGraphEdge::Subrequest);
  }

  /// Replace a request's sub-request edges with exactly the set invoked
  /// during its latest run. Stale edges from a structurally different
  /// previous run must not linger.
  pub(super) fn replace_subrequests(
    &mut self,
    index: NodeIndex,
    sub_requests: &[RequestId],
    eager_orphans: bool,
  ) {
    let old: Vec<(EdgeIndex, NodeIndex)> = self
      .graph
      .edges_directed(index, Direction::Outgoing)
      .filter(|reference| *reference.weight() == RequestGraphEdge::Subrequest)
      .map(|reference| (reference.id(), reference.target()))
      .collect();
    for (edge, _) in &old {
      self.graph.remove_edge(*edge);
    }

    let mut seen = HashSet::new();
    for request_id in sub_requests {
      if !seen.insert(*request_id) {
        continue;
      }
      if let Some(child) = self.request_index(*request_id) {
        self.link_subrequest(index, child);
      }
    }

    if eager_orphans {
      for (_, target) in old {
        if self.graph.node_weight(target).is_some() && self.is_orphaned(target) {
          self.remove_node(target, true);
        }
      }
    }
  }

  /// Mark a request invalid and propagate to every ancestor that invoked it,
  /// transitively: a child's staleness must be visible to all its callers in
  /// one call.
  pub fn invalidate_node(&mut self, index: NodeIndex, reason: InvalidateReason) {
    let Some(RequestGraphNode::Request(node)) = self.graph.node_weight_mut(index) else {
      debug_assert!(false, "invalidate_node called on a non-request node");
      return;
    };

    let already_recorded =
      node.invalidate_reason.contains(reason) && self.invalid_requests.contains(&index);
    node.invalidate_reason |= reason;
    self.invalid_requests.insert(index);
    self.chunks.mark_dirty(index);

    if already_recorded {
      // Ancestors were walked when this reason was first recorded.
      return;
    }

    let parents: Vec<NodeIndex> = self
      .connected_sources(index, RequestGraphEdge::Subrequest)
      .into_iter()
      .filter(|parent| *parent != self.root)
      .collect();
    for parent in parents {
      self.invalidate_node(parent, reason);
    }
  }

  /// Force-invalidate requests whose correctness cannot be derived from
  /// declared state. Called once per process start.
  pub fn invalidate_unpredictable_nodes(&mut self) {
    for index in self.unpredictable_requests.clone() {
      self.invalidate_node(index, InvalidateReason::STARTUP);
    }
  }

  /// Force-invalidate requests that opted into re-running on every build.
  pub fn invalidate_on_build_nodes(&mut self) {
    for index in self.on_build_requests.clone() {
      self.invalidate_node(index, InvalidateReason::STARTUP);
    }
  }

  /// Diff every env node against the current environment; invalidate
  /// dependents of changed variables and report the changed keys.
  pub fn invalidate_env_nodes(
    &mut self,
    env: &std::collections::BTreeMap<String, String>,
  ) -> Vec<String> {
    let mut changed = Vec::new();
    for index in self.env_nodes.iter().copied().collect::<Vec<_>>() {
      let Some(RequestGraphNode::Env(node)) = self.graph.node_weight(index) else {
        continue;
      };
      let key = node.key.clone();
      let stored = node.value.clone();

      if env.get(&key).cloned() == stored {
        continue;
      }
      tracing::debug!(%key, "environment variable changed");
      changed.push(key);
      for owner in self.connected_sources(index, RequestGraphEdge::InvalidatedByUpdate) {
        self.invalidate_node(owner, InvalidateReason::ENV_CHANGE);
      }
    }
    changed
  }

  /// Diff every option node against the current option document, honouring
  /// the ignore policy. Returns the changed options ordered by how many
  /// requests each one invalidated.
  pub fn invalidate_option_nodes(
    &mut self,
    options: &serde_json::Value,
    policy: &OptionInvalidationPolicy,
  ) -> Vec<OptionInvalidation> {
    let mut changed: Vec<OptionInvalidation> = Vec::new();
    for index in self.option_nodes.iter().copied().collect::<Vec<_>>() {
      let Some(RequestGraphNode::Option(node)) = self.graph.node_weight(index) else {
        continue;
      };
      let key = node.key.clone();
      let stored_hash = node.hash.clone();

      if policy.is_ignored(&key) {
        continue;
      }
      if hash_option_value(value_at_key_path(options, &key)) == stored_hash {
        continue;
      }

      let owners = self.connected_sources(index, RequestGraphEdge::InvalidatedByUpdate);
      let invalidated_requests = owners.len();
      for owner in owners {
        self.invalidate_node(owner, InvalidateReason::OPTION_CHANGE);
      }
      changed.push(OptionInvalidation {
        key,
        invalidated_requests,
      });
    }

    changed.sort_by(|a, b| {
      b.invalidated_requests
        .cmp(&a.invalidated_requests)
        .then_with(|| a.key.cmp(&b.key))
    });
    changed
  }

  /// Read-only view of a request's currently declared update triggers.
  pub fn get_invalidations(&self, request_id: RequestId) -> Vec<RequestInvalidation> {
    let Some(index) = self.request_index(request_id) else {
      return Vec::new();
    };

    self
      .graph
      .edges_directed(index, Direction::Outgoing)
      .filter(|reference| *reference.weight() == RequestGraphEdge::InvalidatedByUpdate)
      .filter_map(|reference| match self.graph.node_weight(reference.target()) {
        Some(RequestGraphNode::File(node)) => Some(RequestInvalidation::File(node.path.clone())),
        Some(RequestGraphNode::Env(node)) => Some(RequestInvalidation::Env(node.key.clone())),
        Some(RequestGraphNode::Option(node)) => {
          Some(RequestInvalidation::Option(node.key.clone()))
        }
        Some(RequestGraphNode::ConfigKey(node)) => Some(RequestInvalidation::ConfigKey {
          file_path: node.file_path.clone(),
          key_path: node.key_path.clone(),
        }),
        _ => None,
      })
      .collect()
  }

  pub fn invalid_request_ids(&self) -> Vec<RequestId> {
    self
      .invalid_requests
      .iter()
      .filter_map(|index| match self.graph.node_weight(*index) {
        Some(RequestGraphNode::Request(node)) => Some(node.id),
        _ => None,
      })
      .collect()
  }

  pub(super) fn invalidate_on_file_update(&mut self, request: NodeIndex, path: &Path) {
    let file = self.add_node(RequestGraphNode::File(FileNode {
      path: path.to_path_buf(),
    }));
    self.ensure_edge(request, file, RequestGraphEdge::InvalidatedByUpdate);
  }

  pub(super) fn invalidate_on_file_delete(&mut self, request: NodeIndex, path: &Path) {
    let file = self.add_node(RequestGraphNode::File(FileNode {
      path: path.to_path_buf(),
    }));
    self.ensure_edge(request, file, RequestGraphEdge::InvalidatedByDelete);
  }

  pub(super) fn invalidate_on_file_create(
    &mut self,
    request: NodeIndex,
    input: &FileCreateInvalidation,
  ) {
    let target = match input {
      FileCreateInvalidation::Path(path) => self.add_node(RequestGraphNode::File(FileNode {
        path: path.clone(),
      })),
      FileCreateInvalidation::Glob(pattern) => self.add_node(RequestGraphNode::Glob(GlobNode {
        pattern: pattern.clone(),
      })),
      FileCreateInvalidation::FileNameAbove {
        file_name,
        above_path,
      } => {
        // One trie node per reversed path segment. Shared segments (e.g.
        // "node_modules") are deduplicated across patterns, so common
        // sub-paths cost one node regardless of how many requests watch them.
        let mut first = None;
        let mut last: Option<NodeIndex> = None;
        for segment in file_name.split('/').rev().filter(|s| !s.is_empty()) {
          let segment_index = self.add_node(RequestGraphNode::FileName(FileNameNode {
            segment: segment.to_string(),
          }));
          if let Some(previous) = last {
            self.ensure_edge(previous, segment_index, RequestGraphEdge::Dirname);
          }
          first.get_or_insert(segment_index);
          last = Some(segment_index);
        }

        let above = self.add_node(RequestGraphNode::File(FileNode {
          path: above_path.clone(),
        }));
        if let (Some(first), Some(last)) = (first, last) {
          // The search path points at the head of the chain; the tail points
          // back at the search path, closing the loop the matcher follows.
          self.ensure_edge(above, first, RequestGraphEdge::InvalidatedByCreateAbove);
          self.ensure_edge(last, above, RequestGraphEdge::InvalidatedByCreateAbove);
        }
        above
      }
    };
    self.ensure_edge(request, target, RequestGraphEdge::InvalidatedByCreate);
  }

  pub(super) fn invalidate_on_env_change(
    &mut self,
    request: NodeIndex,
    key: String,
    value: Option<String>,
  ) {
    let env = self.add_node(RequestGraphNode::Env(EnvNode { key, value }));
    self.ensure_edge(request, env, RequestGraphEdge::InvalidatedByUpdate);
  }

  pub(super) fn invalidate_on_option_change(
    &mut self,
    request: NodeIndex,
    key: String,
    hash: String,
    original_value: serde_json::Value,
  ) {
    let option = self.add_node(RequestGraphNode::Option(OptionNode {
      key,
      hash,
      original_value,
    }));
    self.ensure_edge(request, option, RequestGraphEdge::InvalidatedByUpdate);
  }

  pub(super) fn invalidate_on_config_key_change(
    &mut self,
    request: NodeIndex,
    file_path: PathBuf,
    key_path: String,
    content_hash: Option<String>,
  ) {
    let config_key = self.add_node(RequestGraphNode::ConfigKey(ConfigKeyNode {
      file_path,
      key_path,
      content_hash,
    }));
    self.ensure_edge(request, config_key, RequestGraphEdge::InvalidatedByUpdate);
  }
}

impl<R: RequestPayload> PartialEq for RequestGraph<R> {
  fn eq(&self, other: &Self) -> bool {
    fn sorted_indices(set: &HashSet<NodeIndex>) -> Vec<usize> {
      let mut indices: Vec<usize> = set.iter().map(|index| index.index()).collect();
      indices.sort_unstable();
      indices
    }

    if self.root != other.root || self.total_slots() != other.total_slots() {
      return false;
    }

    for slot in 0..self.total_slots() {
      let index = NodeIndex::new(slot);
      if self.graph.node_weight(index) != other.graph.node_weight(index) {
        return false;
      }
    }

    fn sorted_edges<R: RequestPayload>(
      graph: &StableDiGraph<RequestGraphNode<R>, RequestGraphEdge>,
    ) -> Vec<(usize, usize, RequestGraphEdge)> {
      let mut edges: Vec<(usize, usize, RequestGraphEdge)> = graph
        .edge_references()
        .map(|reference| {
          (
            reference.source().index(),
            reference.target().index(),
            *reference.weight(),
          )
        })
        .collect();
      edges.sort_unstable();
      edges
    }

    sorted_edges(&self.graph) == sorted_edges(&other.graph)
      && sorted_indices(&self.invalid_requests) == sorted_indices(&other.invalid_requests)
      && sorted_indices(&self.unpredictable_requests)
        == sorted_indices(&other.unpredictable_requests)
      && sorted_indices(&self.on_build_requests) == sorted_indices(&other.on_build_requests)
  }
}
