use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::Hash;
use std::hash::Hasher;

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::visit::IntoEdgeReferences;
use serde::Deserialize;
use serde::Serialize;

use keystone_cache::Cache;
use keystone_cache::CacheRef;
use keystone_core::hash::IdentifierHasher;
use keystone_core::types::BuildOptions;
use keystone_core::types::CacheKey;
use keystone_core::types::RequestId;

use super::request::RequestPayload;
use super::request_graph::ChunkTracker;
use super::request_graph::RequestGraph;
use super::request_graph::RequestGraphEdge;
use super::request_graph::RequestGraphNode;

/// Bumped whenever the persisted layout changes; a mismatch discards the
/// whole generation.
pub(super) const CACHE_FORMAT_VERSION: u32 = 1;

/// Results above this serialized size are written as standalone blobs and
/// stripped from their node, so the graph chunks stay small.
pub(super) const LARGE_RESULT_THRESHOLD: usize = 64 * 1024;

/// Namespaced keys for one cache generation, derived from the format version
/// and the build inputs that make generations incompatible.
#[derive(Clone, Debug)]
pub struct CacheKeys {
  base: String,
}

impl CacheKeys {
  pub fn new(options: &BuildOptions) -> Self {
    let mut hasher = IdentifierHasher::default();
    options.entries.hash(&mut hasher);
    options.mode.hash(&mut hasher);
    options.should_build_lazily.hash(&mut hasher);
    options.watch_backend.hash(&mut hasher);

    CacheKeys {
      base: format!(
        "request-graph/v{CACHE_FORMAT_VERSION}/{:016x}",
        hasher.finish()
      ),
    }
  }

  pub fn header(&self) -> CacheKey {
    CacheKey::new(format!("{}/header", self.base))
  }

  pub fn chunk(&self, chunk: usize) -> CacheKey {
    CacheKey::new(format!("{}/chunk/{chunk}", self.base))
  }

  pub fn result(&self, request_id: RequestId) -> CacheKey {
    CacheKey::new(format!("{}/result/{request_id}", self.base))
  }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheLoadError {
  #[error("no cache generation found")]
  Missing,
  #[error("cache generation has format version {found}, expected {expected}")]
  VersionMismatch { found: u32, expected: u32 },
  #[error("corrupt cache generation: {0}")]
  Corrupt(String),
  #[error("cache read failed: {0}")]
  Io(anyhow::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct SerializedEdge {
  from: u32,
  to: u32,
  kind: RequestGraphEdge,
}

/// Top-level record of one cache generation: how many nodes live in each
/// chunk, the edge list, and the index sets that cannot be derived from node
/// payloads alone.
#[derive(Debug, Serialize, Deserialize)]
struct GraphHeader {
  version: u32,
  nodes_per_chunk: usize,
  total_slots: usize,
  chunk_node_counts: Vec<usize>,
  root: u32,
  edges: Vec<SerializedEdge>,
  invalid_requests: Vec<u32>,
  unpredictable_requests: Vec<u32>,
  on_build_requests: Vec<u32>,
}

/// Everything one cache write has to put into the blob store.
pub(super) struct CachePayload {
  /// Dirty chunks only: `(chunk index, key, bytes)`.
  pub chunks: Vec<(usize, CacheKey, Vec<u8>)>,
  /// Results serialized into standalone blobs during this write.
  pub result_blobs: Vec<(CacheKey, Vec<u8>)>,
  pub header_key: CacheKey,
  pub header: Vec<u8>,
  /// Results to strip from the in-memory nodes once the write commits.
  /// Stripping earlier would lose the payload if the write aborts before
  /// the blob lands.
  pub stripped: Vec<(RequestId, CacheKey)>,
}

fn sorted_u32(set: &HashSet<NodeIndex>) -> Vec<u32> {
  let mut indices: Vec<u32> = set.iter().map(|index| index.index() as u32).collect();
  indices.sort_unstable();
  indices
}

impl<R: RequestPayload> RequestGraph<R> {
  fn chunk_count(&self) -> usize {
    (self.total_slots().div_ceil(self.chunks.nodes_per_chunk())).max(1)
  }

  /// Serialize the header plus every dirty chunk. Large or externally keyed
  /// request results become standalone blobs and are serialized out of their
  /// node; the graph itself is not mutated until [`Self::apply_stripped`].
  pub(super) fn collect_cache_payload(&self, keys: &CacheKeys) -> anyhow::Result<CachePayload> {
    let nodes_per_chunk = self.chunks.nodes_per_chunk();
    let total_slots = self.total_slots();
    let chunk_count = self.chunk_count();
    let dirty: HashSet<usize> = self.chunks.dirty_chunks(chunk_count).into_iter().collect();

    let mut result_blobs = Vec::new();
    let mut stripped = Vec::new();
    let mut chunks = Vec::new();
    let mut chunk_node_counts = vec![0usize; chunk_count];

    for chunk in 0..chunk_count {
      let start = chunk * nodes_per_chunk;
      let end = (start + nodes_per_chunk).min(total_slots);

      if !dirty.contains(&chunk) {
        chunk_node_counts[chunk] = (start..end)
          .filter(|slot| self.graph.node_weight(NodeIndex::new(*slot)).is_some())
          .count();
        continue;
      }

      let mut slots: Vec<Option<RequestGraphNode<R>>> = Vec::with_capacity(end - start);
      for slot in start..end {
        let mut entry = self.graph.node_weight(NodeIndex::new(slot)).cloned();
        if let Some(RequestGraphNode::Request(node)) = entry.as_mut() {
          if let Some(result) = node.result.as_ref() {
            let bytes = serde_json::to_vec(result.as_ref())?;
            if node.result_cache_key.is_some() || bytes.len() > LARGE_RESULT_THRESHOLD {
              let key = node
                .result_cache_key
                .clone()
                .unwrap_or_else(|| keys.result(node.id));
              node.result = None;
              node.result_cache_key = Some(key.clone());
              result_blobs.push((key.clone(), bytes));
              stripped.push((node.id, key));
            }
          }
        }
        slots.push(entry);
      }

      chunk_node_counts[chunk] = slots.iter().filter(|slot| slot.is_some()).count();
      chunks.push((chunk, keys.chunk(chunk), serde_json::to_vec(&slots)?));
    }

    let edges: Vec<SerializedEdge> = self
      .graph
      .edge_references()
      .map(|reference| SerializedEdge {
        from: reference.source().index() as u32,
        to: reference.target().index() as u32,
        kind: *reference.weight(),
      })
      .collect();

    // In-flight runs are not resumable across processes; persist them as
    // invalid so they re-run.
    let invalid_requests: HashSet<NodeIndex> = self
      .invalid_requests
      .union(&self.incomplete_requests)
      .copied()
      .collect();

    let header = GraphHeader {
      version: CACHE_FORMAT_VERSION,
      nodes_per_chunk,
      total_slots,
      chunk_node_counts,
      root: self.root.index() as u32,
      edges,
      invalid_requests: sorted_u32(&invalid_requests),
      unpredictable_requests: sorted_u32(&self.unpredictable_requests),
      on_build_requests: sorted_u32(&self.on_build_requests),
    };

    Ok(CachePayload {
      chunks,
      result_blobs,
      header_key: keys.header(),
      header: serde_json::to_vec(&header)?,
      stripped,
    })
  }

  pub(super) fn mark_chunks_clean(&mut self, chunks: &[usize]) {
    let chunk_count = self.chunk_count();
    self.chunks.mark_clean(chunks, chunk_count);
  }

  /// Drop offloaded results from their in-memory nodes. Called after the
  /// write that persisted them committed; reads fall back to the blob store
  /// from here on.
  pub(super) fn apply_stripped(&mut self, stripped: &[(RequestId, CacheKey)]) {
    for (request_id, key) in stripped {
      if let Some(index) = self.request_index(*request_id) {
        let node = self.request_node_mut(index);
        node.result = None;
        node.result_cache_key = Some(key.clone());
      }
    }
  }

  /// Reconstruct a graph from a persisted generation.
  ///
  /// Dense indices are preserved exactly: vacant slots get a placeholder
  /// node that is removed again immediately, so every occupied index lands
  /// where the header's edge list expects it.
  pub(super) fn load_from_cache(
    cache: &CacheRef,
    keys: &CacheKeys,
  ) -> Result<RequestGraph<R>, CacheLoadError> {
    let header_bytes = cache
      .get_blob(&keys.header())
      .map_err(CacheLoadError::Io)?
      .ok_or(CacheLoadError::Missing)?;
    let header: GraphHeader = serde_json::from_slice(&header_bytes)
      .map_err(|error| CacheLoadError::Corrupt(format!("header: {error}")))?;

    if header.version != CACHE_FORMAT_VERSION {
      return Err(CacheLoadError::VersionMismatch {
        found: header.version,
        expected: CACHE_FORMAT_VERSION,
      });
    }
    if header.nodes_per_chunk == 0 {
      return Err(CacheLoadError::Corrupt("zero chunk size".into()));
    }

    let chunk_count = (header.total_slots.div_ceil(header.nodes_per_chunk)).max(1);
    if header.chunk_node_counts.len() != chunk_count {
      return Err(CacheLoadError::Corrupt(format!(
        "header declares {} chunk counts for {chunk_count} chunks",
        header.chunk_node_counts.len()
      )));
    }

    let mut slots: Vec<Option<RequestGraphNode<R>>> = Vec::with_capacity(header.total_slots);
    for chunk in 0..chunk_count {
      let bytes = cache
        .get_blob(&keys.chunk(chunk))
        .map_err(CacheLoadError::Io)?
        .ok_or_else(|| CacheLoadError::Corrupt(format!("missing chunk {chunk}")))?;
      let chunk_slots: Vec<Option<RequestGraphNode<R>>> = serde_json::from_slice(&bytes)
        .map_err(|error| CacheLoadError::Corrupt(format!("chunk {chunk}: {error}")))?;

      let occupied = chunk_slots.iter().filter(|slot| slot.is_some()).count();
      if occupied != header.chunk_node_counts[chunk] {
        return Err(CacheLoadError::Corrupt(format!(
          "chunk {chunk} holds {occupied} nodes, header declares {}",
          header.chunk_node_counts[chunk]
        )));
      }
      slots.extend(chunk_slots);
    }
    if slots.len() != header.total_slots {
      return Err(CacheLoadError::Corrupt(format!(
        "chunks hold {} slots, header declares {}",
        slots.len(),
        header.total_slots
      )));
    }

    let mut graph = StableDiGraph::new();
    let mut content_keys = HashMap::new();
    let mut placeholders = Vec::new();
    for (slot, entry) in slots.into_iter().enumerate() {
      match entry {
        Some(node) => {
          let content_key = node.content_key();
          let index = graph.add_node(node);
          debug_assert_eq!(index.index(), slot);
          content_keys.insert(content_key, index);
        }
        None => {
          placeholders.push(graph.add_node(RequestGraphNode::Root));
        }
      }
    }
    for placeholder in placeholders {
      graph.remove_node(placeholder);
    }

    for edge in &header.edges {
      let from = NodeIndex::new(edge.from as usize);
      let to = NodeIndex::new(edge.to as usize);
      if graph.node_weight(from).is_none() || graph.node_weight(to).is_none() {
        return Err(CacheLoadError::Corrupt(format!(
          "edge {} -> {} references a vacant slot",
          edge.from, edge.to
        )));
      }
      graph.add_edge(from, to, edge.kind);
    }

    let root = NodeIndex::new(header.root as usize);
    if !matches!(graph.node_weight(root), Some(RequestGraphNode::Root)) {
      return Err(CacheLoadError::Corrupt(format!(
        "slot {} is not the root node",
        header.root
      )));
    }

    let restore_request_set = |graph: &StableDiGraph<RequestGraphNode<R>, RequestGraphEdge>,
                               indices: &[u32]| {
      indices
        .iter()
        .map(|index| NodeIndex::new(*index as usize))
        .filter(|index| {
          matches!(
            graph.node_weight(*index),
            Some(RequestGraphNode::Request(_))
          )
        })
        .collect::<HashSet<NodeIndex>>()
    };

    let mut restored = RequestGraph {
      invalid_requests: restore_request_set(&graph, &header.invalid_requests),
      incomplete_requests: HashSet::new(),
      unpredictable_requests: restore_request_set(&graph, &header.unpredictable_requests),
      on_build_requests: restore_request_set(&graph, &header.on_build_requests),
      glob_nodes: HashSet::new(),
      env_nodes: HashSet::new(),
      option_nodes: HashSet::new(),
      config_key_nodes_by_file: HashMap::new(),
      chunks: ChunkTracker::new(header.nodes_per_chunk),
      graph,
      root,
      content_keys,
    };

    let indices: Vec<NodeIndex> = restored.graph.node_indices().collect();
    for index in indices {
      match restored.graph.node_weight(index) {
        Some(RequestGraphNode::Glob(_)) => {
          restored.glob_nodes.insert(index);
        }
        Some(RequestGraphNode::Env(_)) => {
          restored.env_nodes.insert(index);
        }
        Some(RequestGraphNode::Option(_)) => {
          restored.option_nodes.insert(index);
        }
        Some(RequestGraphNode::ConfigKey(node)) => {
          let file_path = node.file_path.clone();
          restored
            .config_key_nodes_by_file
            .entry(file_path)
            .or_default()
            .insert(index);
        }
        _ => {}
      }
    }

    restored.chunks.mark_all_clean(chunk_count);
    Ok(restored)
  }
}
