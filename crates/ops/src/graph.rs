use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tile_protocol::{Epoch, ImageId, TileGrid};

use crate::kernels::PreparedOperation;
use crate::kind::OperationKind;
use crate::source::RasterSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "node {}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationNode {
    pub id: NodeId,
    pub kind: OperationKind,
    pub enabled: bool,
}

/// One entry of a saved edit stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOperation {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub kind: OperationKind,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("unknown operation {0}")]
    UnknownNode(NodeId),
}

/// Prepared kernels keyed by node and parameter hash.
///
/// Entries are dropped explicitly when their node changes or goes away.
#[derive(Debug, Default)]
struct PreparedCache {
    entries: HashMap<(NodeId, u64), PreparedOperation>,
}

impl PreparedCache {
    fn get_or_prepare(&mut self, node: &OperationNode) -> PreparedOperation {
        self.entries
            .entry((node.id, node.kind.parameter_hash()))
            .or_insert_with(|| PreparedOperation::prepare(&node.kind))
            .clone()
    }

    fn invalidate(&mut self, id: NodeId) {
        self.entries.retain(|(node, _), _| *node != id);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Ordered chain of editing operations over one source raster.
pub struct OperationGraph {
    source: Arc<dyn RasterSource>,
    grid: TileGrid,
    nodes: Vec<OperationNode>,
    next_node_id: u64,
    prepared: PreparedCache,
}

impl OperationGraph {
    pub fn new(source: Arc<dyn RasterSource>, tile_size: u32) -> Self {
        let (width, height) = source.bounds();
        Self {
            source,
            grid: TileGrid::new(width, height, tile_size),
            nodes: Vec::new(),
            next_node_id: 0,
            prepared: PreparedCache::default(),
        }
    }

    pub fn grid(&self) -> TileGrid {
        self.grid
    }

    pub fn nodes(&self) -> &[OperationNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&OperationNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Appends an enabled operation at the end of the chain.
    pub fn add(&mut self, kind: OperationKind) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        self.nodes.push(OperationNode {
            id,
            kind,
            enabled: true,
        });
        id
    }

    /// Replaces the parameters of `id`. Returns false when nothing changed.
    pub fn update(&mut self, id: NodeId, kind: OperationKind) -> Result<bool, GraphError> {
        let node = self.node_mut(id)?;
        if node.kind == kind {
            return Ok(false);
        }
        node.kind = kind;
        self.prepared.invalidate(id);
        Ok(true)
    }

    pub fn remove(&mut self, id: NodeId) -> Result<OperationNode, GraphError> {
        let index = self
            .nodes
            .iter()
            .position(|node| node.id == id)
            .ok_or(GraphError::UnknownNode(id))?;
        self.prepared.invalidate(id);
        Ok(self.nodes.remove(index))
    }

    /// Returns false when the node already had the requested state.
    pub fn set_enabled(&mut self, id: NodeId, enabled: bool) -> Result<bool, GraphError> {
        let node = self.node_mut(id)?;
        if node.enabled == enabled {
            return Ok(false);
        }
        node.enabled = enabled;
        Ok(true)
    }

    pub fn edit_stack(&self) -> Vec<StoredOperation> {
        self.nodes
            .iter()
            .map(|node| StoredOperation {
                enabled: node.enabled,
                kind: node.kind.clone(),
            })
            .collect()
    }

    /// Replaces the whole chain; previously issued node ids become unknown.
    pub fn replace_operations(&mut self, stack: Vec<StoredOperation>) -> Vec<NodeId> {
        self.nodes.clear();
        self.prepared.clear();
        stack
            .into_iter()
            .map(|stored| {
                let id = self.add(stored.kind);
                if let Some(node) = self.nodes.last_mut() {
                    node.enabled = stored.enabled;
                }
                id
            })
            .collect()
    }

    /// Captures the current chain. Disabled and neutral operations are left out.
    pub fn snapshot(&mut self, image: ImageId, epoch: Epoch) -> Arc<GraphSnapshot> {
        let prepared = &mut self.prepared;
        let operations: Arc<[PreparedOperation]> = self
            .nodes
            .iter()
            .filter(|node| node.enabled && !node.kind.is_neutral())
            .map(|node| prepared.get_or_prepare(node))
            .collect();
        Arc::new(GraphSnapshot {
            image,
            epoch,
            grid: self.grid,
            source: Arc::clone(&self.source),
            operations,
        })
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut OperationNode, GraphError> {
        self.nodes
            .iter_mut()
            .find(|node| node.id == id)
            .ok_or(GraphError::UnknownNode(id))
    }
}

impl fmt::Debug for OperationGraph {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("OperationGraph")
            .field("grid", &self.grid)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

/// Immutable view of an image's operations at one epoch.
#[derive(Clone)]
pub struct GraphSnapshot {
    image: ImageId,
    epoch: Epoch,
    grid: TileGrid,
    source: Arc<dyn RasterSource>,
    operations: Arc<[PreparedOperation]>,
}

impl GraphSnapshot {
    pub fn image(&self) -> ImageId {
        self.image
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn grid(&self) -> TileGrid {
        self.grid
    }

    pub fn source(&self) -> &dyn RasterSource {
        self.source.as_ref()
    }

    pub fn operations(&self) -> &[PreparedOperation] {
        &self.operations
    }

    /// Upstream context a tile needs for the whole chain.
    pub fn margin(&self) -> u32 {
        self.operations
            .iter()
            .fold(0u32, |total, operation| total.saturating_add(operation.margin()))
    }
}

impl fmt::Debug for GraphSnapshot {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("GraphSnapshot")
            .field("image", &self.image)
            .field("epoch", &self.epoch)
            .field("grid", &self.grid)
            .field(
                "operations",
                &self.operations.iter().map(PreparedOperation::name).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
