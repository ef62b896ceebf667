// Entity boundary
//
// The renderer does not own entities. It only needs a stable identity to key
// GPU resources on, and read access to the vertex payload when an add request
// is processed.

use crate::backend::vertex::Vertex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable identity of an entity, used as the registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        EntityId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Vertex payload carried by renderable entities
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
}

impl Mesh {
    pub fn new(vertices: Vec<Vertex>) -> Self {
        Self { vertices }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

/// What the renderer needs from an entity
pub trait RenderEntity: Send + Sync {
    fn id(&self) -> EntityId;

    /// Render payload, if the entity has one
    fn mesh(&self) -> Option<&Mesh>;
}

/// Shared, non-owning handle the renderer uses to reach an entity
pub type EntityRef = Arc<dyn RenderEntity>;

/// Minimal entity: an id plus an optional mesh component
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    mesh: Option<Mesh>,
}

impl Entity {
    pub fn new(mesh: Option<Mesh>) -> Self {
        Self {
            id: EntityId::next(),
            mesh,
        }
    }

    pub fn with_id(id: EntityId, mesh: Option<Mesh>) -> Self {
        Self { id, mesh }
    }

    pub fn with_vertices(vertices: Vec<Vertex>) -> Self {
        Self::new(Some(Mesh::new(vertices)))
    }

    /// Wrap into the shared handle accepted by the renderer
    pub fn into_ref(self) -> EntityRef {
        Arc::new(self)
    }
}

impl RenderEntity for Entity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn mesh(&self) -> Option<&Mesh> {
        self.mesh.as_ref()
    }
}
