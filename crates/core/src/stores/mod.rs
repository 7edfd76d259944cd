pub mod memory;
pub mod qdrant;

pub use memory::InMemoryBackend;
pub use qdrant::QdrantStore;
