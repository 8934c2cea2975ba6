mod memory;

pub use memory::MemoryEventStream;
