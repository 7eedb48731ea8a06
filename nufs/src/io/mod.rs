mod block;
mod diskemu;
mod memory;

pub use block::{BlockNumber, BlockStorage};
pub use diskemu::{FileBlockEmulator, FileBlockEmulatorBuilder};
pub use memory::MemoryBlockEmulator;
