pub mod dpool;
pub mod shm;

pub use dpool::{DAlloc, DPool, FRAGMENTATION_THRESHOLD};
pub use shm::{PageRun, Shm};
