pub mod ir;
pub mod processor;
pub mod spsc_ring;
