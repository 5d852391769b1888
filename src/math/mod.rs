pub mod graph;
pub mod tensors;
