//! Multi-relational graph input for the relational encoder.
//!
//! A `RelationalGraph` is a fixed set of nodes joined by directed, relation-typed edges.
//! Each edge carries a scalar normalization coefficient that scales the message it
//! delivers, typically the inverse in-degree of the destination under that relation.
//!
//! Ids are validated when edges are attached, so any graph that exists is well formed
//! and the message-passing layers never see an out-of-range relation.

use candle_core::{DType, Device, Tensor};

use crate::error::KgVaeError;

/// A directed, relation-typed edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub source: usize,
    pub destination: usize,
    pub relation: usize,
    /// Coefficient applied to the message sent along this edge.
    pub norm: f64,
}

/// An immutable-once-built multi-relational graph.
#[derive(Debug, Clone)]
pub struct RelationalGraph {
    num_nodes: usize,
    num_rels: usize,
    edges: Vec<Edge>,
    /// Incoming edge indices per destination node.
    incoming: Vec<Vec<usize>>,
}

impl RelationalGraph {
    /// Initializes a graph with `num_nodes` isolated nodes and `num_rels` relation types.
    pub fn init(num_nodes: usize, num_rels: usize) -> Self {
        Self {
            num_nodes,
            num_rels,
            edges: Vec::new(),
            incoming: vec![Vec::new(); num_nodes],
        }
    }

    /// Builds a graph from `(source, relation, destination)` triples, assigning each
    /// edge the inverse in-degree of its destination under its relation.
    pub fn from_triples(
        num_nodes: usize,
        num_rels: usize,
        triples: &[(usize, usize, usize)],
    ) -> Result<Self, KgVaeError> {
        let mut graph = Self::init(num_nodes, num_rels);
        for &(source, relation, destination) in triples {
            graph.add_edge(source, destination, relation, 1.0)?;
        }
        graph.normalize_in_degree();
        Ok(graph)
    }

    /// Attaches an edge and returns its index.
    pub fn add_edge(
        &mut self,
        source: usize,
        destination: usize,
        relation: usize,
        norm: f64,
    ) -> Result<usize, KgVaeError> {
        for node in [source, destination] {
            if node >= self.num_nodes {
                return Err(KgVaeError::InvalidNode {
                    node,
                    num_nodes: self.num_nodes,
                });
            }
        }
        if relation >= self.num_rels {
            return Err(KgVaeError::InvalidRelation {
                relation,
                num_rels: self.num_rels,
            });
        }
        if !norm.is_finite() {
            return Err(KgVaeError::NonFinite("edge normalization"));
        }
        let idx = self.edges.len();
        self.edges.push(Edge {
            source,
            destination,
            relation,
            norm,
        });
        self.incoming[destination].push(idx);
        Ok(idx)
    }

    /// Replaces every edge coefficient with `1 / in_degree(destination, relation)`.
    pub fn normalize_in_degree(&mut self) {
        let mut counts = vec![0usize; self.num_nodes * self.num_rels];
        for edge in &self.edges {
            counts[edge.destination * self.num_rels + edge.relation] += 1;
        }
        for edge in &mut self.edges {
            let count = counts[edge.destination * self.num_rels + edge.relation];
            edge.norm = 1.0 / count as f64;
        }
    }

    /// Overwrites the coefficient of a single edge.
    pub fn set_norm(&mut self, edge: usize, norm: f64) -> Result<(), KgVaeError> {
        if !norm.is_finite() {
            return Err(KgVaeError::NonFinite("edge normalization"));
        }
        let num_edges = self.edges.len();
        let edge = self
            .edges
            .get_mut(edge)
            .ok_or(KgVaeError::DimensionMismatch {
                context: "edge index",
                expected: num_edges,
                found: edge,
            })?;
        edge.norm = norm;
        Ok(())
    }

    /// Indices of the edges arriving at `node`.
    pub fn incoming(&self, node: usize) -> Result<&[usize], KgVaeError> {
        self.incoming
            .get(node)
            .map(Vec::as_slice)
            .ok_or(KgVaeError::InvalidNode {
                node,
                num_nodes: self.num_nodes,
            })
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_rels(&self) -> usize {
        self.num_rels
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Materializes the edge list as tensors on `device`.
    pub fn to_tensors(&self, device: &Device, dtype: DType) -> Result<EdgeTensors, KgVaeError> {
        let num_edges = self.edges.len();
        let src: Vec<u32> = self.edges.iter().map(|e| e.source as u32).collect();
        let dst: Vec<u32> = self.edges.iter().map(|e| e.destination as u32).collect();
        let rel: Vec<u32> = self.edges.iter().map(|e| e.relation as u32).collect();
        let norm: Vec<f32> = self.edges.iter().map(|e| e.norm as f32).collect();
        Ok(EdgeTensors {
            src: Tensor::from_vec(src, num_edges, device)?,
            dst: Tensor::from_vec(dst, num_edges, device)?,
            rel: Tensor::from_vec(rel, num_edges, device)?,
            norm: Tensor::from_vec(norm, (num_edges, 1), device)?.to_dtype(dtype)?,
            num_nodes: self.num_nodes,
            num_edges,
        })
    }
}

/// Tensor view of a graph's edges, consumed by one message-passing call.
#[derive(Debug, Clone)]
pub struct EdgeTensors {
    /// Source node per edge, `u32`.
    pub src: Tensor,
    /// Destination node per edge, `u32`.
    pub dst: Tensor,
    /// Relation id per edge, `u32`.
    pub rel: Tensor,
    /// Normalization coefficient per edge, `E x 1`.
    pub norm: Tensor,
    pub num_nodes: usize,
    pub num_edges: usize,
}

impl EdgeTensors {
    pub fn is_empty(&self) -> bool {
        self.num_edges == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_edges_and_incidences() -> Result<(), KgVaeError> {
        let mut graph = RelationalGraph::init(3, 2);
        let e0 = graph.add_edge(0, 1, 0, 1.0)?;
        let e1 = graph.add_edge(2, 1, 1, 0.5)?;
        assert_eq!((e0, e1), (0, 1));
        assert_eq!(graph.incoming(1)?, &[0, 1]);
        assert!(graph.incoming(0)?.is_empty());
        assert_eq!(graph.num_edges(), 2);
        Ok(())
    }

    #[test]
    fn test_invalid_ids_are_rejected() {
        let mut graph = RelationalGraph::init(2, 1);
        assert!(matches!(
            graph.add_edge(0, 1, 1, 1.0),
            Err(KgVaeError::InvalidRelation {
                relation: 1,
                num_rels: 1
            })
        ));
        assert!(matches!(
            graph.add_edge(0, 5, 0, 1.0),
            Err(KgVaeError::InvalidNode { node: 5, .. })
        ));
        assert!(matches!(
            graph.add_edge(0, 1, 0, f64::NAN),
            Err(KgVaeError::NonFinite(_))
        ));
        assert!(matches!(
            graph.incoming(2),
            Err(KgVaeError::InvalidNode { node: 2, .. })
        ));
        assert_eq!(graph.num_edges(), 0);
    }

    #[test]
    fn test_inverse_in_degree_per_relation() -> Result<(), KgVaeError> {
        // node 2 receives two rel-0 edges and one rel-1 edge
        let graph = RelationalGraph::from_triples(3, 2, &[(0, 0, 2), (1, 0, 2), (0, 1, 2)])?;
        let norms: Vec<f64> = graph.edges().iter().map(|e| e.norm).collect();
        assert_eq!(norms, vec![0.5, 0.5, 1.0]);
        Ok(())
    }

    #[test]
    fn test_to_tensors_shapes() -> Result<(), KgVaeError> {
        let graph = RelationalGraph::from_triples(4, 2, &[(0, 0, 1), (1, 1, 2), (2, 0, 3)])?;
        let edges = graph.to_tensors(&Device::Cpu, DType::F32)?;
        assert_eq!(edges.src.to_vec1::<u32>()?, vec![0, 1, 2]);
        assert_eq!(edges.dst.to_vec1::<u32>()?, vec![1, 2, 3]);
        assert_eq!(edges.rel.to_vec1::<u32>()?, vec![0, 1, 0]);
        assert_eq!(edges.norm.dims(), &[3, 1]);
        assert!(!edges.is_empty());
        Ok(())
    }

    #[test]
    fn test_set_norm() -> Result<(), KgVaeError> {
        let mut graph = RelationalGraph::from_triples(2, 1, &[(0, 0, 1)])?;
        graph.set_norm(0, 0.0)?;
        assert_eq!(graph.edges()[0].norm, 0.0);
        assert!(graph.set_norm(3, 1.0).is_err());
        Ok(())
    }
}
