//! RoadGraph (C3): directed weighted graph with shortest-path by travel
//! cost, a from-scratch `BinaryHeap`-based Dijkstra in idiomatic
//! std-library style.

use arc_swap::ArcSwap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::RoadGraphError;
use crate::geo_index::{haversine_m, Point};
use crate::model::{RoadNode, RoadSegment};

#[derive(Debug, Clone, Copy)]
struct Edge {
    edge_id: i64,
    to: usize,
    cost: f64,
}

#[derive(Debug, Clone)]
struct GraphSnapshot {
    nodes: Vec<RoadNode>,
    adjacency: Vec<Vec<Edge>>,
}

pub struct RoadGraph {
    snapshot: ArcSwap<GraphSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub seq: u32,
    pub edge_id: i64,
    pub cost: f64,
}

impl Default for RoadGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RoadGraph {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(GraphSnapshot {
                nodes: Vec::new(),
                adjacency: Vec::new(),
            }),
        }
    }

    /// Rebuilds adjacency from the raw node/segment rows and publishes it
    /// atomically, so readers never observe a partially-rebuilt graph.
    pub fn publish(&self, nodes: Vec<RoadNode>, segments: &[RoadSegment]) {
        let mut adjacency = vec![Vec::new(); nodes.len()];
        let index_of = |id: i64| nodes.iter().position(|n| n.id == id);
        for seg in segments {
            if let (Some(src), Some(dst)) = (index_of(seg.source), index_of(seg.target)) {
                adjacency[src].push(Edge {
                    edge_id: seg.id,
                    to: dst,
                    cost: seg.cost_minutes,
                });
                if let Some(reverse) = seg.reverse_cost_minutes {
                    adjacency[dst].push(Edge {
                        edge_id: seg.id,
                        to: src,
                        cost: reverse,
                    });
                }
            }
        }
        self.snapshot.store(Arc::new(GraphSnapshot { nodes, adjacency }));
    }

    /// Nearest node to an arbitrary point (`snap`).
    pub fn snap(&self, point: Point) -> Result<(i64, f64), RoadGraphError> {
        let snap = self.snapshot.load();
        snap.nodes
            .iter()
            .map(|n| (n.id, haversine_m(point, Point { lat: n.lat, lon: n.lon })))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or(RoadGraphError::UnknownEndpoint)
    }

    pub fn shortest_path(&self, src_node: i64, dst_node: i64) -> Result<Vec<Step>, RoadGraphError> {
        let snap = self.snapshot.load();
        let src = snap
            .nodes
            .iter()
            .position(|n| n.id == src_node)
            .ok_or(RoadGraphError::UnknownEndpoint)?;
        let dst = snap
            .nodes
            .iter()
            .position(|n| n.id == dst_node)
            .ok_or(RoadGraphError::UnknownEndpoint)?;

        if src == dst {
            return Ok(Vec::new());
        }

        dijkstra(&snap.adjacency, src, dst).ok_or(RoadGraphError::NoPath)
    }
}

/// Ordered so `BinaryHeap` (a max-heap) pops the smallest cost first, with
/// ties broken on ascending `edge_id`
#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry {
    cost: f64,
    edge_id: i64,
    node: usize,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.edge_id.cmp(&self.edge_id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn dijkstra(adjacency: &[Vec<Edge>], src: usize, dst: usize) -> Option<Vec<Step>> {
    let n = adjacency.len();
    let mut dist = vec![f64::INFINITY; n];
    let mut via: Vec<Option<(usize, i64, f64)>> = vec![None; n];
    let mut visited = vec![false; n];

    dist[src] = 0.0;
    let mut heap = BinaryHeap::new();
    heap.push(HeapEntry {
        cost: 0.0,
        edge_id: i64::MIN,
        node: src,
    });

    while let Some(HeapEntry { cost, node, .. }) = heap.pop() {
        if visited[node] {
            continue;
        }
        visited[node] = true;
        if node == dst {
            break;
        }
        for edge in &adjacency[node] {
            if edge.cost < 0.0 {
                continue;
            }
            let next_cost = cost + edge.cost;
            if next_cost < dist[edge.to] {
                dist[edge.to] = next_cost;
                via[edge.to] = Some((node, edge.edge_id, edge.cost));
                heap.push(HeapEntry {
                    cost: next_cost,
                    edge_id: edge.edge_id,
                    node: edge.to,
                });
            }
        }
    }

    if !visited[dst] {
        return None;
    }

    let mut steps = Vec::new();
    let mut cur = dst;
    while let Some((prev, edge_id, cost)) = via[cur] {
        steps.push((edge_id, cost));
        cur = prev;
    }
    steps.reverse();

    Some(
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (edge_id, cost))| Step {
                seq: i as u32,
                edge_id,
                cost,
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, lat: f64, lon: f64) -> RoadNode {
        RoadNode { id, lat, lon }
    }

    fn seg(id: i64, source: i64, target: i64, cost: f64, reverse: Option<f64>) -> RoadSegment {
        RoadSegment {
            id,
            source,
            target,
            cost_minutes: cost,
            reverse_cost_minutes: reverse,
            geometry: vec![],
        }
    }

    #[test]
    fn same_node_returns_zero_segments() {
        let g = RoadGraph::new();
        g.publish(vec![node(1, 0.0, 0.0)], &[]);
        let path = g.shortest_path(1, 1).unwrap();
        assert!(path.is_empty());
    }

    #[test]
    fn disconnected_returns_no_path() {
        let g = RoadGraph::new();
        g.publish(vec![node(1, 0.0, 0.0), node(2, 1.0, 1.0)], &[]);
        assert!(matches!(g.shortest_path(1, 2), Err(RoadGraphError::NoPath)));
    }

    #[test]
    fn picks_cheapest_of_two_paths() {
        let g = RoadGraph::new();
        g.publish(
            vec![node(1, 0.0, 0.0), node(2, 0.0, 0.0), node(3, 0.0, 0.0), node(4, 0.0, 0.0)],
            &[
                seg(10, 1, 4, 10.0, None),
                seg(11, 1, 2, 1.0, None),
                seg(12, 2, 3, 1.0, None),
                seg(13, 3, 4, 1.0, None),
            ],
        );
        let path = g.shortest_path(1, 4).unwrap();
        let total: f64 = path.iter().map(|s| s.cost).sum();
        assert_eq!(total, 3.0);
        assert_eq!(path.iter().map(|s| s.edge_id).collect::<Vec<_>>(), vec![11, 12, 13]);
    }

    #[test]
    fn one_way_segment_not_traversable_in_reverse() {
        let g = RoadGraph::new();
        g.publish(
            vec![node(1, 0.0, 0.0), node(2, 0.0, 0.0)],
            &[seg(1, 1, 2, 5.0, None)],
        );
        assert!(matches!(g.shortest_path(2, 1), Err(RoadGraphError::NoPath)));
    }

    #[test]
    fn unknown_node_is_unknown_endpoint() {
        let g = RoadGraph::new();
        g.publish(vec![node(1, 0.0, 0.0)], &[]);
        assert!(matches!(g.shortest_path(1, 99), Err(RoadGraphError::UnknownEndpoint)));
    }
}
