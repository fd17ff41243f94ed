//! EvacuationPlanner (C7): snaps sensor/shelter to the road graph and
//! returns a minimum-cost path plus GeoJSON.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::PlannerError;
use crate::geo_index::Point;
use crate::road_graph::RoadGraph;

#[derive(Debug, Clone)]
pub struct Route {
    pub segments: Vec<crate::road_graph::Step>,
    pub total_cost_minutes: f64,
    pub estimated_time_minutes: f64,
    pub geojson: Value,
}

pub struct EvacuationPlanner {
    road_graph: Arc<RoadGraph>,
}

impl EvacuationPlanner {
    pub fn new(road_graph: Arc<RoadGraph>) -> Self {
        Self { road_graph }
    }

    pub fn route(
        &self,
        sensor_point: Point,
        shelter_point: Point,
    ) -> Result<Route, PlannerError> {
        let (src_node, _) = self.road_graph.snap(sensor_point)?;
        let (dst_node, _) = self.road_graph.snap(shelter_point)?;

        let segments = self.road_graph.shortest_path(src_node, dst_node)?;
        let total_cost_minutes: f64 = segments.iter().map(|s| s.cost).sum();

        // Identity cost/time model until a speed/traffic model is
        // introduced.
        let estimated_time_minutes = total_cost_minutes;

        let features: Vec<Value> = segments
            .iter()
            .map(|s| {
                json!({
                    "type": "Feature",
                    "properties": { "seq": s.seq, "edge_id": s.edge_id, "cost_minutes": s.cost },
                    "geometry": { "type": "LineString", "coordinates": [] }
                })
            })
            .collect();

        let geojson = json!({
            "type": "FeatureCollection",
            "features": features,
        });

        Ok(Route {
            segments,
            total_cost_minutes,
            estimated_time_minutes,
            geojson,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RoadNode, RoadSegment};

    #[test]
    fn route_geojson_is_a_feature_collection() {
        let graph = Arc::new(RoadGraph::new());
        graph.publish(
            vec![
                RoadNode { id: 1, lat: 40.42, lon: -3.70 },
                RoadNode { id: 2, lat: 40.43, lon: -3.69 },
            ],
            &[RoadSegment {
                id: 1,
                source: 1,
                target: 2,
                cost_minutes: 5.0,
                reverse_cost_minutes: Some(5.0),
                geometry: vec![],
            }],
        );
        let planner = EvacuationPlanner::new(graph);
        let route = planner
            .route(Point { lat: 40.42, lon: -3.70 }, Point { lat: 40.43, lon: -3.69 })
            .unwrap();
        assert_eq!(route.geojson["type"], "FeatureCollection");
        assert!(route.total_cost_minutes > 0.0);
    }

    #[test]
    fn disconnected_endpoints_surface_no_path() {
        let graph = Arc::new(RoadGraph::new());
        graph.publish(
            vec![
                RoadNode { id: 1, lat: 0.0, lon: 0.0 },
                RoadNode { id: 2, lat: 10.0, lon: 10.0 },
            ],
            &[],
        );
        let planner = EvacuationPlanner::new(graph);
        let err = planner
            .route(Point { lat: 0.0, lon: 0.0 }, Point { lat: 10.0, lon: 10.0 })
            .unwrap_err();
        assert!(matches!(err, PlannerError::RoadGraph(crate::error::RoadGraphError::NoPath)));
    }
}
