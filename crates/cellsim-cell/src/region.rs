//! Mapping of nodes and areas onto network scopes.

use crate::network::NetworkState;
use crate::nodes::NodeRegistry;
use cellsim_common::{GeoArea, GeoCircle, GeoCoord, GeoRectangle, NodeName, RegionId, GLOBAL_NETWORK_ID};
use std::collections::HashMap;

/// Half-open rectangle containment.
///
/// The north-west corner is inside; points on the south or east edge are not.
pub fn contains(rectangle: &GeoRectangle, point: &GeoCoord) -> bool {
    rectangle.contains(point)
}

/// Most specific scope covering `position`.
///
/// The smallest containing region wins; ties go to the region declared
/// first. Unknown positions and positions outside every region resolve to
/// the global scope.
pub fn resolve_region(network: &NetworkState, position: Option<&GeoCoord>) -> RegionId {
    let Some(position) = position else {
        return GLOBAL_NETWORK_ID.to_string();
    };
    let mut best: Option<(f64, &str)> = None;
    for region in network.regions() {
        let Some(area) = &region.area else { continue };
        if !area.contains(position) {
            continue;
        }
        let size = area.approx_area_m2();
        if best.map_or(true, |(best_size, _)| size < best_size) {
            best = Some((size, region.id.as_str()));
        }
    }
    best.map(|(_, id)| id.to_string())
        .unwrap_or_else(|| GLOBAL_NETWORK_ID.to_string())
}

/// Cached node to region lookup.
///
/// Entries are invalidated whenever a node reports a new position.
#[derive(Debug, Default)]
pub struct RegionResolver {
    cache: HashMap<NodeName, RegionId>,
}

impl RegionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Region the node currently occupies.
    pub fn region_for(&mut self, network: &NetworkState, nodes: &NodeRegistry, node: &str) -> RegionId {
        if let Some(region) = self.cache.get(node) {
            return region.clone();
        }
        let region = resolve_region(network, nodes.position(node));
        self.cache.insert(node.to_string(), region.clone());
        region
    }

    /// Forget the cached region of a node.
    pub fn invalidate(&mut self, node: &str) {
        self.cache.remove(node);
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Nodes whose position lies inside `area`, in name order.
pub fn nodes_in_area(nodes: &NodeRegistry, area: &GeoArea) -> Vec<NodeName> {
    nodes
        .iter()
        .filter(|(_, entry)| entry.position.as_ref().is_some_and(|p| area.contains(p)))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Nodes currently resolved to `region`, in name order.
pub fn nodes_in_region(
    resolver: &mut RegionResolver,
    network: &NetworkState,
    nodes: &NodeRegistry,
    region: &str,
) -> Vec<NodeName> {
    nodes
        .iter()
        .map(|(name, _)| name)
        .filter(|name| resolver.region_for(network, nodes, name) == region)
        .cloned()
        .collect()
}

/// Named regions whose area intersects `area`, in declaration order.
pub fn regions_for_area(network: &NetworkState, area: &GeoArea) -> Vec<RegionId> {
    network
        .regions()
        .iter()
        .filter(|r| r.area.as_ref().is_some_and(|a| areas_collide(a, area)))
        .map(|r| r.id.clone())
        .collect()
}

// ============================================================================
// Area Collision
// ============================================================================

/// Whether two areas overlap.
pub fn areas_collide(a: &GeoArea, b: &GeoArea) -> bool {
    match (a, b) {
        (GeoArea::Circle(c1), GeoArea::Circle(c2)) => {
            c1.center.distance_to(&c2.center) <= c1.radius_m + c2.radius_m
        }
        (GeoArea::Circle(c), other) | (other, GeoArea::Circle(c)) => circle_collides(c, other),
        _ => outlines_collide(a, b),
    }
}

fn circle_collides(circle: &GeoCircle, outline: &GeoArea) -> bool {
    if outline.contains(&circle.center) {
        return true;
    }
    let vertices = outline.vertices();
    if vertices.iter().any(|v| circle.contains(v)) {
        return true;
    }
    let projected: Vec<(f64, f64)> = vertices.iter().map(|v| v.project_from(&circle.center)).collect();
    let hit = edges(&projected).any(|(p, q)| distance_to_segment((0.0, 0.0), p, q) < circle.radius_m);
    hit
}

fn outlines_collide(a: &GeoArea, b: &GeoArea) -> bool {
    let va = a.vertices();
    let vb = b.vertices();
    if va.iter().any(|v| b.contains(v)) || vb.iter().any(|v| a.contains(v)) {
        return true;
    }
    let pa: Vec<(f64, f64)> = va.iter().map(|v| (v.longitude, v.latitude)).collect();
    let pb: Vec<(f64, f64)> = vb.iter().map(|v| (v.longitude, v.latitude)).collect();
    let hit = edges(&pa).any(|(p1, p2)| edges(&pb).any(|(q1, q2)| segments_intersect(p1, p2, q1, q2)));
    hit
}

fn edges(points: &[(f64, f64)]) -> impl Iterator<Item = ((f64, f64), (f64, f64))> + '_ {
    (0..points.len()).map(move |i| (points[i], points[(i + 1) % points.len()]))
}

fn distance_to_segment(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a.0 + t * dx, a.1 + t * dy);
    ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt()
}

fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

fn segments_intersect(p1: (f64, f64), p2: (f64, f64), q1: (f64, f64), q2: (f64, f64)) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::scope;
    use crate::nodes::{NodeEntry, NodeKind};
    use cellsim_common::GeoPolygon;

    fn rect(nw: (f64, f64), se: (f64, f64)) -> GeoArea {
        GeoArea::Rectangle(GeoRectangle::new(GeoCoord::new(nw.0, nw.1), GeoCoord::new(se.0, se.1)))
    }

    fn network() -> NetworkState {
        NetworkState::new(
            scope(GLOBAL_NETWORK_ID, None, 1000, 1000),
            vec![
                scope("berlin", Some(rect((52.6, 13.3), (52.4, 13.5))), 1000, 1000),
                scope("kreuzberg", Some(rect((52.5, 13.4), (52.49, 13.42))), 1000, 1000),
            ],
            false,
        )
        .unwrap()
    }

    fn nodes() -> NodeRegistry {
        let mut nodes = NodeRegistry::new();
        for (name, pos) in [
            ("veh_0", Some(GeoCoord::new(52.495, 13.41))),
            ("veh_1", Some(GeoCoord::new(52.55, 13.35))),
            ("veh_2", Some(GeoCoord::new(48.1, 11.5))),
            ("veh_3", None),
        ] {
            nodes.insert(
                name,
                NodeEntry {
                    kind: NodeKind::Vehicle,
                    position: pos,
                    cell: None,
                },
            );
        }
        nodes
    }

    #[test]
    fn test_most_specific_region_wins() {
        let network = network();
        let nodes = nodes();
        let mut resolver = RegionResolver::new();
        assert_eq!(resolver.region_for(&network, &nodes, "veh_0"), "kreuzberg");
        assert_eq!(resolver.region_for(&network, &nodes, "veh_1"), "berlin");
        assert_eq!(resolver.region_for(&network, &nodes, "veh_2"), GLOBAL_NETWORK_ID);
        assert_eq!(resolver.region_for(&network, &nodes, "veh_3"), GLOBAL_NETWORK_ID);
        assert_eq!(resolver.region_for(&network, &nodes, "unknown"), GLOBAL_NETWORK_ID);
    }

    #[test]
    fn test_cache_invalidation_on_move() {
        let network = network();
        let mut nodes = nodes();
        let mut resolver = RegionResolver::new();
        assert_eq!(resolver.region_for(&network, &nodes, "veh_0"), "kreuzberg");

        nodes.set_position("veh_0", GeoCoord::new(52.55, 13.35));
        assert_eq!(resolver.region_for(&network, &nodes, "veh_0"), "kreuzberg");
        resolver.invalidate("veh_0");
        assert_eq!(resolver.region_for(&network, &nodes, "veh_0"), "berlin");
    }

    #[test]
    fn test_boundary_point_is_outside() {
        let kreuzberg = GeoRectangle::new(GeoCoord::new(52.5, 13.4), GeoCoord::new(52.49, 13.42));
        assert!(contains(&kreuzberg, &GeoCoord::new(52.5, 13.4)));
        assert!(!contains(&kreuzberg, &GeoCoord::new(52.495, 13.42)));
        assert!(!contains(&kreuzberg, &GeoCoord::new(52.49, 13.41)));
    }

    #[test]
    fn test_nodes_in_area_and_region() {
        let network = network();
        let nodes = nodes();
        let area = rect((52.6, 13.3), (52.4, 13.5));
        assert_eq!(nodes_in_area(&nodes, &area), vec!["veh_0", "veh_1"]);

        let mut resolver = RegionResolver::new();
        assert_eq!(nodes_in_region(&mut resolver, &network, &nodes, "berlin"), vec!["veh_1"]);
        assert_eq!(
            nodes_in_region(&mut resolver, &network, &nodes, GLOBAL_NETWORK_ID),
            vec!["veh_2", "veh_3"]
        );
    }

    #[test]
    fn test_regions_for_circle_area() {
        let network = network();
        let inside_kreuzberg = GeoArea::Circle(GeoCircle {
            center: GeoCoord::new(52.495, 13.41),
            radius_m: 50.0,
        });
        assert_eq!(regions_for_area(&network, &inside_kreuzberg), vec!["berlin", "kreuzberg"]);

        // centre outside, but the circle reaches across the eastern edge
        let overlapping_edge = GeoArea::Circle(GeoCircle {
            center: GeoCoord::new(52.495, 13.4215),
            radius_m: 500.0,
        });
        assert!(areas_collide(&overlapping_edge, &rect((52.5, 13.4), (52.49, 13.42))));

        let far_away = GeoArea::Circle(GeoCircle {
            center: GeoCoord::new(48.1, 11.5),
            radius_m: 1000.0,
        });
        assert!(regions_for_area(&network, &far_away).is_empty());
    }

    #[test]
    fn test_crossing_polygons_collide() {
        let horizontal = rect((52.5, 13.0), (52.4, 14.0));
        let vertical = GeoArea::Polygon(GeoPolygon {
            vertices: vec![
                GeoCoord::new(53.0, 13.4),
                GeoCoord::new(53.0, 13.5),
                GeoCoord::new(52.0, 13.5),
                GeoCoord::new(52.0, 13.4),
            ],
        });
        assert!(areas_collide(&horizontal, &vertical));
        assert!(!areas_collide(&horizontal, &rect((51.0, 10.0), (50.0, 11.0))));
    }
}
