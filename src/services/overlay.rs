//! Overlay geometry resolution
//!
//! Zone configurations describe permitted work areas (polygons) and permitted
//! paths (routes) per attendance type. They are static with respect to user
//! positions and are only re-resolved when the configuration changes.
//!
//! Degenerate lists (polygon < 3 points, route < 2 points) are dropped
//! without failing the batch; they are a configuration-quality issue.

use crate::domain::error::ConfigurationError;
use crate::domain::raw::{NamedPointList, ZoneConfig};
use crate::domain::types::{BoundingBox, LocationSample, OverlayZone, ZoneGeometry};
use crate::services::coords;
use serde_json::Value;
use std::str::FromStr;
use tracing::{debug, warn};

const MIN_POLYGON_POINTS: usize = 3;
const MIN_ROUTE_POINTS: usize = 2;

/// Zone variant selected by the `type` discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    Polygon,
    Route,
}

impl FromStr for ZoneKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polygon" | "geofence" | "area" => Ok(ZoneKind::Polygon),
            "route" | "polyline" | "road" => Ok(ZoneKind::Route),
            _ => Err(()),
        }
    }
}

impl ZoneKind {
    fn min_points(self) -> usize {
        match self {
            ZoneKind::Polygon => MIN_POLYGON_POINTS,
            ZoneKind::Route => MIN_ROUTE_POINTS,
        }
    }
}

/// Resolved zones plus their combined bounds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayResolution {
    pub zones: Vec<OverlayZone>,
    /// `None` when nothing resolved, so callers leave the view alone
    pub bounds: Option<BoundingBox>,
    /// Zones or lists that were omitted, for diagnostics
    pub rejected: Vec<ConfigurationError>,
}

/// Resolve every zone configuration into renderable geometry
pub fn resolve(configs: &[ZoneConfig]) -> OverlayResolution {
    let mut out = OverlayResolution::default();

    for config in configs {
        let Ok(kind) = config.kind.parse::<ZoneKind>() else {
            let err = ConfigurationError::UnknownZoneType {
                zone: config.name.clone(),
                kind: config.kind.clone(),
            };
            warn!(error = %err, "zone_skipped");
            out.rejected.push(err);
            continue;
        };

        for (name, raw_points) in point_lists(config, kind) {
            let points = resolve_points(raw_points, kind);
            if points.len() < kind.min_points() {
                let err = ConfigurationError::Degenerate {
                    zone: name,
                    resolved: points.len(),
                    required: kind.min_points(),
                };
                debug!(error = %err, "zone_list_discarded");
                out.rejected.push(err);
                continue;
            }

            let geometry = match kind {
                ZoneKind::Polygon => ZoneGeometry::Polygon { points },
                ZoneKind::Route => ZoneGeometry::Route { waypoints: points },
            };
            out.zones.push(OverlayZone {
                attendance_type: config.attendance_type.clone(),
                name,
                geometry,
            });
        }
    }

    out.bounds = combined_bounds(&out.zones);
    debug!(zones = out.zones.len(), rejected = out.rejected.len(), "overlay_resolved");
    out
}

/// Smallest box containing every zone's points
pub fn combined_bounds(zones: &[OverlayZone]) -> Option<BoundingBox> {
    BoundingBox::from_points(zones.iter().flat_map(|z| z.geometry.points()))
}

/// Collect the single list and/or the named lists for a zone.
///
/// Named lists get "<zone> / <list>" names, falling back to a 1-based index.
fn point_lists(config: &ZoneConfig, kind: ZoneKind) -> Vec<(String, &[Value])> {
    let (single, named): (Option<&Vec<Value>>, Option<&Vec<NamedPointList>>) = match kind {
        ZoneKind::Polygon => (config.points.as_ref(), config.polygons.as_ref()),
        ZoneKind::Route => {
            (config.waypoints.as_ref().or(config.points.as_ref()), config.routes.as_ref())
        }
    };

    let mut lists = Vec::new();
    if let Some(points) = single {
        lists.push((config.name.clone(), points.as_slice()));
    }
    for (idx, list) in named.into_iter().flatten().enumerate() {
        let suffix = list.name.clone().unwrap_or_else(|| (idx + 1).to_string());
        lists.push((format!("{} / {}", config.name, suffix), list.points.as_slice()));
    }
    lists
}

fn resolve_points(raw: &[Value], kind: ZoneKind) -> Vec<LocationSample> {
    let mut points: Vec<LocationSample> = raw
        .iter()
        .filter_map(|v| match coords::parse(v) {
            Ok(p) => Some(p),
            Err(e) => {
                debug!(error = %e, "zone_point_skipped");
                None
            }
        })
        .collect();

    // A closed ring repeats its first point; it does not count towards the minimum
    if kind == ZoneKind::Polygon && points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn zone(value: serde_json::Value) -> ZoneConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_two_point_polygon_discarded() {
        let res = resolve(&[zone(json!({
            "name": "Tiny",
            "type": "polygon",
            "points": ["1,1", "1,2"]
        }))]);
        assert!(res.zones.is_empty());
        assert!(res.bounds.is_none());
        assert!(matches!(
            res.rejected[0],
            ConfigurationError::Degenerate { resolved: 2, required: 3, .. }
        ));
    }

    #[test]
    fn test_polygon_and_bounds() {
        let res = resolve(&[zone(json!({
            "attendance_type": "field",
            "name": "Depot",
            "type": "polygon",
            "points": ["23.80,90.40", {"lat": 23.82, "lng": 90.40}, "23.81,90.43"]
        }))]);

        assert_eq!(res.zones.len(), 1);
        assert_eq!(res.zones[0].attendance_type, "field");
        assert!(matches!(res.zones[0].geometry, ZoneGeometry::Polygon { ref points } if points.len() == 3));
        let b = res.bounds.unwrap();
        assert_eq!((b.min_lat, b.max_lat), (23.80, 23.82));
        assert_eq!((b.min_lng, b.max_lng), (90.40, 90.43));
    }

    #[test]
    fn test_named_polygons_each_become_a_zone() {
        let res = resolve(&[zone(json!({
            "name": "Campus",
            "type": "polygon",
            "polygons": [
                { "name": "North", "points": ["1,1", "1,2", "2,2"] },
                { "points": ["5,5", "5,6", "6,6", "6,5"] },
                { "name": "Broken", "points": ["1,1", "nope", "2,2"] }
            ]
        }))]);

        let names: Vec<&str> = res.zones.iter().map(|z| z.name.as_str()).collect();
        assert_eq!(names, vec!["Campus / North", "Campus / 2"]);
        assert_eq!(res.rejected.len(), 1);
        assert_eq!(res.bounds.unwrap().max_lat, 6.0);
    }

    #[test]
    fn test_closed_ring_counts_distinct_points() {
        let res = resolve(&[zone(json!({
            "name": "Closed",
            "type": "polygon",
            "points": ["1,1", "1,2", "1,1"]
        }))]);
        assert!(res.zones.is_empty());
    }

    #[test]
    fn test_routes() {
        let res = resolve(&[
            zone(json!({ "name": "Main road", "type": "route", "waypoints": ["1,1", "1,2"] })),
            zone(json!({ "name": "Stub", "type": "route", "waypoints": ["1,1"] })),
            zone(json!({
                "name": "Beats",
                "type": "polyline",
                "routes": [{ "name": "A", "waypoints": ["3,3", "3,4", "3,5"] }]
            })),
        ]);

        assert_eq!(res.zones.len(), 2);
        assert!(matches!(res.zones[0].geometry, ZoneGeometry::Route { .. }));
        assert_eq!(res.zones[1].name, "Beats / A");
        assert_eq!(res.rejected.len(), 1);
    }

    #[test]
    fn test_unknown_type_skipped() {
        let res = resolve(&[zone(json!({ "name": "Circle", "type": "circle", "points": [] }))]);
        assert!(res.zones.is_empty());
        assert!(matches!(res.rejected[0], ConfigurationError::UnknownZoneType { .. }));
    }

    #[test]
    fn test_empty_config_has_no_bounds() {
        let res = resolve(&[]);
        assert!(res.zones.is_empty());
        assert!(res.bounds.is_none());
    }
}
