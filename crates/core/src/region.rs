//! Regions: named polygons over which rasters are reduced to scalars

use crate::error::{Error, Result};
use geo::Area;
use geo_types::{Coord, LineString, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Attribute value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl AttributeValue {
    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => AttributeValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => AttributeValue::Int(i),
                None => AttributeValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => AttributeValue::String(s.clone()),
            other => AttributeValue::String(other.to_string()),
        }
    }

    /// Textual label usable as an identifier; empty strings and nulls yield `None`
    pub fn as_label(&self) -> Option<String> {
        let label = match self {
            AttributeValue::Null => return None,
            AttributeValue::Bool(b) => b.to_string(),
            AttributeValue::Int(i) => i.to_string(),
            AttributeValue::Float(f) if f.is_finite() => f.to_string(),
            AttributeValue::Float(_) => return None,
            AttributeValue::String(s) => s.trim().to_string(),
        };
        (!label.is_empty()).then_some(label)
    }
}

/// Stable identifier of a region, used as the join key of every output table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId(String);

impl RegionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier fallback chain: name property, then stable feature id,
    /// then the positional index.
    pub fn resolve(name: Option<&AttributeValue>, feature_id: Option<&str>, index: usize) -> Self {
        if let Some(label) = name.and_then(AttributeValue::as_label) {
            return Self(label);
        }
        if let Some(fid) = feature_id.map(str::trim).filter(|s| !s.is_empty()) {
            return Self(fid.to_string());
        }
        Self(index.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named polygon boundary, supplied externally and never mutated
#[derive(Debug, Clone)]
pub struct Region {
    pub id: RegionId,
    pub geometry: MultiPolygon<f64>,
    pub properties: BTreeMap<String, AttributeValue>,
}

impl Region {
    pub fn new(id: RegionId, geometry: MultiPolygon<f64>) -> Self {
        Self {
            id,
            geometry,
            properties: BTreeMap::new(),
        }
    }

    pub fn from_polygon(id: impl Into<String>, polygon: Polygon<f64>) -> Self {
        Self::new(RegionId::new(id), MultiPolygon(vec![polygon]))
    }

    pub fn property(&self, key: &str) -> Option<&AttributeValue> {
        self.properties.get(key)
    }

    /// Reject empty or degenerate boundaries
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidGeometry {
            region: self.id.to_string(),
            reason: reason.to_string(),
        };

        if self.geometry.0.is_empty() {
            return Err(invalid("empty geometry"));
        }
        for polygon in &self.geometry.0 {
            let ring = polygon.exterior();
            if ring.coords().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
                return Err(invalid("non-finite coordinate"));
            }
            if distinct_vertices(ring) < 3 {
                return Err(invalid("exterior ring has fewer than three distinct vertices"));
            }
        }
        if self.geometry.unsigned_area() <= 0.0 {
            return Err(invalid("zero area"));
        }
        Ok(())
    }
}

fn distinct_vertices(ring: &LineString<f64>) -> usize {
    let mut seen: Vec<Coord<f64>> = Vec::new();
    for c in ring.coords() {
        if !seen.iter().any(|s| s == c) {
            seen.push(*c);
        }
    }
    seen.len()
}

// ---------------------------------------------------------------------------
// GeoJSON loading
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeatureCollectionDoc {
    features: Vec<FeatureDoc>,
}

#[derive(Debug, Deserialize)]
struct FeatureDoc {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    properties: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    geometry: Option<GeometryDoc>,
}

#[derive(Debug, Deserialize)]
struct GeometryDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: Value,
}

type RingCoords = Vec<Vec<f64>>;

fn ring_from(coords: &RingCoords) -> LineString<f64> {
    LineString::from(
        coords
            .iter()
            .map(|p| Coord {
                x: p.first().copied().unwrap_or(f64::NAN),
                y: p.get(1).copied().unwrap_or(f64::NAN),
            })
            .collect::<Vec<_>>(),
    )
}

fn polygon_from(rings: &[RingCoords]) -> Option<Polygon<f64>> {
    let (exterior, interiors) = rings.split_first()?;
    Some(Polygon::new(
        ring_from(exterior),
        interiors.iter().map(ring_from).collect(),
    ))
}

/// Geometry of a GeoJSON feature. Non-areal or malformed geometries become an
/// empty multipolygon so the region is rejected by `Region::validate` alone.
fn geometry_from(doc: Option<&GeometryDoc>) -> MultiPolygon<f64> {
    let Some(doc) = doc else {
        return MultiPolygon(Vec::new());
    };
    let polygons = match doc.kind.as_str() {
        "Polygon" => serde_json::from_value::<Vec<RingCoords>>(doc.coordinates.clone())
            .ok()
            .and_then(|rings| polygon_from(&rings))
            .into_iter()
            .collect(),
        "MultiPolygon" => serde_json::from_value::<Vec<Vec<RingCoords>>>(doc.coordinates.clone())
            .map(|parts| parts.iter().filter_map(|rings| polygon_from(rings)).collect())
            .unwrap_or_default(),
        other => {
            tracing::warn!(geometry = other, "unsupported region geometry type");
            Vec::new()
        }
    };
    MultiPolygon(polygons)
}

/// Parse regions from a GeoJSON `FeatureCollection`.
///
/// Region identifiers follow [`RegionId::resolve`] with `name_property`
/// as the name attribute.
pub fn regions_from_geojson(text: &str, name_property: &str) -> Result<Vec<Region>> {
    let doc: FeatureCollectionDoc = serde_json::from_str(text)
        .map_err(|e| Error::Other(format!("Invalid GeoJSON feature collection: {e}")))?;

    let regions = doc
        .features
        .iter()
        .enumerate()
        .map(|(index, feature)| {
            let properties: BTreeMap<String, AttributeValue> = feature
                .properties
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), AttributeValue::from_json(v)))
                .collect();
            let feature_id = feature.id.as_ref().and_then(|v| AttributeValue::from_json(v).as_label());
            let id = RegionId::resolve(properties.get(name_property), feature_id.as_deref(), index);

            Region {
                id,
                geometry: geometry_from(feature.geometry.as_ref()),
                properties,
            }
        })
        .collect();

    Ok(regions)
}

/// Read regions from a GeoJSON file
pub fn read_regions<P: AsRef<Path>>(path: P, name_property: &str) -> Result<Vec<Region>> {
    let text = std::fs::read_to_string(path.as_ref())?;
    regions_from_geojson(&text, name_property)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::polygon;

    const REGIONS: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "id": "CL-16", "properties": {"name": "Ñuble"},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[2,0],[2,2],[0,2],[0,0]]]}},
            {"type": "Feature", "id": 17, "properties": {"name": ""},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[3,3],[4,3],[4,4],[3,3]]]]}},
            {"type": "Feature", "properties": {"code": 5},
             "geometry": {"type": "Point", "coordinates": [1, 1]}}
        ]
    }"#;

    #[test]
    fn test_id_resolution_chain() {
        let name = AttributeValue::String("Biobío".into());
        assert_eq!(RegionId::resolve(Some(&name), Some("f1"), 3).as_str(), "Biobío");

        let blank = AttributeValue::String("  ".into());
        assert_eq!(RegionId::resolve(Some(&blank), Some("f1"), 3).as_str(), "f1");
        assert_eq!(RegionId::resolve(None, Some(""), 3).as_str(), "3");
        assert_eq!(RegionId::resolve(Some(&AttributeValue::Null), None, 0).as_str(), "0");
    }

    #[test]
    fn test_geojson_loading() {
        let regions = regions_from_geojson(REGIONS, "name").unwrap();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].id.as_str(), "Ñuble");
        assert_eq!(regions[1].id.as_str(), "17");
        assert_eq!(regions[2].id.as_str(), "2");

        assert!(regions[0].validate().is_ok());
        assert!(regions[1].validate().is_ok());
        assert!(matches!(regions[2].validate(), Err(Error::InvalidGeometry { .. })));
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        let line = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)];
        let region = Region::from_polygon("sliver", line);
        assert!(matches!(region.validate(), Err(Error::InvalidGeometry { .. })));

        let collinear = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0), (x: 2.0, y: 2.0)];
        let region = Region::from_polygon("flat", collinear);
        assert!(matches!(region.validate(), Err(Error::InvalidGeometry { .. })));
    }

    #[test]
    fn test_malformed_geojson() {
        assert!(regions_from_geojson("{\"features\": 3}", "name").is_err());
    }
}
