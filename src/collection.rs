/// Assembly and serialization of GeoJSON feature collections.
use serde::Serialize;

use crate::encoder::Feature;
use crate::error::Error;
use crate::tile::{BoundingBox, DEFAULT_SRID};

/// Options of one collection. They are consumed when the collection is finished.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectionOptions {
    /// Attach a `crs` member.
    pub crs: bool,
    pub srid: i32,
    pub bbox: Option<BoundingBox>,
    /// Indent the output.
    pub pretty: bool,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            crs: true,
            srid: DEFAULT_SRID,
            bbox: None,
            pretty: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CrsProperties {
    pub href: String,
    #[serde(rename = "type")]
    pub crs_type: String,
}

/// A linked coordinate reference system.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Crs {
    #[serde(rename = "type")]
    pub crs_type: String,
    pub properties: CrsProperties,
}

impl Crs {
    pub fn link(srid: i32) -> Crs {
        Crs {
            crs_type: "link".to_string(),
            properties: CrsProperties {
                href: format!("http://spatialreference.org/ref/epsg/{}/", srid),
                crs_type: "proj4".to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    collection_type: &'static str,
    pub features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crs: Option<Crs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(skip)]
    pretty: bool,
}

impl FeatureCollection {
    /// UTF-8 GeoJSON text.
    pub fn to_vec(&self) -> Result<Vec<u8>, Error> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(self)?
        } else {
            serde_json::to_vec(self)?
        };
        Ok(bytes)
    }
}

/// Collects the features of one response.
#[derive(Debug)]
pub struct FeatureCollectionBuilder {
    options: CollectionOptions,
    features: Vec<Feature>,
}

impl FeatureCollectionBuilder {
    pub fn new(options: CollectionOptions) -> FeatureCollectionBuilder {
        FeatureCollectionBuilder {
            options,
            features: Vec::new(),
        }
    }

    pub fn push(&mut self, feature: Feature) {
        self.features.push(feature);
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn finish(self) -> FeatureCollection {
        let FeatureCollectionBuilder { options, features } = self;

        FeatureCollection {
            collection_type: "FeatureCollection",
            features,
            crs: options.crs.then(|| Crs::link(options.srid)),
            bbox: options.bbox.map(|bbox| bbox.to_array()),
            pretty: options.pretty,
        }
    }
}

impl Extend<Feature> for FeatureCollectionBuilder {
    fn extend<T: IntoIterator<Item = Feature>>(&mut self, features: T) {
        self.features.extend(features);
    }
}

#[cfg(test)]
mod tests {
    use geo::{point, Geometry};
    use serde_json::{json, Value as JsonValue};

    use super::*;

    fn bbox() -> BoundingBox {
        BoundingBox {
            min_lon: -180.0,
            min_lat: -85.5,
            max_lon: 180.0,
            max_lat: 85.5,
            srid: 4326,
        }
    }

    #[test]
    fn test_empty_collection_keeps_metadata() {
        let collection = FeatureCollectionBuilder::new(CollectionOptions {
            bbox: Some(bbox()),
            ..CollectionOptions::default()
        })
        .finish();

        let value: JsonValue = serde_json::from_slice(&collection.to_vec().unwrap()).unwrap();
        assert_eq!(
            json!({
                "type": "FeatureCollection",
                "features": [],
                "crs": {
                    "type": "link",
                    "properties": {
                        "href": "http://spatialreference.org/ref/epsg/4326/",
                        "type": "proj4"
                    }
                },
                "bbox": [-180.0, -85.5, 180.0, 85.5]
            }),
            value
        );
    }

    #[test]
    fn test_crs_disabled() {
        let collection = FeatureCollectionBuilder::new(CollectionOptions {
            crs: false,
            ..CollectionOptions::default()
        })
        .finish();

        assert_eq!(
            b"{\"type\":\"FeatureCollection\",\"features\":[]}".to_vec(),
            collection.to_vec().unwrap()
        );
    }

    #[test]
    fn test_custom_srid() {
        let collection = FeatureCollectionBuilder::new(CollectionOptions {
            srid: 3857,
            ..CollectionOptions::default()
        })
        .finish();
        assert_eq!(
            "http://spatialreference.org/ref/epsg/3857/",
            collection.crs.unwrap().properties.href
        );
    }

    #[test]
    fn test_features_in_order() {
        let mut builder = FeatureCollectionBuilder::new(CollectionOptions::default());
        builder.push(Feature::new(json!(1), Some(Geometry::Point(point!(x: 0.5, y: 0.25)))));
        builder.extend(vec![Feature::new(json!(2), None)]);
        assert_eq!(2, builder.len());

        let value = serde_json::to_value(builder.finish()).unwrap();
        assert_eq!(json!(1), value["features"][0]["id"]);
        assert_eq!(json!([0.5, 0.25]), value["features"][0]["geometry"]["coordinates"]);
        assert_eq!(json!(2), value["features"][1]["id"]);
        assert_eq!(JsonValue::Null, value["features"][1]["geometry"]);
    }

    #[test]
    fn test_pretty_output() {
        let collection = FeatureCollectionBuilder::new(CollectionOptions {
            crs: false,
            pretty: true,
            ..CollectionOptions::default()
        })
        .finish();

        let text = String::from_utf8(collection.to_vec().unwrap()).unwrap();
        assert!(text.contains("\n  \"type\": \"FeatureCollection\""));
    }
}
