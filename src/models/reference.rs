//! Relationship fields in store documents arrive either as a bare id or as an
//! embedded copy of the referenced document. They are collapsed to ids (and,
//! for hubs, a coordinate) while deserializing so nothing downstream has to
//! care which shape the backend sent.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::models::coordinate::Coordinate;

pub trait Identified {
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reference<T> {
    Id(String),
    Embedded(T),
}

impl<T: Identified> Reference<T> {
    pub fn embedded(&self) -> Option<&T> {
        match self {
            Reference::Id(_) => None,
            Reference::Embedded(value) => Some(value),
        }
    }
}

pub fn resolve_reference<T: Identified>(value: &Reference<T>) -> String {
    match value {
        Reference::Id(id) => id.clone(),
        Reference::Embedded(document) => document.id().to_string(),
    }
}

/// Any embedded document; only its id is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Identified for Document {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Embedded hub document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubDocument {
    #[serde(alias = "_id")]
    pub id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Identified for HubDocument {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HubDocument {
    pub fn coordinate(&self) -> Option<Coordinate> {
        Coordinate::from_parts(self.latitude, self.longitude)
    }
}

/// `deserialize_with` helper for optional relationship fields.
pub fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Reference<Document>>::deserialize(deserializer)?;
    Ok(value
        .map(|reference| resolve_reference(&reference))
        .filter(|id| !id.trim().is_empty()))
}
