//! Typed entities and their document form.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::{Document, EntityKey, EntitySchema, TableCacheResult, TransportError};

/// A typed entity that can be cached.
///
/// The document form is the entity's serde JSON object; it must serialize
/// to a JSON object that contains the schema's key fields.
pub trait CacheableEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Schema shared by every instance of this entity type.
    fn schema() -> EntitySchema;

    /// Key of this instance.
    fn entity_key(&self) -> TableCacheResult<EntityKey> {
        let document = to_document(self)?;
        Ok(Self::schema().key_of(&document)?)
    }
}

/// Serialize an entity into its document form.
pub fn to_document<E: Serialize>(entity: &E) -> TableCacheResult<Document> {
    match serde_json::to_value(entity)? {
        Value::Object(map) => Ok(map),
        other => Err(TransportError::Serialization {
            reason: format!(
                "entity serialized to {} instead of an object",
                crate::key::json_type_name(&other)
            ),
        }
        .into()),
    }
}

/// Deserialize an entity from its document form.
pub fn from_document<E: DeserializeOwned>(document: Document) -> TableCacheResult<E> {
    Ok(serde_json::from_value(Value::Object(document))?)
}

/// Keep only the listed fields (plus key fields) of a document.
pub fn project_document(schema: &EntitySchema, document: &Document, fields: &[String]) -> Document {
    document
        .iter()
        .filter(|(name, _)| schema.is_key_field(name) || fields.iter().any(|f| f == *name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
