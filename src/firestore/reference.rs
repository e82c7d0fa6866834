use super::models::{
    ArrayValue, CommitRequest, CommitResponse, Document, DocumentMask, FieldTransform, MapValue,
    Precondition, ServerValue, Value, ValueType, Write, WriteOperation,
};
use super::snapshot::DocumentSnapshot;
use super::DocumentError;
use crate::core::parse_error_response;
use reqwest::header;
use reqwest_middleware::ClientWithMiddleware;
use serde::de::Error;
use serde::ser::Error as SerError;
use serde::Serialize;
use serde_json::map::Map;
use serde_json::Value as SerdeValue;
use std::collections::HashMap;

// Helper to convert Firestore's value map to a plain JSON object
pub(crate) fn convert_fields_to_serde_map(
    fields: HashMap<String, Value>,
) -> Result<Map<String, SerdeValue>, DocumentError> {
    let mut map = Map::new();
    for (key, value) in fields {
        map.insert(key, convert_value_to_serde_value(value)?);
    }
    Ok(map)
}

pub(crate) fn convert_value_to_serde_value(value: Value) -> Result<SerdeValue, DocumentError> {
    use serde_json::json;
    Ok(match value.value_type {
        ValueType::StringValue(s) => SerdeValue::String(s),
        ValueType::IntegerValue(s) => {
            let i: i64 = s.parse().map_err(|e| {
                <serde_json::Error as Error>::custom(format!(
                    "Failed to parse integer string '{}': {}",
                    s, e
                ))
            })?;
            SerdeValue::Number(i.into())
        }
        ValueType::DoubleValue(d) => SerdeValue::Number(
            serde_json::Number::from_f64(d).ok_or_else(|| {
                <serde_json::Error as Error>::custom(format!("Invalid f64 value: {}", d))
            })?,
        ),
        ValueType::BooleanValue(b) => SerdeValue::Bool(b),
        ValueType::MapValue(map_value) => SerdeValue::Object(convert_fields_to_serde_map(map_value.fields)?),
        ValueType::ArrayValue(array_value) => {
            let values = array_value
                .values
                .into_iter()
                .map(convert_value_to_serde_value)
                .collect::<Result<Vec<_>, _>>()?;
            SerdeValue::Array(values)
        }
        ValueType::NullValue(_) => SerdeValue::Null,
        // RFC 3339, which chrono deserializes straight into `DateTime<Utc>`.
        ValueType::TimestampValue(s) => SerdeValue::String(s),
        ValueType::GeoPointValue(gp) => {
            json!({ "latitude": gp.latitude, "longitude": gp.longitude })
        }
        ValueType::BytesValue(s) => SerdeValue::String(s),
        ValueType::ReferenceValue(s) => SerdeValue::String(s),
    })
}

pub(crate) fn convert_serde_value_to_firestore_value(value: SerdeValue) -> Result<Value, DocumentError> {
    let value_type = match value {
        SerdeValue::Null => ValueType::NullValue(()),
        SerdeValue::Bool(b) => ValueType::BooleanValue(b),
        SerdeValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                ValueType::IntegerValue(i.to_string())
            } else if let Some(f) = n.as_f64() {
                ValueType::DoubleValue(f)
            } else {
                return Err(DocumentError::SerializationError(SerError::custom(format!(
                    "Unsupported number type: {}",
                    n
                ))));
            }
        }
        SerdeValue::String(s) => ValueType::StringValue(s),
        SerdeValue::Array(a) => {
            let values = a
                .into_iter()
                .map(convert_serde_value_to_firestore_value)
                .collect::<Result<Vec<_>, _>>()?;
            ValueType::ArrayValue(ArrayValue { values })
        }
        SerdeValue::Object(o) => ValueType::MapValue(MapValue {
            fields: convert_serde_map_to_fields(o)?,
        }),
    };
    Ok(Value { value_type })
}

fn convert_serde_map_to_fields(map: Map<String, SerdeValue>) -> Result<HashMap<String, Value>, DocumentError> {
    let mut fields = HashMap::new();
    for (k, v) in map {
        fields.insert(k, convert_serde_value_to_firestore_value(v)?);
    }
    Ok(fields)
}

/// `https://host/v1/projects/p/databases/(default)/documents` becomes
/// `projects/p/databases/(default)/documents`.
pub(crate) fn resource_root(base_url: &str) -> &str {
    base_url
        .find("projects/")
        .map(|idx| &base_url[idx..])
        .unwrap_or(base_url)
}

/// The database resource name, without the trailing `/documents`.
pub(crate) fn database_path(base_url: &str) -> &str {
    let root = resource_root(base_url);
    root.strip_suffix("/documents").unwrap_or(root)
}

/// Field values for a document write, plus the fields the server fills in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteData {
    fields: Map<String, SerdeValue>,
    server_timestamps: Vec<String>,
}

impl WriteData {
    /// Serializes `value`, which must serialize to a JSON object.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, DocumentError> {
        match serde_json::to_value(value)? {
            SerdeValue::Object(fields) => Ok(Self {
                fields,
                server_timestamps: Vec::new(),
            }),
            _ => Err(DocumentError::SerializationError(SerError::custom(
                "Can only set objects as documents",
            ))),
        }
    }

    /// Marks `field` to be set to the commit time by the server.
    ///
    /// Any client-side value for the field is dropped.
    pub fn server_timestamp(mut self, field: &str) -> Self {
        self.fields.remove(field);
        if !self.server_timestamps.iter().any(|f| f == field) {
            self.server_timestamps.push(field.to_string());
        }
        self
    }

    pub fn fields(&self) -> &Map<String, SerdeValue> {
        &self.fields
    }

    pub fn server_timestamps(&self) -> &[String] {
        &self.server_timestamps
    }

    pub(crate) fn to_write(&self, name: String, update_mask: bool, exists: Option<bool>) -> Result<Write, DocumentError> {
        let mask = update_mask.then(|| DocumentMask {
            field_paths: self.fields.keys().cloned().collect(),
        });

        let transforms = (!self.server_timestamps.is_empty()).then(|| {
            self.server_timestamps
                .iter()
                .map(|field| FieldTransform {
                    field_path: field.clone(),
                    set_to_server_value: ServerValue::RequestTime,
                })
                .collect()
        });

        Ok(Write {
            operation: WriteOperation::Update(Document {
                name,
                fields: convert_serde_map_to_fields(self.fields.clone())?,
                create_time: None,
                update_time: None,
            }),
            update_mask: mask,
            update_transforms: transforms,
            current_document: exists.map(|exists| Precondition { exists }),
        })
    }
}

#[derive(Clone)]
pub struct DocumentReference<'a> {
    pub(crate) client: &'a ClientWithMiddleware,
    pub(crate) base_url: &'a str,
    pub(crate) path: String,
}

impl<'a> DocumentReference<'a> {
    pub fn path(&self) -> &str {
        &self.path
    }

    fn url(&self) -> String {
        format!("{}/{}", self.base_url, self.path)
    }

    fn resource_name(&self) -> String {
        format!("{}/{}", resource_root(self.base_url), self.path)
    }

    pub async fn get(&self) -> Result<Option<DocumentSnapshot>, DocumentError> {
        let response = self.client.get(self.url()).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(DocumentError::from_failure(
                parse_error_response(response, "Get document failed").await,
            ));
        }

        let doc: Document = response.json().await?;
        Ok(Some(DocumentSnapshot::from_document(doc)?))
    }

    /// Creates or overwrites the document.
    pub async fn set(&self, data: &WriteData) -> Result<(), DocumentError> {
        let write = data.to_write(self.resource_name(), false, None)?;
        self.commit(write, "Set document failed").await
    }

    /// Overwrites the given fields. Fails with `NotFound` if the document is missing.
    pub async fn update(&self, data: &WriteData) -> Result<(), DocumentError> {
        let write = data.to_write(self.resource_name(), true, Some(true))?;
        self.commit(write, "Update document failed").await
    }

    /// Writes a new document. Fails if one already exists at this path.
    pub async fn create(&self, data: &WriteData) -> Result<(), DocumentError> {
        let write = data.to_write(self.resource_name(), false, Some(false))?;
        self.commit(write, "Create document failed").await
    }

    async fn commit(&self, write: Write, default_msg: &str) -> Result<(), DocumentError> {
        let url = format!("{}:commit", self.base_url);
        let request = CommitRequest { writes: vec![write] };

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&request)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DocumentError::from_failure(
                parse_error_response(response, default_msg).await,
            ));
        }

        let _: CommitResponse = response.json().await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct CollectionReference<'a> {
    pub(crate) client: &'a ClientWithMiddleware,
    pub(crate) base_url: &'a str,
    pub(crate) path: String,
}

impl<'a> CollectionReference<'a> {
    pub fn doc(&self, document_id: &str) -> DocumentReference<'a> {
        DocumentReference {
            client: self.client,
            base_url: self.base_url,
            path: format!("{}/{}", self.path, document_id),
        }
    }

    /// Appends a document under a client-generated id and returns that id.
    pub async fn add(&self, data: &WriteData) -> Result<String, DocumentError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.doc(&id).create(data).await?;
        Ok(id)
    }
}
