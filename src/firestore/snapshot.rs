use super::models::Document;
use super::reference::convert_fields_to_serde_map;
use super::DocumentError;
use serde::de::DeserializeOwned;
use serde_json::map::Map;
use serde_json::Value as SerdeValue;

/// A snapshot of a document in Firestore.
///
/// Field values are already converted from Firestore's typed wire format to
/// plain JSON, so `data()` can deserialize them into any serde type.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub(crate) id: String,
    pub(crate) fields: Map<String, SerdeValue>,
    pub(crate) create_time: Option<String>,
    pub(crate) update_time: Option<String>,
}

impl DocumentSnapshot {
    pub fn new(id: impl Into<String>, fields: Map<String, SerdeValue>) -> Self {
        Self {
            id: id.into(),
            fields,
            create_time: None,
            update_time: None,
        }
    }

    pub(crate) fn from_document(doc: Document) -> Result<Self, DocumentError> {
        let id = doc.name.rsplit('/').next().unwrap_or_default().to_string();
        Ok(Self {
            id,
            fields: convert_fields_to_serde_map(doc.fields)?,
            create_time: doc.create_time,
            update_time: doc.update_time,
        })
    }

    /// The ID of the document.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The time the document was created, as reported by the server.
    pub fn create_time(&self) -> Option<&str> {
        self.create_time.as_deref()
    }

    /// The time the document was last updated, as reported by the server.
    pub fn update_time(&self) -> Option<&str> {
        self.update_time.as_deref()
    }

    pub fn fields(&self) -> &Map<String, SerdeValue> {
        &self.fields
    }

    /// Retrieves all fields in the document as a specific type.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, DocumentError> {
        Ok(serde_json::from_value(SerdeValue::Object(self.fields.clone()))?)
    }

    /// Retrieves a specific field from the document.
    ///
    /// # Arguments
    ///
    /// * `path` - The dot-separated path to the field (e.g., "address.city").
    pub fn get_field<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, DocumentError> {
        let mut segments = path.split('.');
        let Some(first) = segments.next() else {
            return Ok(None);
        };

        let mut current = self.fields.get(first);
        for segment in segments {
            current = current.and_then(|value| value.get(segment));
        }

        match current {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// A `QuerySnapshot` contains zero or more `DocumentSnapshot` objects, in query order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySnapshot {
    pub(crate) documents: Vec<DocumentSnapshot>,
    pub(crate) read_time: Option<String>,
}

impl QuerySnapshot {
    pub fn new(documents: Vec<DocumentSnapshot>) -> Self {
        Self {
            documents,
            read_time: None,
        }
    }

    /// The documents in this snapshot.
    pub fn documents(&self) -> &[DocumentSnapshot] {
        &self.documents
    }

    /// Returns `true` if there are no documents in the snapshot.
    pub fn empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// The number of documents in the snapshot.
    pub fn size(&self) -> usize {
        self.documents.len()
    }

    /// The time this snapshot was read.
    pub fn read_time(&self) -> Option<&str> {
        self.read_time.as_deref()
    }

    /// Iterates over the document snapshots.
    pub fn iter(&self) -> std::slice::Iter<'_, DocumentSnapshot> {
        self.documents.iter()
    }
}

impl<'a> IntoIterator for &'a QuerySnapshot {
    type Item = &'a DocumentSnapshot;
    type IntoIter = std::slice::Iter<'a, DocumentSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents.iter()
    }
}
