//! The document-store interface (spec.md §6.2) and an in-memory reference
//! implementation used to exercise it end-to-end. Only the *interface shape* is in
//! scope - spec.md §1 explicitly excludes the semantics of a live document-store
//! backend, so this never talks to a real Firestore.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use replicate_common::path::Path;

/// One document-store value, matching the primitive/array/struct mapping in
/// spec.md §6.2: sets serialise as `{element: true}` maps, maps as `{key: value}`,
/// structs as nested dictionaries, all keyed by `"{name}${id}"`.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentValue {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	Vec3([f64; 3]),
	List(Vec<DocumentValue>),
	Map(HashMap<String, DocumentValue>),
}

/// A document keyed by `"{field_name}${field_id}"`, matching spec.md §6.2's field
/// naming convention.
pub type Document = HashMap<String, DocumentValue>;

/// The external document-store interface (spec.md §6.2). Implementations persist
/// (or, for this reference implementation, merely retain) one document per resolved
/// path; deletes use the store's field-delete sentinel rather than omission, so a
/// caller can distinguish "never written" from "explicitly cleared".
pub trait DocumentStore: Send + Sync {
	/// Builds the external path string for `path`, joining
	/// `{collection_field_name}${collection_field_id}/{key}` elements (spec.md §6.2).
	fn document_path(&self, path: &Path) -> String {
		document_path(path)
	}

	fn get(&self, path: &Path) -> Option<Document>;
	fn set(&self, path: &Path, document: Document);
	fn delete_field(&self, path: &Path, field_key: &str);
}

/// `{collection_field_name}${collection_field_id}/{key}` joined by `/`, per spec.md
/// §6.2. Since this schema's only collection is `rooms` (field id 1), the name is
/// hardcoded; a generated schema would look the field name up per segment.
fn document_path(path: &Path) -> String {
	path.segments()
		.iter()
		.map(|segment| format!("rooms${}/{}", segment.collection_id, segment.key))
		.collect::<Vec<_>>()
		.join("/")
}

/// An in-memory `DocumentStore`, sufficient to make spec.md §6.2's interface
/// testable end-to-end without a live Firestore project.
#[derive(Default)]
pub struct InMemoryDocumentStore {
	documents: StdMutex<HashMap<String, Document>>,
}

impl InMemoryDocumentStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl DocumentStore for InMemoryDocumentStore {
	fn get(&self, path: &Path) -> Option<Document> {
		self.documents.lock().unwrap().get(&document_path(path)).cloned()
	}

	fn set(&self, path: &Path, document: Document) {
		self.documents.lock().unwrap().insert(document_path(path), document);
	}

	fn delete_field(&self, path: &Path, field_key: &str) {
		if let Some(doc) = self.documents.lock().unwrap().get_mut(&document_path(path)) {
			doc.insert(field_key.to_string(), DocumentValue::Null);
		}
	}
}
