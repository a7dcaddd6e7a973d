//! Catalog domain types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Type keyword that marks a feature service as a view of another service.
pub const VIEW_SERVICE_KEYWORD: &str = "View Service";

/// Export format requested for feature service backups.
pub const FILE_GEODATABASE: &str = "File Geodatabase";

/// Classification of a catalog item by its type label.
///
/// Labels are matched by exact string equality. Anything outside the
/// backed-up set is kept verbatim in [`ItemType::Other`] so reports and file
/// names reflect what the portal returned.
///
/// # Examples
///
/// ```
/// use agol_backup_core::models::ItemType;
///
/// assert_eq!(ItemType::from("Web Map"), ItemType::WebMap);
/// assert_eq!(ItemType::from("web map"), ItemType::Other("web map".to_string()));
/// assert!(ItemType::Dashboard.is_backed_up());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemType {
    FeatureService,
    WebMap,
    WebMappingApplication,
    Dashboard,
    Other(String),
}

impl ItemType {
    /// Returns the label used by the portal for this type.
    pub fn as_str(&self) -> &str {
        match self {
            ItemType::FeatureService => "Feature Service",
            ItemType::WebMap => "Web Map",
            ItemType::WebMappingApplication => "Web Mapping Application",
            ItemType::Dashboard => "Dashboard",
            ItemType::Other(label) => label,
        }
    }

    /// Returns true for the item types included in a backup.
    pub fn is_backed_up(&self) -> bool {
        match self {
            ItemType::FeatureService
            | ItemType::WebMap
            | ItemType::WebMappingApplication
            | ItemType::Dashboard => true,
            ItemType::Other(_) => false,
        }
    }
}

impl From<String> for ItemType {
    fn from(label: String) -> Self {
        match label.as_str() {
            "Feature Service" => ItemType::FeatureService,
            "Web Map" => ItemType::WebMap,
            "Web Mapping Application" => ItemType::WebMappingApplication,
            "Dashboard" => ItemType::Dashboard,
            _ => ItemType::Other(label),
        }
    }
}

impl From<&str> for ItemType {
    fn from(label: &str) -> Self {
        ItemType::from(label.to_string())
    }
}

impl From<ItemType> for String {
    fn from(item_type: ItemType) -> Self {
        match item_type {
            ItemType::Other(label) => label,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One catalog entry as returned by the portal.
///
/// Only the fields the backup logic inspects are typed. Every other field of
/// the metadata record is carried in `extras`, so serializing an `Item`
/// reproduces the full description record.
///
/// # Examples
///
/// ```
/// use agol_backup_core::models::{Item, ItemType};
///
/// let json = r#"{
///     "id": "a1b2",
///     "owner": "gis_admin",
///     "title": "Roads",
///     "type": "Feature Service",
///     "typeKeywords": ["ArcGIS Server", "Data", "Service"],
///     "numViews": 42
/// }"#;
///
/// let item: Item = serde_json::from_str(json).unwrap();
/// assert_eq!(item.item_type, ItemType::FeatureService);
/// assert_eq!(item.owner(), Some("gis_admin"));
/// assert!(!item.is_view());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(rename = "typeKeywords", default)]
    pub type_keywords: Vec<String>,
    /// All other metadata fields (owner, name, created, extent, ...).
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl Item {
    pub fn new(id: impl Into<String>, title: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            item_type,
            type_keywords: Vec::new(),
            extras: Map::new(),
        }
    }

    /// Builder-style helper used when constructing items by hand.
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.type_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style helper that sets an extra metadata field.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extras.insert(key.to_string(), value);
        self
    }

    /// The account that owns the item, if reported.
    pub fn owner(&self) -> Option<&str> {
        self.extras.get("owner").and_then(Value::as_str)
    }

    /// The item's file name, if it has one (packages and uploaded files do).
    pub fn name(&self) -> Option<&str> {
        self.extras
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
    }

    /// True when the item is a view over another feature service.
    pub fn is_view(&self) -> bool {
        self.type_keywords.iter().any(|k| k == VIEW_SERVICE_KEYWORD)
    }
}

/// Handle to a server-side export job, as returned by an export request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub job_id: String,
    /// Identifier of the package item the export is writing into.
    pub export_item_id: String,
}

/// Progress of an export job as reported by the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Processing,
    Completed,
    Failed(String),
}

/// Item that holds a packaged geodatabase produced by an export.
///
/// Located by title-prefix search once the export job finishes, downloaded,
/// then deleted from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    pub item: Item,
}

impl ExportArtifact {
    /// Local file name the package is saved under.
    pub fn file_name(&self) -> String {
        match self.item.name() {
            Some(name) => name.to_string(),
            None => format!("{}.zip", self.item.title),
        }
    }
}
