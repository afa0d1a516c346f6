//! Catalog entries produced by discovery, and the replication metadata the
//! engine reads from them.

use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::mongo::projection::is_truthy;
use crate::mongo::Namespace;
use crate::{Error, Result};

pub const SELECTED: &str = "selected";
pub const REPLICATION_METHOD: &str = "replication-method";
pub const REPLICATION_KEY: &str = "replication-key";
pub const DATABASE_NAME: &str = "database-name";
pub const IS_VIEW: &str = "is-view";
pub const PROJECTION: &str = "tap-mongodb.projection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationMethod {
    FullTable,
    Incremental,
    LogBased,
}

impl ReplicationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMethod::FullTable => "FULL_TABLE",
            ReplicationMethod::Incremental => "INCREMENTAL",
            ReplicationMethod::LogBased => "LOG_BASED",
        }
    }
}

impl fmt::Display for ReplicationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicationMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "FULL_TABLE" => Ok(ReplicationMethod::FullTable),
            "INCREMENTAL" => Ok(ReplicationMethod::Incremental),
            "LOG_BASED" => Ok(ReplicationMethod::LogBased),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogEntry>,
}

impl Catalog {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid catalog {:?}: {}", path.as_ref(), e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub tap_stream_id: String,
    pub table_name: String,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub schema: Value,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    #[serde(default)]
    pub breadcrumb: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CatalogEntry {
    /// Metadata attached to the stream itself (empty breadcrumb).
    pub fn root_metadata(&self) -> Option<&Map<String, Value>> {
        self.metadata
            .iter()
            .find(|entry| entry.breadcrumb.is_empty())
            .map(|entry| &entry.metadata)
    }

    fn root_value(&self, key: &str) -> Option<&Value> {
        self.root_metadata()
            .and_then(|metadata| metadata.get(key))
            .filter(|value| !value.is_null())
    }

    fn root_str(&self, key: &str) -> Option<&str> {
        self.root_value(key).and_then(Value::as_str)
    }

    pub fn is_selected(&self) -> bool {
        self.root_value(SELECTED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_view(&self) -> bool {
        self.root_value(IS_VIEW)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The configured method, as written. Absent counts as FULL_TABLE.
    pub fn method_name(&self) -> &str {
        self.root_str(REPLICATION_METHOD).unwrap_or("FULL_TABLE")
    }

    pub fn replication_method(&self) -> Result<ReplicationMethod> {
        self.method_name()
            .parse()
            .map_err(|method| Error::UnsupportedReplicationMethod {
                stream: self.tap_stream_id.clone(),
                method,
            })
    }

    pub fn replication_key(&self) -> Option<&str> {
        self.root_str(REPLICATION_KEY).filter(|key| !key.is_empty())
    }

    pub fn database_name(&self) -> Result<&str> {
        self.root_str(DATABASE_NAME).ok_or_else(|| {
            Error::Config(format!(
                "stream {} has no {} metadata",
                self.tap_stream_id, DATABASE_NAME
            ))
        })
    }

    pub fn namespace(&self) -> Result<Namespace> {
        Ok(Namespace::new(self.database_name()?, self.table_name.as_str()))
    }

    /// Stream name used on output messages.
    pub fn destination_name(&self, include_database: bool) -> Result<String> {
        if include_database {
            Ok(format!("{}-{}", self.database_name()?, self.table_name))
        } else {
            Ok(self.table_name.clone())
        }
    }

    /// Parses `tap-mongodb.projection`.
    ///
    /// Returns `None` for a missing or empty projection. A projection that
    /// is not a JSON object, or that excludes `_id`, is rejected.
    pub fn projection(&self) -> Result<Option<Document>> {
        let invalid = |message: String| Error::InvalidProjection {
            stream: self.tap_stream_id.clone(),
            message,
        };

        let raw = match self.root_value(PROJECTION) {
            None => return Ok(None),
            Some(Value::String(text)) => {
                let text = text.trim();
                if text.is_empty() || text == "\"\"" {
                    return Ok(None);
                }
                serde_json::from_str::<Value>(text)
                    .map_err(|e| invalid(format!("not valid JSON: {}", e)))?
            }
            Some(other) => other.clone(),
        };

        let Value::Object(_) = raw else {
            return Err(invalid(format!("expected a JSON object, found {}", raw)));
        };
        let projection = match Bson::try_from(raw) {
            Ok(Bson::Document(doc)) => doc,
            Ok(other) => return Err(invalid(format!("expected a document, found {}", other))),
            Err(e) => return Err(invalid(e.to_string())),
        };

        if let Some(id) = projection.get("_id") {
            if !is_truthy(id) {
                return Err(invalid("the projection must not exclude _id".to_string()));
            }
        }

        if projection.is_empty() {
            return Ok(None);
        }
        Ok(Some(projection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;
    use serde_json::json;

    fn entry(metadata: Value) -> CatalogEntry {
        serde_json::from_value(json!({
            "tap_stream_id": "shop-orders",
            "table_name": "orders",
            "stream": "orders",
            "schema": { "type": "object" },
            "metadata": [
                { "breadcrumb": ["properties", "total"], "metadata": { "selected": false } },
                { "breadcrumb": [], "metadata": metadata },
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_root_metadata_accessors() {
        let e = entry(json!({
            "selected": true,
            "replication-method": "INCREMENTAL",
            "replication-key": "updated_at",
            "database-name": "shop",
        }));

        assert!(e.is_selected());
        assert!(!e.is_view());
        assert_eq!(e.replication_method().unwrap(), ReplicationMethod::Incremental);
        assert_eq!(e.replication_key(), Some("updated_at"));
        assert_eq!(e.namespace().unwrap(), Namespace::new("shop", "orders"));
        assert_eq!(e.destination_name(false).unwrap(), "orders");
        assert_eq!(e.destination_name(true).unwrap(), "shop-orders");
    }

    #[test]
    fn test_defaults_when_metadata_missing() {
        let e = entry(json!({}));
        assert!(!e.is_selected());
        assert_eq!(e.replication_method().unwrap(), ReplicationMethod::FullTable);
        assert!(e.replication_key().is_none());
        assert!(matches!(e.database_name(), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_method_is_configuration_error() {
        let e = entry(json!({ "replication-method": "CHANGE_STREAM" }));
        let err = e.replication_method().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("CHANGE_STREAM"));
    }

    #[test]
    fn test_projection_parsing() {
        assert_eq!(entry(json!({})).projection().unwrap(), None);
        assert_eq!(
            entry(json!({ "tap-mongodb.projection": "" })).projection().unwrap(),
            None
        );
        assert_eq!(
            entry(json!({ "tap-mongodb.projection": "\"\"" })).projection().unwrap(),
            None
        );
        assert_eq!(
            entry(json!({ "tap-mongodb.projection": "{\"name\": 1, \"_id\": 1}" }))
                .projection()
                .unwrap(),
            Some(doc! { "name": 1, "_id": 1 })
        );
    }

    #[test]
    fn test_invalid_projections() {
        for raw in ["{not json", "[1, 2]", "{\"_id\": 0}", "{\"name\": 1, \"_id\": false}"] {
            let err = entry(json!({ "tap-mongodb.projection": raw }))
                .projection()
                .unwrap_err();
            assert!(
                matches!(err, Error::InvalidProjection { .. }),
                "{} gave {:?}",
                raw,
                err
            );
        }
    }
}
