use crate::image::ContentDigest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partial implementation of the manifest v2 schema2 spec.
///
/// Reference: https://docs.docker.com/registry/spec/manifest-v2-2/
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Link,
    pub layers: Vec<Link>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Link {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: ContentDigest,
}

pub mod media_types {
    pub const MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const RUNTIME_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const LAYER_TAR_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
}

/// Image configuration file, the blob a manifest's `config` link points at
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RuntimeConfig {
    pub architecture: String,
    #[serde(default)]
    pub config: ImageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub os: String,
    pub rootfs: Filesystem,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ImageConfig {
    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    /// Sorted, so equal label sets always serialize to equal bytes
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

pub const FS_TYPE: &str = "layers";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Filesystem {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<ContentDigest>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            architecture: "amd64".to_owned(),
            config: ImageConfig::default(),
            created: Some(crate::layer::SOURCE_DATE_EPOCH_RFC3339.to_owned()),
            os: "linux".to_owned(),
            rootfs: Filesystem {
                fs_type: FS_TYPE.to_owned(),
                diff_ids: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manifest_field_names() {
        let digest = ContentDigest::from_content(b"{}");
        let manifest = Manifest {
            schema_version: 2,
            media_type: media_types::MANIFEST.to_owned(),
            config: Link {
                media_type: media_types::RUNTIME_CONFIG.to_owned(),
                size: 2,
                digest: digest.clone(),
            },
            layers: vec![],
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert_eq!(
            json,
            format!(
                concat!(
                    "{{\"schemaVersion\":2,",
                    "\"mediaType\":\"{}\",",
                    "\"config\":{{\"mediaType\":\"{}\",\"size\":2,\"digest\":\"{}\"}},",
                    "\"layers\":[]}}"
                ),
                media_types::MANIFEST,
                media_types::RUNTIME_CONFIG,
                digest
            )
        );
        let parsed: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn labels_serialize_sorted() {
        let mut config = RuntimeConfig::default();
        config.config.labels.insert("b".into(), "2".into());
        config.config.labels.insert("a".into(), "1".into());
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"Labels\":{\"a\":\"1\",\"b\":\"2\"}"));
    }

    #[test]
    fn config_tolerates_missing_fields() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers"}}"#,
        )
        .unwrap();
        assert!(config.config.labels.is_empty());
        assert!(config.rootfs.diff_ids.is_empty());
        assert_eq!(config.created, None);
    }
}
