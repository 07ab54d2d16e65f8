use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub notebooks: Vec<Value>,
    #[serde(default)]
    pub items: IndexMap<String, Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Folder,
    Package,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub parent_reference: ParentReference,
    #[serde(default)]
    pub file_system_info: Option<FileSystemInfo>,
    #[serde(default)]
    pub last_modified_date_time: Option<String>,
    #[serde(default)]
    pub file: Option<FileFacet>,
    #[serde(default)]
    pub folder: Option<Value>,
    #[serde(default)]
    pub package: Option<PackageFacet>,
    #[serde(default)]
    pub malware: Option<Value>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub drive_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    #[serde(default)]
    pub last_modified_date_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default)]
    pub hashes: Option<Hashes>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hashes {
    #[serde(default)]
    pub quick_xor_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageFacet {
    #[serde(rename = "type", default)]
    pub package_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub link: Option<SharingLink>,
    #[serde(default)]
    pub granted_to: Option<IdentitySet>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SharingLink {
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(rename = "type", default)]
    pub link_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentitySet {
    #[serde(default)]
    pub user: Option<Identity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Snapshot {
    pub async fn load(path: &Path) -> Result<Self, SnapshotError> {
        let raw = tokio::fs::read(path).await?;
        Self::from_slice(&raw)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &Item)> {
        self.items
            .iter()
            .filter(|(_, item)| item.file.is_some())
            .map(|(id, item)| (id.as_str(), item))
    }
}

impl Item {
    pub fn kind(&self) -> ItemKind {
        if self.package.is_some() {
            ItemKind::Package
        } else if self.folder.is_some() {
            ItemKind::Folder
        } else {
            ItemKind::File
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_reference.id.as_deref()
    }

    pub fn drive_id(&self) -> Option<&str> {
        self.parent_reference.drive_id.as_deref()
    }

    pub fn declared_hash(&self) -> Option<&str> {
        self.file
            .as_ref()
            .and_then(|file| file.hashes.as_ref())
            .and_then(|hashes| hashes.quick_xor_hash.as_deref())
            .filter(|hash| !hash.is_empty())
    }

    pub fn package_type(&self) -> Option<&str> {
        self.package
            .as_ref()
            .and_then(|package| package.package_type.as_deref())
    }

    pub fn is_malware(&self) -> bool {
        self.malware.is_some()
    }

    pub fn modified(&self) -> Option<&str> {
        self.file_system_info
            .as_ref()
            .and_then(|info| info.last_modified_date_time.as_deref())
            .or(self.last_modified_date_time.as_deref())
    }
}

impl Permission {
    pub fn grantee(&self) -> Option<&str> {
        self.granted_to
            .as_ref()
            .and_then(|granted| granted.user.as_ref())
            .and_then(|user| user.email.as_deref())
            .filter(|email| !email.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "notebooks": [{"displayName": "Lab"}],
        "items": {
            "root": {"id": "root", "name": "root", "folder": {}, "parentReference": {"driveId": "d1"}},
            "docs": {"id": "docs", "name": "Docs", "folder": {"childCount": 2},
                     "parentReference": {"id": "root", "driveId": "d1"}},
            "nb": {"id": "nb", "name": "Lab", "package": {"type": "oneNote"},
                   "parentReference": {"id": "docs", "driveId": "d1"}},
            "f1": {"id": "f1", "name": "a.txt", "size": 10,
                   "parentReference": {"id": "docs", "driveId": "d1"},
                   "fileSystemInfo": {"lastModifiedDateTime": "2020-01-02T03:04:05Z"},
                   "file": {"hashes": {"quickXorHash": "abc="}},
                   "permissions": [{"roles": ["write"],
                                    "grantedTo": {"user": {"email": "user@old.com"}}}]},
            "bad": {"id": "bad", "name": "bad.exe", "size": 1, "malware": {},
                    "parentReference": {"id": "docs"}, "file": {}}
        }
    }"#;

    #[test]
    fn parses_items_and_facets() {
        let snapshot = Snapshot::from_slice(SAMPLE.as_bytes()).unwrap();
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot.notebooks.len(), 1);

        assert_eq!(snapshot.get("root").unwrap().parent_id(), None);
        assert_eq!(snapshot.get("docs").unwrap().kind(), ItemKind::Folder);
        assert_eq!(snapshot.get("nb").unwrap().kind(), ItemKind::Package);
        assert_eq!(snapshot.get("nb").unwrap().package_type(), Some("oneNote"));

        let file = snapshot.get("f1").unwrap();
        assert_eq!(file.kind(), ItemKind::File);
        assert_eq!(file.size, Some(10));
        assert_eq!(file.declared_hash(), Some("abc="));
        assert_eq!(file.drive_id(), Some("d1"));
        assert_eq!(file.modified(), Some("2020-01-02T03:04:05Z"));
        assert_eq!(file.permissions[0].grantee(), Some("user@old.com"));

        let bad = snapshot.get("bad").unwrap();
        assert!(bad.is_malware());
        assert_eq!(bad.declared_hash(), None);
    }

    #[test]
    fn files_preserve_snapshot_order() {
        let snapshot = Snapshot::from_slice(SAMPLE.as_bytes()).unwrap();
        let ids: Vec<&str> = snapshot.files().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["f1", "bad"]);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            Snapshot::from_slice(b"{\"items\": [}"),
            Err(SnapshotError::Json(_))
        ));
    }
}
