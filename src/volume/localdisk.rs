//! Local disk volume plugin.
//!
//! Passes a host block device or disk file straight through to the VMM. The
//! connection's `path` attribute names the source; nothing is provisioned,
//! so `delete` only has to forget the volume.

use std::path::PathBuf;

use async_trait::async_trait;

use super::Result;
use super::VolumeError;
use super::VolumePlugin;
use crate::machine::VolumeAccess;
use crate::machine::VolumeSpec;
use crate::machine::VolumeState;
use crate::machine::VolumeStatus;

pub const PLUGIN_NAME: &str = "local-disk";

const PATH_ATTRIBUTE: &str = "path";

#[derive(Default, Debug)]
pub struct LocalDiskPlugin;

#[async_trait]
impl VolumePlugin for LocalDiskPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn apply(&self, _machine_id: &str, volume: &VolumeSpec) -> Result<VolumeStatus> {
        let path: PathBuf = volume
            .connection
            .attributes
            .get(PATH_ATTRIBUTE)
            .map(PathBuf::from)
            .ok_or(VolumeError::MissingAttribute {
                volume: volume.name.clone(),
                attribute: PATH_ATTRIBUTE,
            })?;

        match tokio::fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(VolumeError::SourceMissing { volume: volume.name.clone(), path })
            }
            Err(source) => return Err(VolumeError::Io { path, source }),
        }

        Ok(VolumeStatus {
            name: volume.name.clone(),
            handle: volume.connection.handle.clone(),
            state: VolumeState::Prepared,
            access: Some(VolumeAccess::File { path }),
        })
    }

    async fn delete(&self, _machine_id: &str, _handle: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::VolumeConnection;

    fn volume(path: Option<&str>) -> VolumeSpec {
        let mut connection = VolumeConnection {
            driver: PLUGIN_NAME.into(),
            handle: "vol-1".into(),
            ..Default::default()
        };
        if let Some(path) = path {
            connection.attributes.insert(PATH_ATTRIBUTE.into(), path.into());
        }
        VolumeSpec { name: "data".into(), device: None, connection, deleted_at: None }
    }

    #[tokio::test]
    async fn prepares_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.raw");
        tokio::fs::write(&disk, b"").await.unwrap();

        let status = LocalDiskPlugin
            .apply("m-1", &volume(disk.to_str()))
            .await
            .unwrap();
        assert_eq!(status.state, VolumeState::Prepared);
        assert_eq!(status.handle, "vol-1");
        assert_eq!(status.access, Some(VolumeAccess::File { path: disk }));
    }

    #[tokio::test]
    async fn rejects_missing_path_attribute() {
        let err = LocalDiskPlugin.apply("m-1", &volume(None)).await.unwrap_err();
        assert!(matches!(err, VolumeError::MissingAttribute { .. }));
    }

    #[tokio::test]
    async fn rejects_absent_source() {
        let err = LocalDiskPlugin
            .apply("m-1", &volume(Some("/does/not/exist")))
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::SourceMissing { .. }));
    }
}
