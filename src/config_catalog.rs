use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_std::fs;

use log::debug;

use crate::{
    device_spec::DeviceSpec,
    error::{Error, Result},
};

/// Name of the id-to-file mapping inside a resource directory.
pub const MAPPING_FILE_NAME: &str = "mapping.cfg";

/// Parse the lines of a mapping file.
///
/// Each line is `key=value` or `key:value`. Blank lines and lines starting
/// with `#` or `!` are ignored, as are lines without a separator.
pub fn parse_mapping(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let idx = line.find(|c| c == '=' || c == ':')?;
            let key = line[0..idx].trim();
            let value = line[idx + 1..].trim();
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Resolves device identifiers to their definition files.
#[derive(Debug, Clone)]
pub struct ConfigCatalog {
    dir: PathBuf,
    entries: HashMap<String, String>,
}

impl ConfigCatalog {
    /// Read `mapping.cfg` from `dir`.
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<ConfigCatalog> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(MAPPING_FILE_NAME);

        let text = fs::read_to_string(path.as_path())
            .await
            .map_err(|err| {
                Error::ConfigLoad(format!("Unable to load {}: {}", path.display(), err))
            })?;

        Ok(ConfigCatalog::from_mapping(dir, &text))
    }

    /// Create a catalog from mapping text, resolving file names relative to `dir`.
    pub fn from_mapping<P: AsRef<Path>>(dir: P, text: &str) -> ConfigCatalog {
        ConfigCatalog {
            dir: dir.as_ref().to_path_buf(),
            entries: parse_mapping(text),
        }
    }

    /// The known device identifiers.
    pub fn device_ids(&self) -> Vec<&str> {
        let mut ids = self.entries.keys().map(String::as_str).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// The path of the definition file for `device_id`.
    pub fn definition_file(&self, device_id: &str) -> Result<PathBuf> {
        match self.entries.get(device_id) {
            Some(file_name) if !file_name.is_empty() => Ok(self.dir.join(file_name)),
            _ => Err(Error::ConfigLoad(format!(
                "No device definition mapped for device ID {}, known IDs: {}",
                device_id,
                self.device_ids().join(", ")
            ))),
        }
    }

    /// Load and validate the `DeviceSpec` for `device_id`.
    pub async fn load_device_spec(&self, device_id: &str) -> Result<DeviceSpec> {
        let path = self.definition_file(device_id)?;
        debug!("Using file {} for device ID {}", path.display(), device_id);

        let xml = fs::read_to_string(path.as_path())
            .await
            .map_err(|err| {
                Error::ConfigLoad(format!("Unable to load {}: {}", path.display(), err))
            })?;

        DeviceSpec::from_xml(&xml)
    }

    /// Open the catalog in `dir` and load the spec for `device_id` in one go.
    pub async fn resolve<P: AsRef<Path>>(dir: P, device_id: &str) -> Result<DeviceSpec> {
        let catalog = ConfigCatalog::open(dir).await?;
        catalog.load_device_spec(device_id).await
    }
}

#[cfg(test)]
mod tests {
    use async_std::task;

    use crate::test_utils::DEVICE_DEFINITION_XML;

    use super::*;

    fn resource_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MAPPING_FILE_NAME),
            "# device id to definition\n7E11=deltasol_mx.xml\n! legacy\n7721 : deltasol_e.xml\n\nbroken\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("deltasol_mx.xml"), DEVICE_DEFINITION_XML).unwrap();
        dir
    }

    #[test]
    fn test_parse_mapping() {
        let mapping = parse_mapping(
            "# comment\n\n a = b.xml \nc:d.xml\n!other\nnoseparator\nurl=http://x\n",
        );

        assert_eq!(3, mapping.len());
        assert_eq!("b.xml", mapping["a"]);
        assert_eq!("d.xml", mapping["c"]);
        assert_eq!("http://x", mapping["url"]);
    }

    #[test]
    fn test_open_and_resolve() {
        task::block_on(async {
            let dir = resource_dir();

            let catalog = ConfigCatalog::open(dir.path()).await.unwrap();
            assert_eq!(vec!["7721", "7E11"], catalog.device_ids());
            assert_eq!(
                dir.path().join("deltasol_mx.xml"),
                catalog.definition_file("7E11").unwrap()
            );

            let spec = catalog.load_device_spec("7E11").await.unwrap();
            assert_eq!("7E11", spec.id);
            assert_eq!(2, spec.packets.len());

            let spec = ConfigCatalog::resolve(dir.path(), "7E11").await.unwrap();
            assert_eq!(Some("DeltaSol MX"), spec.name.as_deref());
        })
    }

    #[test]
    fn test_unknown_device_id() {
        task::block_on(async {
            let dir = resource_dir();
            let catalog = ConfigCatalog::open(dir.path()).await.unwrap();

            match catalog.load_device_spec("1234").await {
                Err(Error::ConfigLoad(message)) => assert!(message.ends_with("7721, 7E11")),
                other => panic!("Unexpected result {:?}", other),
            }
        })
    }

    #[test]
    fn test_missing_definition_file() {
        task::block_on(async {
            let dir = resource_dir();
            let catalog = ConfigCatalog::open(dir.path()).await.unwrap();

            assert!(matches!(
                catalog.load_device_spec("7721").await,
                Err(Error::ConfigLoad(_))
            ));
        })
    }

    #[test]
    fn test_missing_mapping_file() {
        task::block_on(async {
            let dir = tempfile::tempdir().unwrap();

            assert!(matches!(
                ConfigCatalog::open(dir.path()).await,
                Err(Error::ConfigLoad(_))
            ));
        })
    }

    #[test]
    fn test_invalid_definition() {
        task::block_on(async {
            let dir = resource_dir();
            std::fs::write(dir.path().join("deltasol_mx.xml"), "<vbusSpecification>").unwrap();

            assert!(matches!(
                ConfigCatalog::resolve(dir.path(), "7E11").await,
                Err(Error::ConfigLoad(_))
            ));
        })
    }
}
