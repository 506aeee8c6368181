use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::fs;
use std::path::Path;

use super::device::{DeviceClient, Registration};

/// The id this device reports under, cached on disk after first registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: String,
    /// True when the id came from a registration during this run.
    pub newly_registered: bool,
}

fn valid_device_id(id: &str) -> Result<bool> {
    let re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,127}$")?;
    Ok(re.is_match(id))
}

impl DeviceIdentity {
    /// Read a cached id. A missing file is `Ok(None)`; a present but invalid
    /// one is an error so a corrupted cache never silently re-registers.
    pub fn load(path: &Path) -> Result<Option<String>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read device id {}", path.display()))
            }
        };
        let id = raw.trim();
        if !valid_device_id(id)? {
            return Err(anyhow!(
                "device id file {} does not hold a valid id",
                path.display()
            ));
        }
        Ok(Some(id.to_string()))
    }

    pub fn store(path: &Path, id: &str) -> Result<()> {
        if !valid_device_id(id)? {
            return Err(anyhow!("refusing to cache invalid device id {:?}", id));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create device id directory {}", parent.display()))?;
        }
        fs::write(path, id).with_context(|| format!("write device id {}", path.display()))
    }

    /// Reuse the cached id, registering (and caching) only when there is none.
    pub fn load_or_register(
        path: &Path,
        client: &DeviceClient,
        registration: &Registration,
    ) -> Result<Self> {
        if let Some(id) = Self::load(path)? {
            log::info!("using device id {}", id);
            return Ok(Self {
                id,
                newly_registered: false,
            });
        }
        let id = client.register(registration)?;
        Self::store(path, &id)?;
        Ok(Self {
            id,
            newly_registered: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(DeviceIdentity::load(&dir.path().join("id")).unwrap(), None);
    }

    #[test]
    fn store_creates_parent_and_trims_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("id");
        DeviceIdentity::store(&path, "3f2a-77").unwrap();
        fs::write(&path, "3f2a-77\n").unwrap();
        assert_eq!(
            DeviceIdentity::load(&path).unwrap(),
            Some("3f2a-77".to_string())
        );
    }

    #[test]
    fn invalid_cached_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id");
        fs::write(&path, "not a device id!").unwrap();
        assert!(DeviceIdentity::load(&path).is_err());
        assert!(DeviceIdentity::store(&path, "").is_err());
    }

    #[test]
    fn cached_id_skips_registration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id");
        DeviceIdentity::store(&path, "42").unwrap();
        // Port 9 is never contacted because the cache hits first.
        let client = DeviceClient::new("http://127.0.0.1:9", super::super::device::DEFAULT_TIMEOUT)
            .unwrap();
        let identity =
            DeviceIdentity::load_or_register(&path, &client, &Registration::default()).unwrap();
        assert_eq!(identity.id, "42");
        assert!(!identity.newly_registered);
    }
}
