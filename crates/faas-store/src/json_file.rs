use crate::{Result, StoreError};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tokio::fs;

/// Reads a JSON document, or `T::default()` when the file does not exist yet.
pub(crate) async fn load<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.display().to_string(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(StoreError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Rewrites the whole document through a sibling temp file and a rename.
pub(crate) async fn save<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    let io_err = |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    fs::write(&tmp, &bytes).await.map_err(io_err)?;
    fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
