use std::path::{Path, PathBuf};

use async_compression::tokio::bufread::{ZstdDecoder, ZstdEncoder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::{fs, io::AsyncReadExt};

use crate::comm::BINCODE_CONFIG;
use crate::config::LocalConfig;
use crate::error::AdmmError;

/// Stores values on local disk as zstd-compressed bincode.
///
/// # Example
///
/// ```rust,no_run
/// # use ptadmm_core::config::LocalConfig;
/// # use ptadmm_core::storage::LocalStore;
/// # use std::path::Path;
/// # async fn example() -> Result<(), ptadmm_core::error::AdmmError> {
/// let store = LocalStore::new(&LocalConfig::new(Path::new("results"), "run1_"));
/// store.write("theta", &vec![0.0f64, 0.5, 1.0]).await?;
/// let theta: Vec<f64> = store.read("theta").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalStore {
    config: LocalConfig,
}

impl LocalStore {
    pub fn new(config: &LocalConfig) -> Self {
        LocalStore {
            config: config.clone(),
        }
    }

    pub fn file_path(&self, id: &str) -> PathBuf {
        Path::new(&self.config.root)
            .join(format!("{}{}", self.config.prefix, id))
            .with_extension("bin.zst")
    }

    /// Writes `value` under `id`, creating the root directory if needed.
    pub async fn write<T: Serialize>(&self, id: &str, value: &T) -> Result<PathBuf, AdmmError> {
        let path = self.file_path(id);
        let bytes = bincode::serde::encode_to_vec(value, BINCODE_CONFIG)?;
        let mut encoder =
            ZstdEncoder::with_quality(&bytes[..], async_compression::Level::Precise(3));
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await?;

        fs::create_dir_all(&self.config.root).await?;
        fs::write(&path, &compressed).await?;
        log::debug!(
            "[LocalStore] wrote {} ({} bytes, {} compressed)",
            path.display(),
            bytes.len(),
            compressed.len()
        );
        Ok(path)
    }

    pub async fn read<T: DeserializeOwned>(&self, id: &str) -> Result<T, AdmmError> {
        let bytes = fs::read(self.file_path(id)).await?;
        let mut decoder = ZstdDecoder::new(&bytes[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).await?;
        let (value, _): (T, _) = bincode::serde::decode_from_slice(&decompressed, BINCODE_CONFIG)?;
        Ok(value)
    }

    pub async fn delete(&self, id: &str) -> Result<(), AdmmError> {
        fs::remove_file(self.file_path(id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use num_complex::Complex64;

    #[tokio::test]
    async fn complex_volume_survives_export() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(&LocalConfig::new(&dir.path().join("nested"), "t_"));
        let obj = ArrayD::from_shape_fn(IxDyn(&[3, 2, 2]), |idx| {
            Complex64::new(idx[0] as f64 * 0.1, -(idx[2] as f64))
        });

        let path = store.write("object", &obj).await.unwrap();
        assert!(path.ends_with("t_object.bin.zst"));
        let back: ArrayD<Complex64> = store.read("object").await.unwrap();
        assert_eq!(back, obj);

        store.delete("object").await.unwrap();
        assert!(matches!(store.read::<ArrayD<Complex64>>("object").await, Err(AdmmError::Io(_))));
    }
}
