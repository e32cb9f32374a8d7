//! Preprocessing interface: a narrow seam so `main` can hand
//! `execute_inference` a `FeatureMap` without the coordinator crate owning
//! image-decoding logic. Out of scope per the core spec; this is the one
//! concrete implementation needed for local testing.

use crate::error::{CoordinatorError, Result};
use crate::partition::FeatureMap;
use std::path::PathBuf;

pub trait InputSource {
    fn load(&self) -> Result<FeatureMap>;
}

/// Reads a flat `.bin` file already holding `c * h * w` quantized uint8
/// bytes in canonical `(C,H,W)` order.
pub struct RawTensorFile {
    pub path: PathBuf,
    pub shape: (usize, usize, usize),
}

impl InputSource for RawTensorFile {
    fn load(&self) -> Result<FeatureMap> {
        let data = std::fs::read(&self.path)?;
        let (c, h, w) = self.shape;
        let expected = c * h * w;
        if data.len() != expected {
            return Err(CoordinatorError::ShapeMismatch(format!(
                "{}: expected {expected} bytes for shape ({c},{h},{w}), got {}",
                self.path.display(),
                data.len()
            )));
        }
        Ok(FeatureMap::Chw { c, h, w, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn write_tempfile(bytes: &[u8]) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "coordinator_input_test_{}_{n}.bin",
            std::process::id()
        ));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn raw_tensor_file_loads_matching_shape() {
        let path = write_tempfile(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let source = RawTensorFile {
            path: path.clone(),
            shape: (2, 2, 2),
        };
        let fm = source.load().unwrap();
        std::fs::remove_file(&path).ok();
        match fm {
            FeatureMap::Chw { c, h, w, data } => {
                assert_eq!((c, h, w), (2, 2, 2));
                assert_eq!(data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
            }
            _ => panic!("expected chw feature map"),
        }
    }

    #[test]
    fn raw_tensor_file_rejects_wrong_size() {
        let path = write_tempfile(&[1, 2, 3]);
        let source = RawTensorFile {
            path: path.clone(),
            shape: (1, 2, 2),
        };
        let result = source.load();
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(CoordinatorError::ShapeMismatch(_))));
    }
}
