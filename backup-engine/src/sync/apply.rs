//! Delta application to reconstruct files.

use fast_rsync::apply;
use std::fs;
use std::path::Path;

use crate::utils::errors::{EngineError, Result};

/// Apply a delta to baseline data to reconstruct the new file.
pub fn apply_delta_to_bytes(baseline_data: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    apply(baseline_data, delta, &mut output)
        .map_err(|e| EngineError::DeltaSync(format!("delta apply failed: {e:?}")))?;
    Ok(output)
}

/// Apply delta in-place, replacing the baseline file.
///
/// Returns the reconstructed size.
pub fn apply_delta_in_place(baseline_path: &Path, delta: &[u8]) -> Result<usize> {
    let baseline_data = fs::read(baseline_path)?;
    let reconstructed = apply_delta_to_bytes(&baseline_data, delta)?;
    fs::write(baseline_path, &reconstructed)?;
    Ok(reconstructed.len())
}
