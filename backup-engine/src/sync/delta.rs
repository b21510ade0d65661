//! Delta computation logic.
//!
//! Computes the rsync delta that turns the file a stored signature was taken
//! from into new data.

use fast_rsync::diff;

use super::signature::parse_signature;
use crate::utils::errors::{EngineError, Result};

/// Compute a delta from a serialized baseline signature to `new_data`.
pub fn compute_delta(baseline_signature: &[u8], new_data: &[u8]) -> Result<Vec<u8>> {
    let signature = parse_signature(baseline_signature)?;
    let indexed = signature.index();
    let mut delta_output = Vec::new();
    diff(&indexed, new_data, &mut delta_output)
        .map_err(|e| EngineError::DeltaSync(format!("delta computation failed: {e:?}")))?;
    Ok(delta_output)
}

/// Ratio of delta size to new file size.
///
/// Below 1.0 the delta is the cheaper encoding; 0.0 for empty files.
pub fn delta_compression_ratio(delta_size: usize, new_file_size: usize) -> f64 {
    if new_file_size == 0 {
        return 0.0;
    }
    delta_size as f64 / new_file_size as f64
}
