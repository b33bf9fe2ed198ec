//! CPU affinity for flow threads

use core_affinity::{get_core_ids, set_for_current};
use serde::{Deserialize, Serialize};

/// How flow threads are placed on cores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum CpuPinning {
    /// Leave placement to the scheduler
    #[default]
    None,
    /// Flow N runs on core N, wrapping around the available cores
    Auto,
    /// Flow N runs on core `offset + N`, wrapping around
    Offset(usize),
    /// Every flow runs on this core
    Core(usize),
}

/// Pin the current thread for flow number `index`
pub fn pin_thread(index: usize, config: &CpuPinning) -> anyhow::Result<()> {
    let wrap = |core: usize| core_count().map_or(core, |n| core % n.max(1));
    match config {
        CpuPinning::None => Ok(()),
        CpuPinning::Auto => pin_to_core(wrap(index)),
        CpuPinning::Offset(offset) => pin_to_core(wrap(offset + index)),
        CpuPinning::Core(core) => pin_to_core(*core),
    }
}

/// Pin the current thread to a specific core
pub fn pin_to_core(core_id: usize) -> anyhow::Result<()> {
    let core_ids = get_core_ids()
        .ok_or_else(|| anyhow::anyhow!("Core IDs unavailable, cannot pin to core {}", core_id))?;

    if core_id >= core_ids.len() {
        anyhow::bail!(
            "Cannot pin to CPU core {}: only {} cores available (0-{})",
            core_id,
            core_ids.len(),
            core_ids.len().saturating_sub(1)
        );
    }

    if set_for_current(core_ids[core_id]) {
        tracing::debug!("Pinned thread to CPU core {}", core_id);
        Ok(())
    } else {
        anyhow::bail!("Failed to pin thread to CPU core {}", core_id)
    }
}

/// Number of cores available for pinning
pub fn core_count() -> Option<usize> {
    get_core_ids().map(|ids| ids.len())
}
