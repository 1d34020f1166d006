//! Container capacity planning.
//!
//! Overhead has to be predicted before a container exists (when sizing it)
//! and measured against an existing container (when deciding whether it must
//! grow). Both use the same fixed + proportional model:
//!
//! ```text
//! overhead(size) = fixed_bytes + (size - fixed_bytes) * percent / 100
//! ```
//!
//! The default constants describe a LUKS1 header on top of an ext4 filesystem
//! formatted with no reserved blocks. Recalibrate them when the encryption or
//! filesystem backend changes.

use serde::{Deserialize, Serialize};

/// Containers are allocated in whole mebibytes.
pub const ALLOCATION_UNIT: u64 = 1024 * 1024;

/// Encryption/filesystem overhead model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverheadModel {
    pub fixed_bytes: u64,
    pub percent: u8,
}

impl Default for OverheadModel {
    fn default() -> Self {
        Self {
            fixed_bytes: 4 * 1024 * 1024,
            percent: 5,
        }
    }
}

impl OverheadModel {
    /// Bytes of `size` that will not be available to archived data.
    pub fn overhead(&self, size: u64) -> u64 {
        let proportional =
            u128::from(size.saturating_sub(self.fixed_bytes)) * u128::from(self.percent) / 100;
        self.fixed_bytes.saturating_add(proportional as u64)
    }

    /// Bytes of `size` left for archived data.
    pub fn usable(&self, size: u64) -> u64 {
        size.saturating_sub(self.overhead(size))
    }
}

/// Usable capacity of an existing container and how full a source would make it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityEstimate {
    pub usable_bytes: u64,
    pub projected_fill_percent: f64,
}

impl CapacityEstimate {
    /// Whether the projected fill calls for a larger container.
    pub fn needs_growth(&self, reprovision_threshold: u8) -> bool {
        self.projected_fill_percent >= f64::from(reprovision_threshold)
    }
}

/// Size a new container so that `source_bytes` fills roughly `fill_percent`
/// of its usable space. Below 100% the measured fill is strictly under the
/// request, so a growth threshold equal to it is never met by a fresh
/// container.
pub fn plan_container_size(source_bytes: u64, fill_percent: u8, model: &OverheadModel) -> u64 {
    let requested = fill_percent.clamp(1, 100);
    let fill = u128::from(requested);
    let inflated = (u128::from(source_bytes) * 100).div_ceil(fill);
    let inflated = u64::try_from(inflated).unwrap_or(u64::MAX);

    let predicted = inflated.saturating_add(model.overhead(inflated));

    // The prediction applies the proportional overhead to the inflated size,
    // which is slightly smaller than the container it describes. Never hand
    // back a container whose measured fill would exceed the request.
    let remaining = 100 - u128::from(model.percent.min(99));
    let floor = u128::from(model.fixed_bytes) + (u128::from(inflated) * 100).div_ceil(remaining);
    let floor = u64::try_from(floor).unwrap_or(u64::MAX);

    let mut size = round_up_to_unit(predicted.max(floor));
    if requested < 100 {
        while size <= u64::MAX - ALLOCATION_UNIT
            && estimate_fill(source_bytes, size, model) >= f64::from(requested)
        {
            size += ALLOCATION_UNIT;
        }
    }
    size
}

/// Measure an existing container against the source it must hold.
pub fn estimate_capacity(
    source_bytes: u64,
    container_bytes: u64,
    model: &OverheadModel,
) -> CapacityEstimate {
    let usable_bytes = model.usable(container_bytes);
    let projected_fill_percent = if usable_bytes == 0 {
        if source_bytes == 0 {
            0.0
        } else {
            100.0
        }
    } else {
        (source_bytes as f64 / usable_bytes as f64 * 100.0).min(100.0)
    };

    CapacityEstimate {
        usable_bytes,
        projected_fill_percent,
    }
}

/// Projected fill percent, clamped to 100.
pub fn estimate_fill(source_bytes: u64, container_bytes: u64, model: &OverheadModel) -> f64 {
    estimate_capacity(source_bytes, container_bytes, model).projected_fill_percent
}

fn round_up_to_unit(bytes: u64) -> u64 {
    bytes
        .div_ceil(ALLOCATION_UNIT)
        .max(1)
        .saturating_mul(ALLOCATION_UNIT)
}
