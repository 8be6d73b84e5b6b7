//! Physical adapter selection.
//!
//! Backends describe every adapter they can see as an [`AdapterInfo`]; this
//! module rejects the unusable ones and scores the rest. A discrete GPU gets a
//! fixed bonus on top of its maximum 2D image dimension, so between two
//! discrete parts the one with larger image support wins, and any discrete
//! part beats an integrated one with up to 1000 px less image support.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::InteropError;

/// Score added for discrete GPUs.
pub const DISCRETE_BONUS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Discrete,
    Integrated,
    Virtual,
    /// Software rasterizer (WARP, llvmpipe, SwiftShader). Always rejected.
    Software,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub graphics: bool,
    /// Can present to the bridge's surface.
    pub present: bool,
}

/// Everything the selector needs to know about one adapter.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Position in the backend's enumeration order.
    pub index: u32,
    pub name: String,
    pub kind: AdapterKind,
    pub max_image_dimension_2d: u32,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub extensions: BTreeSet<String>,
    /// The surface reports at least one format and one present mode.
    pub swapchain_supported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueRequirements {
    pub graphics: bool,
    pub present: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRequirements {
    pub extensions: Vec<String>,
    pub queues: QueueRequirements,
    pub swapchain: bool,
}

/// Queue family indices resolved for one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn satisfies(&self, req: QueueRequirements) -> bool {
        (!req.graphics || self.graphics.is_some()) && (!req.present || self.present.is_some())
    }

    /// Distinct family indices, for device queue creation.
    pub fn unique(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.graphics.into_iter().chain(self.present).collect();
        families.sort_unstable();
        families.dedup();
        families
    }

    /// Graphics and present live in different families.
    pub fn is_split(&self) -> bool {
        matches!((self.graphics, self.present), (Some(g), Some(p)) if g != p)
    }
}

/// Why an adapter was not eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Software,
    MissingQueues,
    MissingExtensions(Vec<String>),
    NoSwapchainSupport,
}

/// The adapter picked by [`select_device`].
#[derive(Debug, Clone)]
pub struct SelectedDevice {
    pub adapter_index: u32,
    pub name: String,
    pub queues: QueueFamilyIndices,
    pub score: u64,
}

/// Resolve graphics and present families, preferring one family that does
/// both.
pub fn find_queue_families(adapter: &AdapterInfo) -> QueueFamilyIndices {
    if let Some(both) = adapter
        .queue_families
        .iter()
        .find(|family| family.graphics && family.present)
    {
        return QueueFamilyIndices {
            graphics: Some(both.index),
            present: Some(both.index),
        };
    }

    QueueFamilyIndices {
        graphics: adapter
            .queue_families
            .iter()
            .find(|family| family.graphics)
            .map(|family| family.index),
        present: adapter
            .queue_families
            .iter()
            .find(|family| family.present)
            .map(|family| family.index),
    }
}

/// Score one adapter, or say why it is not eligible.
pub fn rate_adapter(adapter: &AdapterInfo, req: &DeviceRequirements) -> Result<u64, Rejection> {
    if adapter.kind == AdapterKind::Software {
        return Err(Rejection::Software);
    }

    if !find_queue_families(adapter).satisfies(req.queues) {
        return Err(Rejection::MissingQueues);
    }

    let missing: Vec<String> = req
        .extensions
        .iter()
        .filter(|ext| !adapter.extensions.contains(ext.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(Rejection::MissingExtensions(missing));
    }

    if req.swapchain && !adapter.swapchain_supported {
        return Err(Rejection::NoSwapchainSupport);
    }

    let mut score = u64::from(adapter.max_image_dimension_2d);
    if adapter.kind == AdapterKind::Discrete {
        score += DISCRETE_BONUS;
    }
    Ok(score)
}

/// Pick the highest-scoring eligible adapter. Ties go to the adapter
/// enumerated first.
pub fn select_device(
    adapters: &[AdapterInfo],
    req: &DeviceRequirements,
) -> Result<SelectedDevice, InteropError> {
    if adapters.is_empty() {
        return Err(InteropError::DeviceSelectionFailed {
            reason: "no adapters enumerated".into(),
        });
    }

    let mut best: Option<(&AdapterInfo, u64)> = None;
    let mut reasons = Vec::new();

    for adapter in adapters {
        match rate_adapter(adapter, req) {
            Ok(score) => {
                debug!("adapter {} ({}) scored {score}", adapter.index, adapter.name);
                if best.is_none_or(|(_, best_score)| score > best_score) {
                    best = Some((adapter, score));
                }
            }
            Err(rejection) => {
                debug!(
                    "adapter {} ({}) rejected: {rejection:?}",
                    adapter.index, adapter.name
                );
                reasons.push(format!("{}: {rejection:?}", adapter.name));
            }
        }
    }

    let (adapter, score) = best.ok_or_else(|| InteropError::DeviceSelectionFailed {
        reason: reasons.join("; "),
    })?;

    info!("selected adapter {} ({}), score {score}", adapter.index, adapter.name);

    Ok(SelectedDevice {
        adapter_index: adapter.index,
        name: adapter.name.clone(),
        queues: find_queue_families(adapter),
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(index: u32, kind: AdapterKind, max_dim: u32) -> AdapterInfo {
        AdapterInfo {
            index,
            name: format!("gpu{index}"),
            kind,
            max_image_dimension_2d: max_dim,
            queue_families: vec![QueueFamilyInfo {
                index: 0,
                graphics: true,
                present: true,
            }],
            extensions: ["VK_KHR_swapchain".to_string()].into_iter().collect(),
            swapchain_supported: true,
        }
    }

    fn requirements() -> DeviceRequirements {
        DeviceRequirements {
            extensions: vec!["VK_KHR_swapchain".into()],
            queues: QueueRequirements {
                graphics: true,
                present: true,
            },
            swapchain: true,
        }
    }

    #[test]
    fn discrete_beats_integrated_with_equal_limits() {
        let adapters = [
            adapter(0, AdapterKind::Integrated, 16384),
            adapter(1, AdapterKind::Discrete, 16384),
        ];
        let selected = select_device(&adapters, &requirements()).unwrap();
        assert_eq!(selected.adapter_index, 1);
        assert_eq!(selected.score, 16384 + DISCRETE_BONUS);
    }

    #[test]
    fn software_only_is_rejected() {
        let adapters = [adapter(0, AdapterKind::Software, 32768)];
        let err = select_device(&adapters, &requirements()).unwrap_err();
        assert!(matches!(err, InteropError::DeviceSelectionFailed { .. }));
    }

    #[test]
    fn missing_present_queue_is_rejected() {
        let mut a = adapter(0, AdapterKind::Discrete, 8192);
        a.queue_families[0].present = false;
        assert_eq!(
            rate_adapter(&a, &requirements()),
            Err(Rejection::MissingQueues)
        );
    }

    #[test]
    fn missing_extension_is_named() {
        let mut a = adapter(0, AdapterKind::Discrete, 8192);
        a.extensions.clear();
        assert_eq!(
            rate_adapter(&a, &requirements()),
            Err(Rejection::MissingExtensions(vec!["VK_KHR_swapchain".into()]))
        );
    }

    #[test]
    fn no_swapchain_support_is_rejected() {
        let mut a = adapter(0, AdapterKind::Discrete, 8192);
        a.swapchain_supported = false;
        assert_eq!(
            rate_adapter(&a, &requirements()),
            Err(Rejection::NoSwapchainSupport)
        );
    }

    #[test]
    fn split_families_are_resolved_separately() {
        let mut a = adapter(0, AdapterKind::Discrete, 8192);
        a.queue_families = vec![
            QueueFamilyInfo {
                index: 0,
                graphics: true,
                present: false,
            },
            QueueFamilyInfo {
                index: 2,
                graphics: false,
                present: true,
            },
        ];
        let queues = find_queue_families(&a);
        assert_eq!(queues.graphics, Some(0));
        assert_eq!(queues.present, Some(2));
        assert!(queues.is_split());
        assert_eq!(queues.unique(), vec![0, 2]);
    }

    #[test]
    fn ties_keep_first_enumerated() {
        let adapters = [
            adapter(0, AdapterKind::Discrete, 16384),
            adapter(1, AdapterKind::Discrete, 16384),
        ];
        assert_eq!(select_device(&adapters, &requirements()).unwrap().adapter_index, 0);
    }
}
