//! Bridge configuration.

use std::time::Duration;

use tracing::warn;

use crate::format::{ColorFormat, ColorSpace, PresentMode, SurfaceFormat};

pub const ENV_VALIDATION: &str = "GPU_INTEROP_VALIDATION";
pub const ENV_PRESENT_MODE: &str = "GPU_INTEROP_PRESENT_MODE";
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "GPU_INTEROP_ACQUIRE_TIMEOUT_MS";

/// Settings shared by both bridge realizations.
#[derive(Debug, Clone, PartialEq)]
pub struct InteropConfig {
    /// Enable API validation layers and route their messages to `tracing`.
    pub validation: bool,

    /// Preferred present mode; FIFO is used when unavailable.
    pub present_mode: PresentMode,

    /// Format and color space requested for presentable images.
    pub output_format: SurfaceFormat,

    /// Format of the shared image GL renders into when the presentable
    /// format has no GL sized internal format (BGRA). Must itself have one.
    pub shared_format: ColorFormat,

    /// Compositor bridge: register a depth-stencil buffer alongside the back
    /// buffer.
    pub depth_buffer: bool,

    /// Upper bound on a single swapchain image acquire.
    pub acquire_timeout: Duration,

    /// Upper bound on the frame-start fence wait.
    pub fence_timeout: Duration,

    /// Compositor bridge: vertical blanks to wait per present.
    pub sync_interval: u32,

    /// Color the shared target is cleared to at frame start.
    pub clear_color: [f32; 4],

    /// Consecutive dropped frames tolerated before the session is abandoned.
    pub max_transient_failures: u32,
}

impl Default for InteropConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            present_mode: PresentMode::Mailbox,
            output_format: SurfaceFormat {
                format: ColorFormat::Bgra8Unorm,
                color_space: ColorSpace::SrgbNonlinear,
            },
            shared_format: ColorFormat::Rgba8Unorm,
            depth_buffer: false,
            acquire_timeout: Duration::from_secs(1),
            fence_timeout: Duration::from_secs(1),
            sync_interval: 1,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_transient_failures: 8,
        }
    }
}

impl InteropConfig {
    /// Defaults overlaid with `GPU_INTEROP_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Overlay values from `lookup`. Unparseable values are logged and
    /// ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(ENV_VALIDATION) {
            match parse_bool(&raw) {
                Some(on) => self.validation = on,
                None => warn!("ignoring {ENV_VALIDATION}={raw:?}"),
            }
        }
        if let Some(raw) = lookup(ENV_PRESENT_MODE) {
            match parse_present_mode(&raw) {
                Some(mode) => self.present_mode = mode,
                None => warn!("ignoring {ENV_PRESENT_MODE}={raw:?}"),
            }
        }
        if let Some(raw) = lookup(ENV_ACQUIRE_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.acquire_timeout = Duration::from_millis(ms),
                Err(_) => warn!("ignoring {ENV_ACQUIRE_TIMEOUT_MS}={raw:?}"),
            }
        }
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_present_mode(mut self, mode: PresentMode) -> Self {
        self.present_mode = mode;
        self
    }

    pub fn with_output_format(mut self, format: ColorFormat, color_space: ColorSpace) -> Self {
        self.output_format = SurfaceFormat {
            format,
            color_space,
        };
        self
    }

    pub fn with_shared_format(mut self, format: ColorFormat) -> Self {
        self.shared_format = format;
        self
    }

    pub fn with_depth_buffer(mut self, depth: bool) -> Self {
        self.depth_buffer = depth;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_clear_color(mut self, rgba: [f32; 4]) -> Self {
        self.clear_color = rgba;
        self
    }

    pub fn with_max_transient_failures(mut self, limit: u32) -> Self {
        self.max_transient_failures = limit;
        self
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

fn parse_present_mode(raw: &str) -> Option<PresentMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "fifo" => Some(PresentMode::Fifo),
        "fifo_relaxed" | "fifo-relaxed" => Some(PresentMode::FifoRelaxed),
        "mailbox" => Some(PresentMode::Mailbox),
        "immediate" => Some(PresentMode::Immediate),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overlay(pairs: &[(&str, &str)]) -> InteropConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = InteropConfig::default().with_validation(false);
        config.apply_overrides(|key| vars.get(key).cloned());
        config
    }

    #[test]
    fn env_values_override_defaults() {
        let config = overlay(&[
            (ENV_VALIDATION, "true"),
            (ENV_PRESENT_MODE, "Immediate"),
            (ENV_ACQUIRE_TIMEOUT_MS, "250"),
        ]);
        assert!(config.validation);
        assert_eq!(config.present_mode, PresentMode::Immediate);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
    }

    #[test]
    fn bad_values_are_ignored() {
        let config = overlay(&[(ENV_VALIDATION, "maybe"), (ENV_ACQUIRE_TIMEOUT_MS, "-3")]);
        assert!(!config.validation);
        assert_eq!(config.acquire_timeout, InteropConfig::default().acquire_timeout);
    }

    #[test]
    fn default_shared_format_is_gl_compatible() {
        assert!(InteropConfig::default().shared_format.is_shareable());
    }
}
