//! Display HDR capability math.
//!
//! The native query (DXGI output description plus the display-config SDR
//! white level) lives with the compositor backend; this module turns the raw
//! numbers into [`HdrProperties`] and holds the one-shot per-output cache.

/// Nits represented by an SDR white level multiplier of 1.0.
pub const SDR_REFERENCE_NITS: f32 = 80.0;

/// Raw values reported for one output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputLuminance {
    /// Output color space is in the BT.2020 family.
    pub bt2020: bool,
    pub max_luminance_nits: f32,
    /// `DISPLAYCONFIG_SDR_WHITE_LEVEL::SDRWhiteLevel`, in thousandths of
    /// [`SDR_REFERENCE_NITS`].
    pub sdr_white_level_raw: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HdrProperties {
    pub is_hdr: bool,
    pub sdr_white_level_nits: f32,
    /// Peak luminance over SDR white.
    pub headroom: f32,
}

impl HdrProperties {
    /// `None` when the white level is zero (headroom undefined).
    pub fn from_luminance(raw: OutputLuminance) -> Option<Self> {
        if raw.sdr_white_level_raw == 0 {
            return None;
        }
        let sdr_white_level_nits = raw.sdr_white_level_raw as f32 / 1000.0 * SDR_REFERENCE_NITS;
        Some(Self {
            is_hdr: raw.bt2020,
            sdr_white_level_nits,
            headroom: raw.max_luminance_nits / sdr_white_level_nits,
        })
    }
}

/// Remembers the output index of the last query. Asking again for the same
/// output reports nothing new.
#[derive(Debug, Default)]
pub struct OutputQueryCache {
    last: Option<u32>,
}

impl OutputQueryCache {
    /// Returns `true` and records `index` if it differs from the last query.
    /// The index is recorded even if the query that follows fails.
    pub fn begin(&mut self, index: u32) -> bool {
        if self.last == Some(index) {
            return false;
        }
        self.last = Some(index);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headroom_from_raw_values() {
        let props = HdrProperties::from_luminance(OutputLuminance {
            bt2020: true,
            max_luminance_nits: 1000.0,
            sdr_white_level_raw: 2500,
        })
        .unwrap();
        assert!(props.is_hdr);
        assert_eq!(props.sdr_white_level_nits, 200.0);
        assert_eq!(props.headroom, 5.0);
    }

    #[test]
    fn zero_white_level_is_unsupported() {
        assert!(HdrProperties::from_luminance(OutputLuminance {
            bt2020: false,
            max_luminance_nits: 300.0,
            sdr_white_level_raw: 0,
        })
        .is_none());
    }

    #[test]
    fn same_output_is_queried_once() {
        let mut cache = OutputQueryCache::default();
        assert!(cache.begin(0));
        assert!(!cache.begin(0));
        assert!(cache.begin(1));
        assert!(cache.begin(0));
    }
}
