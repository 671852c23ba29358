//! Tuning state, modes, and band lookup (§3 Data Model, GLOSSARY).

use serde::{Deserialize, Serialize};

/// The SDR's demodulation/streaming mode vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Usb,
    Lsb,
    Am,
    Sam,
    Fm,
    Nfm,
    Cwu,
    Cwl,
    Iq,
    Iq48,
    Iq96,
    Iq192,
    Iq384,
}

impl Mode {
    /// True for any `iq*` variant, which carries no explicit bandwidth.
    pub fn is_iq(self) -> bool {
        matches!(
            self,
            Mode::Iq | Mode::Iq48 | Mode::Iq96 | Mode::Iq192 | Mode::Iq384
        )
    }

    /// The IQ sample rate implied by an IQ mode, if any.
    pub fn iq_sample_rate(self) -> Option<u32> {
        match self {
            Mode::Iq48 => Some(48_000),
            Mode::Iq96 => Some(96_000),
            Mode::Iq192 => Some(192_000),
            Mode::Iq384 => Some(384_000),
            _ => None,
        }
    }

    /// The IQ mode corresponding to a declared sample rate.
    pub fn from_iq_sample_rate(rate: u32) -> Option<Mode> {
        match rate {
            48_000 => Some(Mode::Iq48),
            96_000 => Some(Mode::Iq96),
            192_000 => Some(Mode::Iq192),
            384_000 => Some(Mode::Iq384),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Usb => "usb",
            Mode::Lsb => "lsb",
            Mode::Am => "am",
            Mode::Sam => "sam",
            Mode::Fm => "fm",
            Mode::Nfm => "nfm",
            Mode::Cwu => "cwu",
            Mode::Cwl => "cwl",
            Mode::Iq => "iq",
            Mode::Iq48 => "iq48",
            Mode::Iq96 => "iq96",
            Mode::Iq192 => "iq192",
            Mode::Iq384 => "iq384",
        }
    }

    pub fn parse(s: &str) -> Option<Mode> {
        match s.to_ascii_lowercase().as_str() {
            "usb" => Some(Mode::Usb),
            "lsb" => Some(Mode::Lsb),
            "am" => Some(Mode::Am),
            "sam" => Some(Mode::Sam),
            "fm" => Some(Mode::Fm),
            "nfm" => Some(Mode::Nfm),
            "cwu" => Some(Mode::Cwu),
            "cwl" => Some(Mode::Cwl),
            "iq" => Some(Mode::Iq),
            "iq48" => Some(Mode::Iq48),
            "iq96" => Some(Mode::Iq96),
            "iq192" => Some(Mode::Iq192),
            "iq384" => Some(Mode::Iq384),
            _ => None,
        }
    }
}

/// A fully- or partially-specified tune intent (§4.1 `Tune`).
#[derive(Debug, Clone, Default)]
pub struct TuneIntent {
    pub frequency_hz: Option<i64>,
    pub mode: Option<Mode>,
    pub bandwidth_low: Option<i64>,
    pub bandwidth_high: Option<i64>,
}

/// The effective tuning tuple (§3 Data Model). Invariant enforced by
/// construction: `iq*` modes never carry bandwidth bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningState {
    pub frequency_hz: i64,
    pub mode: Mode,
    pub bandwidth_low: Option<i64>,
    pub bandwidth_high: Option<i64>,
}

impl TuningState {
    /// Normalizes bandwidth per the mode invariant: IQ modes carry none.
    pub fn normalized(mut self) -> Self {
        if self.mode.is_iq() {
            self.bandwidth_low = None;
            self.bandwidth_high = None;
        }
        self
    }
}

/// A named slice of HF spectrum used for automatic sideband switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    pub name: &'static str,
    pub low_hz: i64,
    pub high_hz: i64,
}

/// Amateur HF/MF band table. Frequencies outside these ranges (broadcast,
/// WEFAX, etc.) have no band, and auto-sideband switching must not engage.
const BANDS: &[Band] = &[
    Band { name: "160m", low_hz: 1_800_000, high_hz: 2_000_000 },
    Band { name: "80m", low_hz: 3_500_000, high_hz: 4_000_000 },
    Band { name: "60m", low_hz: 5_330_500, high_hz: 5_406_400 },
    Band { name: "40m", low_hz: 7_000_000, high_hz: 7_300_000 },
    Band { name: "30m", low_hz: 10_100_000, high_hz: 10_150_000 },
    Band { name: "20m", low_hz: 14_000_000, high_hz: 14_350_000 },
    Band { name: "17m", low_hz: 18_068_000, high_hz: 18_168_000 },
    Band { name: "15m", low_hz: 21_000_000, high_hz: 21_450_000 },
    Band { name: "12m", low_hz: 24_890_000, high_hz: 24_990_000 },
    Band { name: "10m", low_hz: 28_000_000, high_hz: 29_700_000 },
];

/// Returns the amateur band containing `freq_hz`, or `None` if it falls
/// outside every defined band.
pub fn band_of(freq_hz: i64) -> Option<Band> {
    BANDS
        .iter()
        .copied()
        .find(|b| freq_hz >= b.low_hz && freq_hz <= b.high_hz)
}

/// Default sideband rule: LSB below 10MHz, USB at or above 10MHz.
pub fn default_sideband(freq_hz: i64) -> Mode {
    if freq_hz < 10_000_000 {
        Mode::Lsb
    } else {
        Mode::Usb
    }
}

/// Per-field lock flags (§3 Lock State). `mode_locked` implies the current
/// bandwidth is pinned unless the intent explicitly overrides it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LockState {
    pub frequency_locked: bool,
    pub mode_locked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_of_finds_20m_and_misses_broadcast() {
        assert_eq!(band_of(14_074_000).map(|b| b.name), Some("20m"));
        assert_eq!(band_of(6_000_000), None); // 49m broadcast, not amateur
    }

    #[test]
    fn default_sideband_switches_at_10mhz() {
        assert_eq!(default_sideband(9_999_999), Mode::Lsb);
        assert_eq!(default_sideband(10_000_000), Mode::Usb);
    }

    #[test]
    fn normalized_strips_bandwidth_for_iq_modes() {
        let t = TuningState {
            frequency_hz: 14_100_000,
            mode: Mode::Iq96,
            bandwidth_low: Some(50),
            bandwidth_high: Some(2700),
        }
        .normalized();
        assert_eq!(t.bandwidth_low, None);
        assert_eq!(t.bandwidth_high, None);
    }

    #[test]
    fn iq_mode_round_trips_sample_rate() {
        assert_eq!(Mode::Iq96.iq_sample_rate(), Some(96_000));
        assert_eq!(Mode::from_iq_sample_rate(96_000), Some(Mode::Iq96));
    }
}
