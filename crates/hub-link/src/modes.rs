//! ArduCopter flight-mode numbering and the symbols used everywhere the
//! broker reports or requests a mode.

use mavlink::common::MavState;

const MODES: &[(&str, u32)] = &[
    ("STABILIZE", 0),
    ("ACRO", 1),
    ("ALT_HOLD", 2),
    ("AUTO", 3),
    ("GUIDED", 4),
    ("LOITER", 5),
    ("RTL", 6),
    ("CIRCLE", 7),
    ("LAND", 9),
    ("POSHOLD", 16),
    ("BRAKE", 17),
];

/// Modes ArduCopter will normally accept an arm request in.
const ARMABLE: &[&str] = &["STABILIZE", "GUIDED", "LOITER", "ALT_HOLD", "POSHOLD"];

pub fn mode_number(name: &str) -> Option<u32> {
    let upper = name.to_ascii_uppercase();
    MODES.iter().find(|(n, _)| *n == upper).map(|(_, v)| *v)
}

/// Decodes a custom-mode number; unknown numbers become `MODE_<n>` so the
/// snapshot never silently drops a mode the table does not know.
pub fn mode_name(custom_mode: u32) -> String {
    MODES
        .iter()
        .find(|(_, v)| *v == custom_mode)
        .map(|(n, _)| (*n).to_string())
        .unwrap_or_else(|| format!("MODE_{custom_mode}"))
}

pub fn is_armable_mode(name: &str) -> bool {
    ARMABLE.contains(&name.to_ascii_uppercase().as_str())
}

pub fn system_status_name(state: MavState) -> &'static str {
    match state {
        MavState::MAV_STATE_UNINIT => "UNINIT",
        MavState::MAV_STATE_BOOT => "BOOT",
        MavState::MAV_STATE_CALIBRATING => "CALIBRATING",
        MavState::MAV_STATE_STANDBY => "STANDBY",
        MavState::MAV_STATE_ACTIVE => "ACTIVE",
        MavState::MAV_STATE_CRITICAL => "CRITICAL",
        MavState::MAV_STATE_EMERGENCY => "EMERGENCY",
        MavState::MAV_STATE_POWEROFF => "POWEROFF",
        MavState::MAV_STATE_FLIGHT_TERMINATION => "FLIGHT_TERMINATION",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_round_trips_both_ways() {
        for name in ["STABILIZE", "AUTO", "GUIDED", "LOITER", "RTL", "BRAKE"] {
            let n = mode_number(name).unwrap();
            assert_eq!(mode_name(n), name);
        }
        assert_eq!(mode_number("guided"), Some(4));
        assert_eq!(mode_number("NOSUCH"), None);
    }

    #[test]
    fn unknown_numbers_decode_to_placeholder() {
        assert_eq!(mode_name(42), "MODE_42");
    }

    #[test]
    fn armable_set_matches_policy() {
        assert!(is_armable_mode("stabilize"));
        assert!(is_armable_mode("GUIDED"));
        assert!(!is_armable_mode("AUTO"));
        assert!(!is_armable_mode("MODE_42"));
    }
}
