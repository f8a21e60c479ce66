//! Deterministic setup identity
//!
//! Candidates are rebuilt from scratch every cycle, so a setup is recognised
//! across cycles by a hash of what it is anchored on rather than by any held
//! reference.

use chrono::NaiveDate;

use super::types::{round2, SetupType};

const ID_PREFIX: &str = "spx_setup";
const HASH_HEX_LEN: usize = 16;

/// Stable id for (session date, archetype, zone id, zone bounds to 2dp).
pub fn setup_id(
    session_date: NaiveDate,
    setup_type: SetupType,
    zone_id: &str,
    zone_low: f64,
    zone_high: f64,
) -> String {
    let seed = format!(
        "{}|{}|{}|{}|{}",
        session_date.format("%Y-%m-%d"),
        setup_type,
        zone_id,
        round2(zone_low),
        round2(zone_high),
    );
    stable_id(ID_PREFIX, &seed)
}

/// `<prefix>_<first 16 hex chars of blake3(seed)>`
pub fn stable_id(prefix: &str, seed: &str) -> String {
    let hash = blake3::hash(seed.as_bytes()).to_hex();
    format!("{}_{}", prefix, &hash[..HASH_HEX_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    #[test]
    fn test_same_inputs_same_id() {
        let a = setup_id(date(2), SetupType::FadeAtWall, "zone-1", 5000.004, 5004.0);
        let b = setup_id(date(2), SetupType::FadeAtWall, "zone-1", 5000.0, 5004.001);
        assert_eq!(a, b);
        assert!(a.starts_with("spx_setup_"));
        assert_eq!(a.len(), "spx_setup_".len() + 16);
    }

    #[test]
    fn test_any_component_changes_id() {
        let base = setup_id(date(2), SetupType::FadeAtWall, "zone-1", 5000.0, 5004.0);
        assert_ne!(base, setup_id(date(3), SetupType::FadeAtWall, "zone-1", 5000.0, 5004.0));
        assert_ne!(base, setup_id(date(2), SetupType::MeanReversion, "zone-1", 5000.0, 5004.0));
        assert_ne!(base, setup_id(date(2), SetupType::FadeAtWall, "zone-2", 5000.0, 5004.0));
        assert_ne!(base, setup_id(date(2), SetupType::FadeAtWall, "zone-1", 5000.5, 5004.0));
    }
}
