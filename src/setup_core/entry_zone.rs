//! Entry-zone bounding for opening-range setups.

use super::types::{round2, EntryZone};

/// Widest entry an opening-range breakout may carry
pub const ORB_MAX_ENTRY_WIDTH: f64 = 6.0;

/// Shrink `zone` symmetrically around its midpoint to at most `max_width`.
pub fn clamp_entry_zone(zone: EntryZone, max_width: f64) -> EntryZone {
    if !(max_width > 0.0) || zone.width() <= max_width {
        return zone;
    }
    let mid = zone.mid();
    let half = max_width / 2.0;
    EntryZone {
        low: round2(mid - half),
        high: round2(mid + half),
    }
}

/// Entry spanning both the cluster zone and the broken opening-range edge.
pub fn orb_entry_zone(zone_low: f64, zone_high: f64, orb_edge: f64) -> EntryZone {
    let hull = EntryZone {
        low: round2(zone_low.min(orb_edge)),
        high: round2(zone_high.max(orb_edge)),
    };
    clamp_entry_zone(hull, ORB_MAX_ENTRY_WIDTH)
}
