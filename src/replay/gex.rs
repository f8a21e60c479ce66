//! Gamma exposure rebuilt from end-of-day option snapshots

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::setup_core::types::{
    round2, round_to, ContractType, GexLandscape, GexProfile, GexStrike, OptionSnapshot, Underlying,
};

pub const SPY_TO_SPX_STRIKE: f64 = 10.0;
pub const SPY_TO_SPX_GEX_SCALE: f64 = 0.1;
pub const MAX_EXPIRATIONS: usize = 4;
pub const SPX_STRIKE_RANGE: f64 = 350.0;
pub const SPY_STRIKE_RANGE: f64 = 40.0;

/// Session close (20:00 UTC), used where a replayed value needs a fixed time
pub fn session_close(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)) + Duration::hours(20)
}

fn strike_range(underlying: Underlying) -> f64 {
    match underlying {
        Underlying::Spx => SPX_STRIKE_RANGE,
        Underlying::Spy => SPY_STRIKE_RANGE,
    }
}

/// Integer strike key at `decimals` resolution so float strikes group exactly.
fn strike_key(strike: f64, decimals: i32) -> i64 {
    (round_to(strike, decimals) * 10f64.powi(decimals)).round() as i64
}

/// Call wall, put wall and flip from per-strike gex, each defaulting to spot.
/// Ties go to the lowest strike.
fn walls_and_flip(rows: &[GexStrike], spot: f64) -> (f64, f64, f64) {
    let call_wall = rows
        .iter()
        .filter(|row| row.gex > 0.0)
        .min_by(|a, b| b.gex.total_cmp(&a.gex))
        .map_or(spot, |row| row.strike);
    let put_wall = rows
        .iter()
        .filter(|row| row.gex < 0.0)
        .min_by(|a, b| a.gex.total_cmp(&b.gex))
        .map_or(spot, |row| row.strike);
    let flip = rows
        .iter()
        .min_by(|a, b| a.gex.abs().total_cmp(&b.gex.abs()))
        .map_or(spot, |row| row.strike);
    (call_wall, put_wall, flip)
}

fn profile_from_rows(symbol: &str, spot: f64, rows: Vec<GexStrike>, timestamp: DateTime<Utc>) -> GexProfile {
    let net_gex = round2(rows.iter().map(|row| row.gex).sum());
    let (call_wall, put_wall, flip) = walls_and_flip(&rows, spot);
    GexProfile {
        symbol: symbol.to_string(),
        spot_price: round2(spot),
        net_gex,
        flip_point: round2(flip),
        call_wall: round2(call_wall),
        put_wall: round2(put_wall),
        gex_by_strike: rows,
        timestamp,
    }
}

/// Per-strike dealer gamma exposure for the nearest expirations on or after
/// `date`, limited to strikes near spot. Calls add, puts subtract.
pub fn summarize_snapshots(
    underlying: Underlying,
    spot: f64,
    snapshots: &[OptionSnapshot],
    date: NaiveDate,
) -> GexProfile {
    struct Contract {
        strike: f64,
        contract_type: ContractType,
        expiry: NaiveDate,
        gamma: f64,
        open_interest: f64,
    }

    let contracts: Vec<Contract> = snapshots
        .iter()
        .filter_map(|snapshot| {
            let strike = snapshot.strike.filter(|s| s.is_finite())?;
            let gamma = snapshot.gamma.filter(|g| g.is_finite() && *g > 0.0)?;
            let open_interest = snapshot.open_interest.filter(|oi| oi.is_finite() && *oi > 0.0)?;
            Some(Contract {
                strike,
                contract_type: snapshot.contract_type?,
                expiry: snapshot.expiration_date?,
                gamma,
                open_interest,
            })
        })
        .collect();

    let expiries: BTreeSet<NaiveDate> = contracts
        .iter()
        .map(|c| c.expiry)
        .filter(|expiry| *expiry >= date)
        .collect();
    let expiries: BTreeSet<NaiveDate> = expiries.into_iter().take(MAX_EXPIRATIONS).collect();
    let range = strike_range(underlying);

    let mut by_strike: BTreeMap<i64, (f64, f64, f64)> = BTreeMap::new();
    for contract in contracts
        .iter()
        .filter(|c| expiries.contains(&c.expiry) && (c.strike - spot).abs() <= range)
    {
        let entry = by_strike
            .entry(strike_key(contract.strike, 2))
            .or_insert((round2(contract.strike), 0.0, 0.0));
        let gex = contract.gamma * contract.open_interest * 100.0 * spot * spot * 0.01;
        match contract.contract_type {
            ContractType::Call => entry.1 += gex,
            ContractType::Put => entry.2 += gex,
        }
    }

    let rows: Vec<GexStrike> = by_strike
        .into_values()
        .map(|(strike, call, put)| GexStrike { strike, gex: round2(call - put) })
        .collect();

    profile_from_rows(underlying.as_str(), spot, rows, session_close(date))
}

/// SPX profile merged with SPY mapped into SPX strikes (strike × 10 + basis)
/// and scaled by 0.1. Strikes merge at 0.1 resolution.
pub fn combine_profiles(spx: &GexProfile, spy: &GexProfile) -> GexProfile {
    let basis = spx.spot_price - spy.spot_price * SPY_TO_SPX_STRIKE;
    let mut merged: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    let mut add = |strike: f64, gex: f64| {
        let entry = merged
            .entry(strike_key(strike, 1))
            .or_insert((round_to(strike, 1), 0.0));
        entry.1 = round2(entry.1 + gex);
    };

    for row in &spx.gex_by_strike {
        add(row.strike, row.gex);
    }
    for row in &spy.gex_by_strike {
        add(row.strike * SPY_TO_SPX_STRIKE + basis, row.gex * SPY_TO_SPX_GEX_SCALE);
    }

    let rows: Vec<GexStrike> = merged
        .into_values()
        .map(|(strike, gex)| GexStrike { strike: round2(strike), gex: round2(gex) })
        .collect();

    profile_from_rows("COMBINED", spx.spot_price, rows, spx.timestamp)
}

pub fn build_landscape(
    date: NaiveDate,
    spx_spot: f64,
    spy_spot: f64,
    spx_snapshots: &[OptionSnapshot],
    spy_snapshots: &[OptionSnapshot],
) -> GexLandscape {
    let spx = summarize_snapshots(Underlying::Spx, spx_spot, spx_snapshots, date);
    let spy = summarize_snapshots(Underlying::Spy, spy_spot, spy_snapshots, date);
    let combined = combine_profiles(&spx, &spy);
    GexLandscape { spx, spy, combined }
}

/// Same exposure profile re-stamped with the spot prices of one replayed bar.
pub fn with_spot_prices(base: &GexLandscape, spx_spot: f64, spy_spot: f64, at: DateTime<Utc>) -> GexLandscape {
    let restamp = |profile: &GexProfile, spot: f64| GexProfile {
        spot_price: round2(spot),
        timestamp: at,
        ..profile.clone()
    };
    GexLandscape {
        spx: restamp(&base.spx, spx_spot),
        spy: restamp(&base.spy, spy_spot),
        combined: restamp(&base.combined, spx_spot),
    }
}

/// SPX minus SPY mapped into SPX points
pub fn basis(landscape: &GexLandscape) -> f64 {
    round2(landscape.spx.spot_price - landscape.spy.spot_price * SPY_TO_SPX_STRIKE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn option(strike: f64, contract_type: ContractType, expiry_day: u32, gamma: f64, oi: f64) -> OptionSnapshot {
        OptionSnapshot {
            ticker: Some(format!("O:SPX{}{:?}", strike, contract_type)),
            strike: Some(strike),
            contract_type: Some(contract_type),
            expiration_date: NaiveDate::from_ymd_opt(2026, 3, expiry_day),
            gamma: Some(gamma),
            open_interest: Some(oi),
            ..Default::default()
        }
    }

    #[test]
    fn test_summarize_snapshots_walls_and_flip() {
        let snapshots = vec![
            option(5050.0, ContractType::Call, 2, 0.002, 1000.0),
            option(4950.0, ContractType::Put, 2, 0.003, 1000.0),
            option(5000.0, ContractType::Call, 3, 0.001, 10.0),
            // Expired, too far from spot, or missing gamma: ignored
            option(5000.0, ContractType::Call, 1, 0.5, 1000.0),
            option(5400.0, ContractType::Call, 2, 0.5, 1000.0),
            OptionSnapshot { gamma: None, ..option(5000.0, ContractType::Put, 2, 0.0, 1000.0) },
        ];
        let profile = summarize_snapshots(Underlying::Spx, 5000.0, &snapshots, date());

        assert_eq!(profile.gex_by_strike.len(), 3);
        assert_eq!(profile.call_wall, 5050.0);
        assert_eq!(profile.put_wall, 4950.0);
        assert_eq!(profile.flip_point, 5000.0);
        // 0.002 * 1000 * 100 * 5000^2 * 0.01
        assert_eq!(profile.gex_by_strike[2].gex, 50_000_000.0);
        assert_eq!(profile.timestamp, session_close(date()));
    }

    #[test]
    fn test_empty_chain_defaults_to_spot() {
        let profile = summarize_snapshots(Underlying::Spy, 500.0, &[], date());
        assert_eq!(profile.net_gex, 0.0);
        assert_eq!(profile.call_wall, 500.0);
        assert_eq!(profile.put_wall, 500.0);
        assert_eq!(profile.flip_point, 500.0);
    }

    #[test]
    fn test_combine_maps_spy_into_spx_strikes() {
        let at = session_close(date());
        let spx = profile_from_rows("SPX", 5010.0, vec![GexStrike { strike: 5020.0, gex: 100.0 }], at);
        let spy = profile_from_rows("SPY", 500.0, vec![GexStrike { strike: 501.0, gex: 1000.0 }], at);
        let combined = combine_profiles(&spx, &spy);

        // basis 10: SPY 501 lands on 5020 and adds 100
        assert_eq!(combined.gex_by_strike, vec![GexStrike { strike: 5020.0, gex: 200.0 }]);
        assert_eq!(combined.spot_price, 5010.0);
        assert_eq!(combined.symbol, "COMBINED");
    }

    #[test]
    fn test_with_spot_prices_restamps() {
        let landscape = build_landscape(date(), 5000.0, 500.0, &[], &[]);
        let at = session_close(date());
        let moved = with_spot_prices(&landscape, 5012.345, 501.0, at);
        assert_eq!(moved.spx.spot_price, 5012.35);
        assert_eq!(moved.combined.spot_price, 5012.35);
        assert_eq!(basis(&moved), 2.35);
    }
}
