//! Domain records shared by the detector, the replay driver and the server.
//!
//! Upstream engines (levels, gamma exposure, fibonacci, regime, flow) produce
//! the read-only inputs; the detector produces [`Setup`] records. Field names
//! serialize as camelCase so the JSON matches what the UI and the persistence
//! layer already consume.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};

/// Round to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Round to cents, the precision every price in a setup carries.
pub fn round2(value: f64) -> f64 {
    round_to(value, 2)
}

/// Trading-day calendar date (America/New_York) for a timestamp.
pub fn session_date(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&New_York).date_naive()
}

/// Trade direction of a setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    /// +1 for bullish, -1 for bearish
    pub fn sign(self) -> f64 {
        match self {
            Direction::Bullish => 1.0,
            Direction::Bearish => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Bullish => write!(f, "bullish"),
            Direction::Bearish => write!(f, "bearish"),
        }
    }
}

/// Lifecycle status of a setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStatus {
    /// Zone identified, confluence below the ready threshold
    Forming,
    /// Enough confluence, waiting for price to reach the entry zone
    Ready,
    /// Price entered the entry zone; geometry is frozen
    Triggered,
    /// Terminal: stop breach, context conflict or TTL while triggered
    Invalidated,
    /// Terminal: target reached, stale, or aged out before trigger
    Expired,
}

impl SetupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SetupStatus::Invalidated | SetupStatus::Expired)
    }

    /// Output ordering: live trades first, terminal records last.
    pub fn sort_rank(self) -> u8 {
        match self {
            SetupStatus::Triggered => 0,
            SetupStatus::Ready => 1,
            SetupStatus::Forming => 2,
            SetupStatus::Invalidated => 3,
            SetupStatus::Expired => 4,
        }
    }
}

impl std::fmt::Display for SetupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupStatus::Forming => write!(f, "forming"),
            SetupStatus::Ready => write!(f, "ready"),
            SetupStatus::Triggered => write!(f, "triggered"),
            SetupStatus::Invalidated => write!(f, "invalidated"),
            SetupStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Setup archetype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupType {
    FadeAtWall,
    BreakoutVacuum,
    MeanReversion,
    TrendContinuation,
    TrendPullback,
    FlipReclaim,
    OrbBreakout,
    VwapReclaim,
    VwapFadeAtBand,
}

impl SetupType {
    pub fn as_str(self) -> &'static str {
        match self {
            SetupType::FadeAtWall => "fade_at_wall",
            SetupType::BreakoutVacuum => "breakout_vacuum",
            SetupType::MeanReversion => "mean_reversion",
            SetupType::TrendContinuation => "trend_continuation",
            SetupType::TrendPullback => "trend_pullback",
            SetupType::FlipReclaim => "flip_reclaim",
            SetupType::OrbBreakout => "orb_breakout",
            SetupType::VwapReclaim => "vwap_reclaim",
            SetupType::VwapFadeAtBand => "vwap_fade_at_band",
        }
    }

    /// Archetypes that trade back toward value and need the wider fade stop.
    pub fn is_fade_family(self) -> bool {
        matches!(
            self,
            SetupType::FadeAtWall | SetupType::MeanReversion | SetupType::FlipReclaim
        )
    }

    /// Archetypes whose targets are bounded by risk multiples.
    pub fn is_trend_family(self) -> bool {
        matches!(
            self,
            SetupType::TrendPullback | SetupType::TrendContinuation | SetupType::OrbBreakout
        )
    }
}

impl std::fmt::Display for SetupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strength class assigned by the level clustering engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    Fortress,
    Defended,
    Moderate,
    Minor,
}

/// Coarse market regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Trending,
    Ranging,
    Compression,
    Breakout,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Regime::Trending => write!(f, "trending"),
            Regime::Ranging => write!(f, "ranging"),
            Regime::Compression => write!(f, "compression"),
            Regime::Breakout => write!(f, "breakout"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeDirection {
    Bullish,
    Bearish,
    Neutral,
}

impl RegimeDirection {
    pub fn as_direction(self) -> Option<Direction> {
        match self {
            RegimeDirection::Bullish => Some(Direction::Bullish),
            RegimeDirection::Bearish => Some(Direction::Bearish),
            RegimeDirection::Neutral => None,
        }
    }
}

/// Why a setup left the active set through invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    StopBreachConfirmed,
    RegimeConflict,
    FlowDivergence,
    TtlExpired,
    Unknown,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::StopBreachConfirmed => write!(f, "stop_breach_confirmed"),
            InvalidationReason::RegimeConflict => write!(f, "regime_conflict"),
            InvalidationReason::FlowDivergence => write!(f, "flow_divergence"),
            InvalidationReason::TtlExpired => write!(f, "ttl_expired"),
            InvalidationReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// Support/resistance zone from the level clustering engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterZone {
    pub id: String,
    pub price_low: f64,
    pub price_high: f64,
    #[serde(default)]
    pub cluster_score: f64,
    #[serde(rename = "type")]
    pub zone_type: ZoneType,
    #[serde(default)]
    pub test_count: u32,
    #[serde(default)]
    pub last_test_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub held: Option<bool>,
    #[serde(default)]
    pub hold_rate: Option<f64>,
}

impl ClusterZone {
    pub fn center(&self) -> f64 {
        (self.price_low + self.price_high) / 2.0
    }
}

/// Output of the level engine for one refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelData {
    pub clusters: Vec<ClusterZone>,
    pub generated_at: DateTime<Utc>,
}

/// Regime classifier output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegimeState {
    pub regime: Regime,
    pub direction: RegimeDirection,
    #[serde(default)]
    pub probability: f64,
    #[serde(default)]
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventType {
    Sweep,
    Block,
}

/// Directional options-premium print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: FlowEventType,
    pub symbol: String,
    pub strike: f64,
    pub expiry: String,
    #[serde(default)]
    pub size: u64,
    pub direction: Direction,
    #[serde(default)]
    pub premium: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FibTimeframe {
    Monthly,
    Weekly,
    Daily,
    Intraday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FibDirection {
    Retracement,
    Extension,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FibLevel {
    pub ratio: f64,
    pub price: f64,
    pub timeframe: FibTimeframe,
    pub direction: FibDirection,
    pub swing_high: f64,
    pub swing_low: f64,
    #[serde(default)]
    pub cross_validated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GexStrike {
    pub strike: f64,
    pub gex: f64,
}

/// Gamma exposure summary for one symbol (or the combined view)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GexProfile {
    pub symbol: String,
    pub spot_price: f64,
    pub net_gex: f64,
    pub flip_point: f64,
    pub call_wall: f64,
    pub put_wall: f64,
    #[serde(default)]
    pub gex_by_strike: Vec<GexStrike>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GexLandscape {
    pub spx: GexProfile,
    pub spy: GexProfile,
    pub combined: GexProfile,
}

/// One-minute OHLCV bar. Open/high/low are optional upstream; the accessors
/// fall back to the close so partial bars stay usable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    /// Bar start, epoch milliseconds
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    #[serde(rename = "o", default)]
    pub open: Option<f64>,
    #[serde(rename = "h", default)]
    pub high: Option<f64>,
    #[serde(rename = "l", default)]
    pub low: Option<f64>,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v", default)]
    pub volume: f64,
}

impl MinuteBar {
    pub fn open_or_close(&self) -> f64 {
        match self.open {
            Some(open) if open.is_finite() => open,
            _ => self.close,
        }
    }

    pub fn high_or_close(&self) -> f64 {
        match self.high {
            Some(high) if high.is_finite() => high,
            _ => self.open_or_close().max(self.close),
        }
    }

    pub fn low_or_close(&self) -> f64 {
        match self.low {
            Some(low) if low.is_finite() => low,
            _ => self.open_or_close().min(self.close),
        }
    }

    /// Non-finite or negative volume reads as zero.
    pub fn volume_or_zero(&self) -> f64 {
        if self.volume.is_finite() && self.volume > 0.0 {
            self.volume
        } else {
            0.0
        }
    }

    pub fn has_valid_close(&self) -> bool {
        self.close.is_finite() && self.close > 0.0
    }
}

/// Instruments the engine reads options and bars for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Underlying {
    Spx,
    Spy,
}

impl Underlying {
    pub fn as_str(self) -> &'static str {
        match self {
            Underlying::Spx => "SPX",
            Underlying::Spy => "SPY",
        }
    }
}

impl std::fmt::Display for Underlying {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    Call,
    Put,
}

/// End-of-day option chain row. Every field is optional upstream; rows
/// missing what a consumer needs are skipped by that consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionSnapshot {
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub strike: Option<f64>,
    #[serde(default)]
    pub contract_type: Option<ContractType>,
    #[serde(default)]
    pub expiration_date: Option<NaiveDate>,
    #[serde(default)]
    pub gamma: Option<f64>,
    #[serde(default)]
    pub open_interest: Option<f64>,
    #[serde(default)]
    pub day_close: Option<f64>,
    #[serde(default)]
    pub day_volume: Option<f64>,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    /// Last quote time, epoch milliseconds or nanoseconds
    #[serde(default)]
    pub last_updated: Option<i64>,
}

impl OptionSnapshot {
    /// Day close if traded, else the quote midpoint, else whichever side exists.
    pub fn mid(&self) -> f64 {
        let positive = |v: Option<f64>| v.filter(|x| x.is_finite() && *x > 0.0);
        if let Some(close) = positive(self.day_close) {
            return close;
        }
        let bid = positive(self.bid).unwrap_or(0.0);
        let ask = positive(self.ask).unwrap_or(0.0);
        if bid > 0.0 && ask > 0.0 {
            (bid + ask) / 2.0
        } else {
            bid.max(ask)
        }
    }

    pub fn volume(&self) -> f64 {
        self.day_volume.filter(|v| v.is_finite()).unwrap_or(0.0).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeTrend {
    Rising,
    Flat,
    Falling,
}

/// Price band around VWAP
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub upper: f64,
    pub lower: f64,
}

impl Band {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// VWAP with its 1σ, 1.5σ and 2σ deviation bands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VwapBands {
    pub vwap: f64,
    pub band_1sd: Band,
    pub band_15sd: Band,
    pub band_2sd: Band,
}

/// Bar-derived indicators as of one evaluation instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorContext {
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub ema_fast_slope: f64,
    pub ema_slow_slope: f64,
    pub volume_trend: VolumeTrend,
    pub session_open_price: f64,
    pub orb_high: f64,
    pub orb_low: f64,
    pub minutes_since_open: i64,
    pub as_of: DateTime<Utc>,
    #[serde(default)]
    pub vwap: Option<VwapBands>,
    #[serde(default)]
    pub latest_bar: Option<MinuteBar>,
    #[serde(default)]
    pub prior_bar: Option<MinuteBar>,
}

impl IndicatorContext {
    /// Latest bar whose minute has closed at `as_of`. A bar still in
    /// progress is skipped in favour of the one before it.
    pub fn latest_completed_bar(&self) -> Option<MinuteBar> {
        let as_of_ms = self.as_of.timestamp_millis();
        match self.latest_bar {
            Some(bar) if bar.timestamp_ms + 60_000 <= as_of_ms => Some(bar),
            Some(_) => self.prior_bar,
            None => None,
        }
    }
}

/// Entry price band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryZone {
    pub low: f64,
    pub high: f64,
}

impl EntryZone {
    pub fn mid(&self) -> f64 {
        (self.low + self.high) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTarget {
    pub price: f64,
    pub label: String,
}

impl PriceTarget {
    pub fn target1(price: f64) -> Self {
        Self { price, label: "Target 1".to_string() }
    }

    pub fn target2(price: f64) -> Self {
        Self { price, label: "Target 2".to_string() }
    }
}

/// A hypothesized trade anchored on one cluster zone, tracked across cycles
/// by its stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub id: String,
    #[serde(rename = "type")]
    pub setup_type: SetupType,
    pub direction: Direction,
    pub entry_zone: EntryZone,
    pub stop: f64,
    pub target1: PriceTarget,
    pub target2: PriceTarget,
    pub confluence_score: u8,
    pub confluence_sources: Vec<String>,
    #[serde(default)]
    pub decayed_confluence_score: f64,
    pub cluster_zone: ClusterZone,
    pub regime: Regime,
    pub status: SetupStatus,
    pub status_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ttl_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invalidation_reason: Option<InvalidationReason>,
    pub probability: f64,
    #[serde(default)]
    pub flow_confirmed: bool,
    #[serde(default)]
    pub ema_aligned: bool,
    #[serde(default)]
    pub volume_regime_aligned: bool,
    #[serde(default)]
    pub alignment_score: Option<f64>,
    #[serde(default)]
    pub rank: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub triggered_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_date_uses_eastern_calendar() {
        // 02:30 UTC is still the previous evening in New York
        let ts = Utc.with_ymd_and_hms(2026, 3, 3, 2, 30, 0).unwrap();
        assert_eq!(session_date(ts), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
    }

    #[test]
    fn test_bar_accessors_fall_back_to_close() {
        let bar = MinuteBar {
            timestamp_ms: 0,
            open: Some(101.0),
            high: None,
            low: Some(f64::NAN),
            close: 100.0,
            volume: -5.0,
        };
        assert_eq!(bar.high_or_close(), 101.0);
        assert_eq!(bar.low_or_close(), 100.0);
        assert_eq!(bar.volume_or_zero(), 0.0);
    }

    #[test]
    fn test_latest_completed_bar_skips_open_minute() {
        let as_of = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 30).unwrap();
        let bar = |minute: i64, close: f64| MinuteBar {
            timestamp_ms: as_of.timestamp_millis() - 30_000 - minute * 60_000,
            open: None,
            high: None,
            low: None,
            close,
            volume: 1.0,
        };
        let context = IndicatorContext {
            ema_fast: 0.0,
            ema_slow: 0.0,
            ema_fast_slope: 0.0,
            ema_slow_slope: 0.0,
            volume_trend: VolumeTrend::Flat,
            session_open_price: 0.0,
            orb_high: 0.0,
            orb_low: 0.0,
            minutes_since_open: 0,
            as_of,
            vwap: None,
            latest_bar: Some(bar(0, 105.0)),
            prior_bar: Some(bar(1, 104.0)),
        };
        assert_eq!(context.latest_completed_bar().map(|b| b.close), Some(104.0));
    }

    #[test]
    fn test_setup_status_terminal_states() {
        assert!(SetupStatus::Expired.is_terminal());
        assert!(SetupStatus::Invalidated.is_terminal());
        assert!(!SetupStatus::Triggered.is_terminal());
        assert_eq!(SetupType::VwapFadeAtBand.to_string(), "vwap_fade_at_band");
    }
}
