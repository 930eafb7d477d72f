// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Telemetry fields, values and the status-aware cache.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::controller::scheduler::{probes_for, ProbeRequest};
use super::status::TpmStatus;

/// Every telemetry quantity the engine knows how to read from a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TelemetryField {
    Voltage,
    BoardTemperature,
    FpgaTemperatures,
    PllLocked,
    CheckCpldComms,
    CspRounding,
    ChanneliserRounding,
    IsProgrammed,
    HealthStatus,
    StationId,
    AdcRms,
    PendingDataRequests,
    PpsDelay,
    PpsDrift,
    PpsDelayCorrection,
    PpsPresent,
    IsBeamformerRunning,
    FpgaReferenceTime,
    PhaseTerminalCount,
    PreaduLevels,
    StaticDelays,
    TileId,
    BeamformerTable,
    TileBeamformerFrame,
    RfiCount,
}

/// Refresh tier used by the poll loop's periodic telemetry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryTier {
    /// Every poll cycle.
    Fast,
    /// Every few seconds.
    Medium,
    /// Every half minute, and only on initialised boards.
    Slow,
}

impl TelemetryTier {
    pub const ALL: [TelemetryTier; 3] = [Self::Fast, Self::Medium, Self::Slow];

    pub fn fields(self) -> &'static [TelemetryField] {
        use TelemetryField::*;
        match self {
            Self::Fast => &[Voltage],
            Self::Medium => &[BoardTemperature, FpgaTemperatures, PllLocked],
            Self::Slow => &[
                PpsDelay,
                PpsPresent,
                IsBeamformerRunning,
                StationId,
                TileId,
                BeamformerTable,
            ],
        }
    }
}

impl TelemetryField {
    /// Upper-case probe identifier used in logs and operator tooling.
    pub fn probe_name(self) -> &'static str {
        use TelemetryField::*;
        match self {
            Voltage => "VOLTAGE",
            BoardTemperature => "CHECK_BOARD_TEMPERATURE",
            FpgaTemperatures => "FPGA_TEMPERATURES",
            PllLocked => "PLL_LOCKED",
            CheckCpldComms => "CHECK_CPLD_COMMS",
            CspRounding => "CSP_ROUNDING",
            ChanneliserRounding => "CHANNELISER_ROUNDING",
            IsProgrammed => "IS_PROGRAMMED",
            HealthStatus => "HEALTH_STATUS",
            StationId => "STATION_ID",
            AdcRms => "ADC_RMS",
            PendingDataRequests => "PENDING_DATA_REQUESTS",
            PpsDelay => "PPS_DELAY",
            PpsDrift => "PPS_DRIFT",
            PpsDelayCorrection => "PPS_DELAY_CORRECTION",
            PpsPresent => "PPS_PRESENT",
            IsBeamformerRunning => "IS_BEAMFORMER_RUNNING",
            FpgaReferenceTime => "FPGA_REFERENCE_TIME",
            PhaseTerminalCount => "PHASE_TERMINAL_COUNT",
            PreaduLevels => "PREADU_LEVELS",
            StaticDelays => "STATIC_DELAYS",
            TileId => "TILE_ID",
            BeamformerTable => "BEAMFORMER_TABLE",
            TileBeamformerFrame => "TILE_BEAMFORMER_FRAME",
            RfiCount => "RFI_COUNT",
        }
    }

    /// Tier this field is swept in, if any.
    pub fn tier(self) -> Option<TelemetryTier> {
        TelemetryTier::ALL
            .into_iter()
            .find(|tier| tier.fields().contains(&self))
    }

    fn tier_allows(self, status: TpmStatus) -> bool {
        use TelemetryField::*;
        match (self.tier(), self) {
            (Some(_), Voltage | BoardTemperature) => status.is_connected(),
            (Some(TelemetryTier::Medium), _) => status.is_programmed(),
            (Some(TelemetryTier::Slow), _) => status.is_initialised(),
            _ => false,
        }
    }

    /// Whether a cached value for this field is meaningful under `status`.
    ///
    /// A field is valid when it is in the probe table for the status or its
    /// refresh tier is allowed to read it.
    pub fn is_valid_in(self, status: TpmStatus) -> bool {
        self.tier_allows(status) || probes_for(status).contains(&ProbeRequest::Read(self))
    }
}

impl fmt::Display for TelemetryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.probe_name())
    }
}

/// All fields whose cached values are valid under `status`.
pub fn valid_fields(status: TpmStatus) -> Vec<TelemetryField> {
    ALL_FIELDS
        .iter()
        .copied()
        .filter(|field| field.is_valid_in(status))
        .collect()
}

const ALL_FIELDS: [TelemetryField; 25] = {
    use TelemetryField::*;
    [
        Voltage,
        BoardTemperature,
        FpgaTemperatures,
        PllLocked,
        CheckCpldComms,
        CspRounding,
        ChanneliserRounding,
        IsProgrammed,
        HealthStatus,
        StationId,
        AdcRms,
        PendingDataRequests,
        PpsDelay,
        PpsDrift,
        PpsDelayCorrection,
        PpsPresent,
        IsBeamformerRunning,
        FpgaReferenceTime,
        PhaseTerminalCount,
        PreaduLevels,
        StaticDelays,
        TileId,
        BeamformerTable,
        TileBeamformerFrame,
        RfiCount,
    ]
};

/// Value read for a telemetry field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Table(Vec<Vec<i64>>),
    Text(String),
}

impl TelemetryValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// A cached value and when it was read (Unix seconds).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEntry {
    pub value: TelemetryValue,
    pub updated_at: u64,
}

/// Last known telemetry values, keyed by field.
///
/// The cache never holds a value for a field that is invalid under the
/// status it was stored with; callers evict fields when status changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetryCache {
    entries: BTreeMap<TelemetryField, TelemetryEntry>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: TelemetryField) -> Option<&TelemetryValue> {
        self.entries.get(&field).map(|entry| &entry.value)
    }

    pub fn entry(&self, field: TelemetryField) -> Option<&TelemetryEntry> {
        self.entries.get(&field)
    }

    /// Store a value if the field is valid under `status`.
    /// Returns true when the value was stored.
    pub fn store(&mut self, field: TelemetryField, value: TelemetryValue, status: TpmStatus) -> bool {
        if !field.is_valid_in(status) {
            return false;
        }
        self.entries.insert(
            field,
            TelemetryEntry {
                value,
                updated_at: unix_now(),
            },
        );
        true
    }

    /// Remove the given fields, returning those that actually held a value.
    pub fn evict(&mut self, fields: &[TelemetryField]) -> Vec<TelemetryField> {
        fields
            .iter()
            .filter(|field| self.entries.remove(*field).is_some())
            .copied()
            .collect()
    }

    /// Drop everything, returning the fields that held a value.
    pub fn clear(&mut self) -> Vec<TelemetryField> {
        let fields = self.entries.keys().copied().collect();
        self.entries.clear();
        fields
    }

    pub fn fields(&self) -> impl Iterator<Item = TelemetryField> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_membership() {
        assert_eq!(TelemetryField::Voltage.tier(), Some(TelemetryTier::Fast));
        assert_eq!(
            TelemetryField::PllLocked.tier(),
            Some(TelemetryTier::Medium)
        );
        assert_eq!(
            TelemetryField::BeamformerTable.tier(),
            Some(TelemetryTier::Slow)
        );
        assert_eq!(TelemetryField::RfiCount.tier(), None);
    }

    #[test]
    fn test_validity_follows_status() {
        use TelemetryField::*;

        assert!(Voltage.is_valid_in(TpmStatus::Unprogrammed));
        assert!(!Voltage.is_valid_in(TpmStatus::Unconnected));
        assert!(CheckCpldComms.is_valid_in(TpmStatus::Unconnected));
        assert!(!FpgaTemperatures.is_valid_in(TpmStatus::Unprogrammed));
        assert!(FpgaTemperatures.is_valid_in(TpmStatus::Programmed));
        assert!(!PpsDelay.is_valid_in(TpmStatus::Programmed));
        assert!(PpsDelay.is_valid_in(TpmStatus::Initialised));
        assert!(!RfiCount.is_valid_in(TpmStatus::Initialised));
        assert!(RfiCount.is_valid_in(TpmStatus::Synchronised));
        assert!(valid_fields(TpmStatus::Off).is_empty());
    }

    #[test]
    fn test_cache_refuses_invalid_fields() {
        let mut cache = TelemetryCache::new();
        assert!(!cache.store(
            TelemetryField::TileId,
            TelemetryValue::Int(3),
            TpmStatus::Programmed
        ));
        assert!(cache.store(
            TelemetryField::Voltage,
            TelemetryValue::Float(5.0),
            TpmStatus::Programmed
        ));
        assert_eq!(
            cache.get(TelemetryField::Voltage),
            Some(&TelemetryValue::Float(5.0))
        );
        let entry = cache.entry(TelemetryField::Voltage).unwrap();
        assert_eq!(entry.value.as_f64(), Some(5.0));
        assert!(entry.updated_at > 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_reports_only_present_fields() {
        let mut cache = TelemetryCache::new();
        cache.store(
            TelemetryField::PllLocked,
            TelemetryValue::Bool(true),
            TpmStatus::Programmed,
        );
        assert_eq!(
            cache.get(TelemetryField::PllLocked).and_then(TelemetryValue::as_bool),
            Some(true)
        );
        let removed = cache.evict(&[TelemetryField::PllLocked, TelemetryField::RfiCount]);
        assert_eq!(removed, vec![TelemetryField::PllLocked]);
        assert!(cache.is_empty());
    }
}
