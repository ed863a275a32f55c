//! Reference composite-schedule calculator
//!
//! Computes the schedule a 1.6 station should report for GetCompositeSchedule
//! from the profiles installed on it, so smart-charging scenarios can derive
//! the expected answer instead of hard-coding it.
//!
//! Per evaluation point the highest stack level wins within a purpose, a
//! TxProfile replaces the TxDefaultProfile, and the station maximum caps the
//! result. Limits are converted between amps and watts at 230 V per phase.

use super::types::{
    ChargingProfile16, ChargingProfileKind, ChargingProfilePurpose, ChargingRateUnit, ChargingSchedule16,
    ChargingSchedulePeriod, RecurrencyKind,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

pub const LINE_VOLTAGE: f64 = 230.0;
pub const DEFAULT_PHASES: i32 = 3;
pub const DEFAULT_LIMIT_AMPS: f64 = 48.0;

/// A profile as installed on a connector (0 = whole station)
#[derive(Debug, Clone)]
pub struct InstalledProfile {
    pub connector_id: i32,
    pub profile: ChargingProfile16,
}

impl InstalledProfile {
    pub fn new(connector_id: i32, profile: ChargingProfile16) -> Self {
        Self { connector_id, profile }
    }
}

#[derive(Debug, Clone)]
pub struct CompositeRequest {
    pub connector_id: i32,
    pub start: DateTime<Utc>,
    /// Seconds
    pub duration: i32,
    pub unit: ChargingRateUnit,
    /// Limit reported where no profile applies
    pub default_limit_amps: f64,
    /// Origin of relative profiles, the request start if unset
    pub transaction_start: Option<DateTime<Utc>>,
}

impl CompositeRequest {
    pub fn new(connector_id: i32, start: DateTime<Utc>, duration: i32, unit: ChargingRateUnit) -> Self {
        Self {
            connector_id,
            start,
            duration,
            unit,
            default_limit_amps: DEFAULT_LIMIT_AMPS,
            transaction_start: None,
        }
    }

    pub fn with_default_limit(mut self, amps: f64) -> Self {
        self.default_limit_amps = amps;
        self
    }

    pub fn with_transaction_start(mut self, start: DateTime<Utc>) -> Self {
        self.transaction_start = Some(start);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Limit {
    value: f64,
    phases: i32,
}

fn round(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn convert(value: f64, from: ChargingRateUnit, to: ChargingRateUnit, phases: i32) -> f64 {
    let factor = LINE_VOLTAGE * f64::from(phases);
    match (from, to) {
        (ChargingRateUnit::A, ChargingRateUnit::W) => value * factor,
        (ChargingRateUnit::W, ChargingRateUnit::A) => value / factor,
        _ => value,
    }
}

fn recurrence_seconds(kind: Option<RecurrencyKind>) -> i64 {
    match kind {
        Some(RecurrencyKind::Weekly) => 7 * 86_400,
        _ => 86_400,
    }
}

/// Start of the schedule cycle that covers `at`
fn origin_at(profile: &ChargingProfile16, request: &CompositeRequest, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = &profile.charging_schedule;
    match profile.charging_profile_kind {
        ChargingProfileKind::Absolute => Some(schedule.start_schedule.unwrap_or(request.start)),
        ChargingProfileKind::Relative => Some(request.transaction_start.unwrap_or(request.start)),
        ChargingProfileKind::Recurring => {
            let base = schedule.start_schedule?;
            let elapsed = (at - base).num_seconds();
            if elapsed < 0 {
                return None;
            }
            let cycle = recurrence_seconds(profile.recurrency_kind);
            Some(base + Duration::seconds(elapsed - elapsed.rem_euclid(cycle)))
        }
    }
}

/// Limit of one profile at `at` in the requested unit
fn profile_limit(profile: &ChargingProfile16, request: &CompositeRequest, at: DateTime<Utc>) -> Option<Limit> {
    if profile.valid_from.is_some_and(|from| at < from) || profile.valid_to.is_some_and(|to| at >= to) {
        return None;
    }
    let schedule = &profile.charging_schedule;
    let origin = origin_at(profile, request, at)?;
    let offset = (at - origin).num_seconds();
    if offset < 0 || schedule.duration.is_some_and(|d| offset >= i64::from(d)) {
        return None;
    }

    let period = schedule
        .charging_schedule_period
        .iter()
        .filter(|p| i64::from(p.start_period) <= offset)
        .max_by_key(|p| p.start_period)?;
    let phases = period.number_phases.unwrap_or(DEFAULT_PHASES);
    Some(Limit {
        value: convert(period.limit, schedule.charging_rate_unit, request.unit, phases),
        phases,
    })
}

/// Winner among the installed profiles of one purpose
fn purpose_limit<'a>(
    profiles: impl Iterator<Item = &'a InstalledProfile>,
    request: &CompositeRequest,
    at: DateTime<Utc>,
) -> Option<Limit> {
    profiles
        .filter_map(|p| {
            profile_limit(&p.profile, request, at).map(|limit| {
                // connector-specific profiles shadow station-wide ones
                let specific = p.connector_id != 0;
                ((specific, p.profile.stack_level), limit)
            })
        })
        .max_by_key(|(rank, _)| *rank)
        .map(|(_, limit)| limit)
}

fn boundaries(profiles: &[&InstalledProfile], request: &CompositeRequest) -> BTreeSet<i64> {
    let end = request.start + Duration::seconds(i64::from(request.duration));
    let mut points = BTreeSet::from([0]);
    let mut add = |at: DateTime<Utc>| {
        let offset = (at - request.start).num_seconds();
        if offset > 0 && offset < i64::from(request.duration) {
            points.insert(offset);
        }
    };

    for installed in profiles {
        let profile = &installed.profile;
        let schedule = &profile.charging_schedule;
        if let Some(from) = profile.valid_from {
            add(from);
        }
        if let Some(to) = profile.valid_to {
            add(to);
        }

        let mut origins = Vec::new();
        if profile.charging_profile_kind == ChargingProfileKind::Recurring {
            let cycle = Duration::seconds(recurrence_seconds(profile.recurrency_kind));
            let mut origin = origin_at(profile, request, request.start).or(schedule.start_schedule);
            while let Some(o) = origin.filter(|o| *o < end) {
                origins.push(o);
                origin = Some(o + cycle);
            }
        } else if let Some(o) = origin_at(profile, request, request.start) {
            origins.push(o);
        }

        for origin in origins {
            for period in &schedule.charging_schedule_period {
                add(origin + Duration::seconds(i64::from(period.start_period)));
            }
            if let Some(duration) = schedule.duration {
                add(origin + Duration::seconds(i64::from(duration)));
            }
        }
    }
    points
}

/// Combine the installed profiles into the schedule for one connector
pub fn composite_schedule(profiles: &[InstalledProfile], request: &CompositeRequest) -> ChargingSchedule16 {
    let applicable: Vec<&InstalledProfile> = profiles
        .iter()
        .filter(|p| {
            let purpose = p.profile.charging_profile_purpose;
            if purpose.is_station_max() {
                p.connector_id == 0
            } else if purpose == ChargingProfilePurpose::TxProfile {
                p.connector_id == request.connector_id
            } else {
                p.connector_id == 0 || p.connector_id == request.connector_id
            }
        })
        .collect();

    let of = |purpose: fn(&ChargingProfilePurpose) -> bool| {
        let selected: Vec<&InstalledProfile> = applicable
            .iter()
            .copied()
            .filter(|p| purpose(&p.profile.charging_profile_purpose))
            .collect();
        selected
    };
    let station_max = of(ChargingProfilePurpose::is_station_max);
    let tx_default = of(|p| *p == ChargingProfilePurpose::TxDefaultProfile);
    let tx = of(|p| *p == ChargingProfilePurpose::TxProfile);

    let fallback = Limit {
        value: convert(request.default_limit_amps, ChargingRateUnit::A, request.unit, DEFAULT_PHASES),
        phases: DEFAULT_PHASES,
    };

    let mut periods: Vec<ChargingSchedulePeriod> = Vec::new();
    for offset in boundaries(&applicable, request) {
        let at = request.start + Duration::seconds(offset);
        let session = purpose_limit(tx.iter().copied(), request, at)
            .or_else(|| purpose_limit(tx_default.iter().copied(), request, at));
        let cap = purpose_limit(station_max.iter().copied(), request, at);

        let limit = match (cap, session) {
            (Some(c), Some(s)) if c.value < s.value => c,
            (Some(c), Some(s)) if c.value == s.value => Limit {
                value: c.value,
                phases: c.phases.min(s.phases),
            },
            (_, Some(s)) => s,
            (Some(c), None) => c,
            (None, None) => fallback,
        };

        let value = round(limit.value);
        let unchanged = periods
            .last()
            .is_some_and(|p| p.limit == value && p.number_phases == Some(limit.phases));
        if !unchanged {
            let start = i32::try_from(offset).unwrap_or(i32::MAX);
            periods.push(ChargingSchedulePeriod::new(start, value, Some(limit.phases)));
        }
    }

    ChargingSchedule16 {
        duration: Some(request.duration),
        start_schedule: Some(request.start),
        charging_rate_unit: request.unit,
        charging_schedule_period: periods,
        min_charging_rate: None,
    }
}
