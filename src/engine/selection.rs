use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::geo::{distance_km, within_radius};
use crate::models::courier::{Courier, CourierStatus, GeoPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Any available courier; longest-idle first.
    Availability,
    /// Available couriers whose service radius covers the shop, nearest first.
    Proximity,
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "availability" => Ok(Self::Availability),
            "proximity" => Ok(Self::Proximity),
            other => Err(format!(
                "unknown dispatch policy `{other}`, expected availability/proximity"
            )),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Availability => f.write_str("availability"),
            Self::Proximity => f.write_str("proximity"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub courier: Courier,
    pub distance_km: f64,
}

/// Orders the couriers eligible for a pickup at `shop`, best first.
pub fn rank_candidates(
    policy: SelectionPolicy,
    shop: &GeoPoint,
    couriers: Vec<Courier>,
    excluded: &HashSet<Uuid>,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = couriers
        .into_iter()
        .filter(|courier| courier.status == CourierStatus::Available)
        .filter(|courier| !excluded.contains(&courier.id))
        .filter(|courier| match policy {
            SelectionPolicy::Availability => true,
            SelectionPolicy::Proximity => within_radius(&courier.location, shop, courier.max_distance_km),
        })
        .map(|courier| Candidate {
            distance_km: distance_km(&courier.location, shop),
            courier,
        })
        .collect();

    match policy {
        SelectionPolicy::Availability => candidates.sort_by(by_idle_time),
        SelectionPolicy::Proximity => candidates.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| by_idle_time(a, b))
        }),
    }

    candidates
}

// `None` sorts before `Some`, so never-assigned couriers come first.
fn by_idle_time(a: &Candidate, b: &Candidate) -> Ordering {
    a.courier
        .last_assigned_at
        .cmp(&b.courier.last_assigned_at)
        .then_with(|| a.courier.id.cmp(&b.courier.id))
}
