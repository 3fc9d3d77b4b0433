//! Patient units and the envelope they travel in between stages.
//!
//! Every hop in the pipeline carries the same [`Envelope`]. Its priority
//! key decides dequeue order on a channel: lower keys are received first,
//! so VIP traffic overtakes standard traffic and red triage overtakes
//! yellow and green at a specialist.

use crate::random::RandomGenerator;
use std::fmt;

/// Number of specialist desks.
pub const SPECIALIST_COUNT: usize = 6;

/// Age below which a patient arrives with a guardian.
pub const MINOR_AGE: i32 = 18;

/// Severity assigned by triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriageColour {
    Red,
    Yellow,
    Green,
}

impl TriageColour {
    /// Tier used in specialist priority keys (red = 1, yellow = 2, green = 3).
    #[must_use]
    pub const fn tier(self) -> i64 {
        match self {
            Self::Red => 1,
            Self::Yellow => 2,
            Self::Green => 3,
        }
    }

    #[must_use]
    pub const fn from_tier(tier: i64) -> Option<Self> {
        match tier {
            1 => Some(Self::Red),
            2 => Some(Self::Yellow),
            3 => Some(Self::Green),
            _ => None,
        }
    }

    /// Colour for a percent roll in `[0, 100)`: 10 % red, 35 % yellow, 55 % green.
    #[must_use]
    pub const fn from_roll(roll: u32) -> Self {
        if roll < 10 {
            Self::Red
        } else if roll < 45 {
            Self::Yellow
        } else {
            Self::Green
        }
    }
}

impl fmt::Display for TriageColour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Red => write!(f, "red"),
            Self::Yellow => write!(f, "yellow"),
            Self::Green => write!(f, "green"),
        }
    }
}

/// The six specialist desks, in channel order (`A` through `F`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Specialty {
    Cardiologist,
    Neurologist,
    Ophthalmologist,
    Laryngologist,
    Surgeon,
    Paediatrician,
}

impl Specialty {
    pub const ALL: [Self; SPECIALIST_COUNT] = [
        Self::Cardiologist,
        Self::Neurologist,
        Self::Ophthalmologist,
        Self::Laryngologist,
        Self::Surgeon,
        Self::Paediatrician,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Cardiologist => 0,
            Self::Neurologist => 1,
            Self::Ophthalmologist => 2,
            Self::Laryngologist => 3,
            Self::Surgeon => 4,
            Self::Paediatrician => 5,
        }
    }

    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cardiologist => "cardiologist",
            Self::Neurologist => "neurologist",
            Self::Ophthalmologist => "ophthalmologist",
            Self::Laryngologist => "laryngologist",
            Self::Surgeon => "surgeon",
            Self::Paediatrician => "paediatrician",
        }
    }
}

impl fmt::Display for Specialty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a specialist visit ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Home,
    Ward,
    OtherFacility,
}

impl Outcome {
    /// Outcome for a per-mille roll in `[0, 1000)`: 85 % home, 14.5 % ward, 0.5 % other.
    #[must_use]
    pub const fn from_roll(roll: u32) -> Self {
        if roll < 850 {
            Self::Home
        } else if roll < 995 {
            Self::Ward
        } else {
            Self::OtherFacility
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Home => write!(f, "home"),
            Self::Ward => write!(f, "ward"),
            Self::OtherFacility => write!(f, "other facility"),
        }
    }
}

/// Priority keys and receive ceilings for every channel.
pub mod priority {
    use super::{Specialty, TriageColour};

    pub const REGISTRATION_VIP: i64 = 1;
    pub const REGISTRATION_STANDARD: i64 = 2;
    pub const REGISTRATION_CEILING: i64 = 2;

    pub const TRIAGE_VIP: i64 = 2;
    pub const TRIAGE_STANDARD: i64 = 3;
    pub const TRIAGE_CEILING: i64 = 3;

    /// Key of every record on the log channel.
    pub const LOG_RECORD: i64 = 10;

    const SPECIALIST_BASE: i64 = 4;
    const SPECIALIST_STRIDE: i64 = 10;

    #[must_use]
    pub const fn registration(vip: bool) -> i64 {
        if vip {
            REGISTRATION_VIP
        } else {
            REGISTRATION_STANDARD
        }
    }

    #[must_use]
    pub const fn triage(vip: bool) -> i64 {
        if vip {
            TRIAGE_VIP
        } else {
            TRIAGE_STANDARD
        }
    }

    /// `4 + 10·index + tier`.
    #[must_use]
    pub const fn specialist(specialty: Specialty, colour: TriageColour) -> i64 {
        SPECIALIST_BASE + SPECIALIST_STRIDE * specialty.index() as i64 + colour.tier()
    }

    /// Highest key a specialist accepts: its own green tier.
    #[must_use]
    pub const fn specialist_ceiling(specialty: Specialty) -> i64 {
        specialist(specialty, TriageColour::Green)
    }
}

/// One admission: a patient, plus a guardian when the patient is a minor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientUnit {
    pub id: i32,
    pub age: i32,
    pub vip: bool,
    pub has_guardian: bool,
    pub person_count: i32,
}

impl PatientUnit {
    /// Build a unit; minors get a guardian and count as two persons.
    #[must_use]
    pub fn new(id: i32, age: i32, vip: bool) -> Self {
        let has_guardian = age < MINOR_AGE;
        Self {
            id,
            age,
            vip,
            has_guardian,
            person_count: if has_guardian { 2 } else { 1 },
        }
    }

    /// Draw a new arrival: age uniform in `[1, 90]`, VIP with 10 %.
    pub fn synthesize(id: i32, rng: &mut RandomGenerator) -> Self {
        let age = rng.uniform_int(1, 90);
        let vip = rng.chance(10);
        Self::new(id, age, vip)
    }
}

/// Message passed between pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Channel priority key (`mtype`).
    pub priority: i64,
    pub patient_id: i32,
    pub age: i32,
    pub vip: bool,
    pub colour: Option<TriageColour>,
    pub specialty: Option<Specialty>,
    pub person_count: i32,
    /// Whoever ends this unit still owes the gate `person_count` permits.
    pub holds_permits: bool,
    /// Free text, truncated to 63 bytes on the wire.
    pub tag: String,
}

impl Envelope {
    /// Envelope a freshly admitted unit for the registration channel.
    #[must_use]
    pub fn arrival(unit: &PatientUnit) -> Self {
        Self {
            priority: priority::registration(unit.vip),
            patient_id: unit.id,
            age: unit.age,
            vip: unit.vip,
            colour: None,
            specialty: None,
            person_count: unit.person_count,
            holds_permits: true,
            tag: if unit.has_guardian {
                "guardian".to_string()
            } else {
                "solo".to_string()
            },
        }
    }

    /// Re-key for the triage channel, keeping the VIP tier.
    #[must_use]
    pub fn for_triage(mut self, holds_permits: bool) -> Self {
        self.priority = priority::triage(self.vip);
        self.holds_permits = holds_permits;
        self
    }

    /// Re-key for a specialist channel.
    #[must_use]
    pub fn for_specialist(mut self, specialty: Specialty, colour: TriageColour) -> Self {
        self.priority = priority::specialist(specialty, colour);
        self.specialty = Some(specialty);
        self.colour = Some(colour);
        self
    }

    /// Permits the receiver must return when it ends this unit.
    #[must_use]
    pub fn permits_owed(&self) -> i32 {
        if self.holds_permits {
            self.person_count
        } else {
            0
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        if self.vip {
            "VIP"
        } else {
            "standard"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_gets_guardian() {
        let minor = PatientUnit::new(1, 12, false);
        assert!(minor.has_guardian);
        assert_eq!(minor.person_count, 2);

        let adult = PatientUnit::new(2, 18, true);
        assert!(!adult.has_guardian);
        assert_eq!(adult.person_count, 1);
    }

    #[test]
    fn test_priority_keys() {
        assert_eq!(priority::registration(true), 1);
        assert_eq!(priority::registration(false), 2);
        assert_eq!(priority::triage(true), 2);
        assert_eq!(priority::triage(false), 3);

        assert_eq!(priority::specialist(Specialty::Cardiologist, TriageColour::Red), 5);
        assert_eq!(priority::specialist(Specialty::Cardiologist, TriageColour::Green), 7);
        assert_eq!(priority::specialist(Specialty::Paediatrician, TriageColour::Yellow), 56);
        assert_eq!(priority::specialist_ceiling(Specialty::Neurologist), 17);
    }

    #[test]
    fn test_specialist_key_bands_do_not_overlap() {
        for pair in Specialty::ALL.windows(2) {
            assert!(priority::specialist_ceiling(pair[0]) < priority::specialist(pair[1], TriageColour::Red));
        }
    }

    #[test]
    fn test_colour_distribution_boundaries() {
        assert_eq!(TriageColour::from_roll(0), TriageColour::Red);
        assert_eq!(TriageColour::from_roll(9), TriageColour::Red);
        assert_eq!(TriageColour::from_roll(10), TriageColour::Yellow);
        assert_eq!(TriageColour::from_roll(44), TriageColour::Yellow);
        assert_eq!(TriageColour::from_roll(45), TriageColour::Green);
        assert_eq!(TriageColour::from_roll(99), TriageColour::Green);
    }

    #[test]
    fn test_outcome_boundaries() {
        assert_eq!(Outcome::from_roll(0), Outcome::Home);
        assert_eq!(Outcome::from_roll(849), Outcome::Home);
        assert_eq!(Outcome::from_roll(850), Outcome::Ward);
        assert_eq!(Outcome::from_roll(994), Outcome::Ward);
        assert_eq!(Outcome::from_roll(995), Outcome::OtherFacility);
    }

    #[test]
    fn test_envelope_hops() {
        let unit = PatientUnit::new(7, 10, true);
        let env = Envelope::arrival(&unit);
        assert_eq!(env.priority, 1);
        assert_eq!(env.permits_owed(), 2);
        assert_eq!(env.tag, "guardian");

        let env = env.for_triage(false);
        assert_eq!(env.priority, 2);
        assert_eq!(env.permits_owed(), 0);

        let env = env.for_specialist(Specialty::Surgeon, TriageColour::Red);
        assert_eq!(env.priority, 45);
        assert_eq!(env.specialty, Some(Specialty::Surgeon));
        assert_eq!(env.colour, Some(TriageColour::Red));
    }

    #[test]
    fn test_synthesize_ranges() {
        let mut rng = RandomGenerator::seeded(3);
        for id in 0..200 {
            let unit = PatientUnit::synthesize(id, &mut rng);
            assert!((1..=90).contains(&unit.age));
            assert_eq!(unit.has_guardian, unit.age < MINOR_AGE);
        }
    }

    #[test]
    fn test_specialty_index_round_trip() {
        for (i, s) in Specialty::ALL.iter().enumerate() {
            assert_eq!(s.index(), i);
            assert_eq!(Specialty::from_index(i), Some(*s));
        }
        assert_eq!(Specialty::from_index(6), None);
    }
}
