//! Deterministic star composition and galactic coordinates
//!
//! Every derivation hashes the UUID with a named sub-seed label, so two
//! processes holding the same UUID always agree on class, companions, and
//! position. The normative derivations:
//!
//! - `star_seed   = SHA-256(uuid ∥ "star_type")`
//! - `multi_seed  = SHA-256(uuid ∥ "multiplicity")`
//! - `offset_seed = SHA-256(own_uuid ∥ sponsor_uuid ∥ "offset")`

use crate::error::{Error, Result};
use crate::types::{Coordinates, Multiplicity, StarClass, StarComposition, ORIGIN};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Sub-seed label for the primary class draw.
const SEED_STAR_TYPE: &str = "star_type";
/// Sub-seed label for the single/binary/trinary draw.
const SEED_MULTIPLICITY: &str = "multiplicity";
/// Sub-seed label for the companion class draws.
const SEED_SECONDARY: &str = "secondary";
const SEED_TERTIARY: &str = "tertiary";
/// Sub-seed label for the sponsor-relative position offset.
const SEED_OFFSET: &str = "offset";

/// Offset vector length bounds for sponsored coordinates.
pub const MIN_OFFSET: f64 = 100.0;
pub const MAX_OFFSET: f64 = 500.0;

/// Tolerance when validating claimed coordinates against the sponsor-derived
/// expectation. Offsets are >= 100 units, so this can never cross clusters.
pub const COORDINATE_EPSILON: f64 = 1.0;

/// Rarity table: cumulative probability walked in order.
const RARITY: [(StarClass, f64); 7] = [
    (StarClass::M, 0.40),
    (StarClass::K, 0.25),
    (StarClass::G, 0.175),
    (StarClass::F, 0.10),
    (StarClass::A, 0.05),
    (StarClass::B, 0.02),
    (StarClass::O, 0.005),
];

/// `SHA-256(uuid ∥ label)`.
fn sub_seed(uuid: &Uuid, label: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(uuid.hyphenated().to_string().as_bytes());
    hasher.update(label.as_bytes());
    hasher.finalize().into()
}

/// `SHA-256(own ∥ sponsor ∥ label)`.
fn sub_seed_with_sponsor(own: &Uuid, sponsor: &Uuid, label: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(own.hyphenated().to_string().as_bytes());
    hasher.update(sponsor.hyphenated().to_string().as_bytes());
    hasher.update(label.as_bytes());
    hasher.finalize().into()
}

/// One uniform draw in [0, 1) from an 8-byte lane of a seed.
fn unit_fraction(seed: &[u8; 32], lane: usize) -> f64 {
    let start = lane * 8;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&seed[start..start + 8]);
    u64::from_be_bytes(bytes) as f64 / (u64::MAX as f64 + 1.0)
}

/// Walk the rarity table for a single draw.
fn class_for_roll(roll: f64) -> StarClass {
    let mut cumulative = 0.0;
    for (class, share) in RARITY {
        cumulative += share;
        if roll < cumulative {
            return class;
        }
    }
    StarClass::O
}

/// Primary star class for a UUID. Class X is never drawn.
pub fn star_class_of(uuid: &Uuid) -> StarClass {
    class_for_roll(unit_fraction(&sub_seed(uuid, SEED_STAR_TYPE), 0))
}

/// Multiplicity draw: 50% single, 40% binary, 10% trinary.
pub fn multiplicity_of(uuid: &Uuid) -> Multiplicity {
    let roll = unit_fraction(&sub_seed(uuid, SEED_MULTIPLICITY), 0);
    if roll < 0.50 {
        Multiplicity::Single
    } else if roll < 0.90 {
        Multiplicity::Binary
    } else {
        Multiplicity::Trinary
    }
}

/// Full deterministic composition for a UUID.
pub fn composition_of(uuid: &Uuid) -> StarComposition {
    let multiplicity = multiplicity_of(uuid);
    let secondary = match multiplicity {
        Multiplicity::Single => None,
        _ => Some(class_for_roll(unit_fraction(
            &sub_seed(uuid, SEED_SECONDARY),
            0,
        ))),
    };
    let tertiary = match multiplicity {
        Multiplicity::Trinary => Some(class_for_roll(unit_fraction(
            &sub_seed(uuid, SEED_TERTIARY),
            0,
        ))),
        _ => None,
    };
    StarComposition {
        primary: star_class_of(uuid),
        secondary,
        tertiary,
        multiplicity,
    }
}

/// Composition of the lone genesis system: class X, single, at the origin.
pub fn genesis_composition() -> StarComposition {
    StarComposition {
        primary: StarClass::X,
        secondary: None,
        tertiary: None,
        multiplicity: Multiplicity::Single,
    }
}

/// Deterministic offset vector from a sponsor's position.
///
/// Direction is uniform on the sphere; length lies in `[MIN_OFFSET, MAX_OFFSET]`.
pub fn offset_of(own: &Uuid, sponsor: &Uuid) -> (f64, f64, f64) {
    let seed = sub_seed_with_sponsor(own, sponsor, SEED_OFFSET);
    let theta = 2.0 * std::f64::consts::PI * unit_fraction(&seed, 0);
    let cos_phi = 2.0 * unit_fraction(&seed, 1) - 1.0;
    let sin_phi = (1.0 - cos_phi * cos_phi).sqrt();
    let r = MIN_OFFSET + (MAX_OFFSET - MIN_OFFSET) * unit_fraction(&seed, 2);
    (
        r * sin_phi * theta.cos(),
        r * sin_phi * theta.sin(),
        r * cos_phi,
    )
}

/// Coordinates for a sponsored joiner: sponsor position plus offset.
pub fn coordinates_for(own: &Uuid, sponsor: &Uuid, sponsor_pos: &Coordinates) -> Coordinates {
    let (dx, dy, dz) = offset_of(own, sponsor);
    Coordinates::new(sponsor_pos.x + dx, sponsor_pos.y + dy, sponsor_pos.z + dz)
}

/// Validate claimed coordinates against the sponsor-derived expectation.
pub fn validate_coordinates(
    claimed: &Coordinates,
    own: &Uuid,
    sponsor: &Uuid,
    sponsor_pos: &Coordinates,
) -> Result<()> {
    let expected = coordinates_for(own, sponsor, sponsor_pos);
    let deviation = claimed.distance_to(&expected);
    if deviation > COORDINATE_EPSILON {
        return Err(Error::CoordinateConflict { deviation });
    }
    Ok(())
}

/// Check the genesis invariant: class X only at the exact origin.
pub fn validate_genesis_claim(star: &StarComposition, coordinates: &Coordinates) -> Result<()> {
    let involves_x = star.primary == StarClass::X
        || star.secondary == Some(StarClass::X)
        || star.tertiary == Some(StarClass::X);
    if involves_x && (*coordinates != ORIGIN || star.primary != StarClass::X) {
        return Err(Error::InvalidMessage(
            "class X claimed away from the origin".into(),
        ));
    }
    Ok(())
}
