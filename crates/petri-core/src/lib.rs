//! Core simulation types for the Petri workspace.
//!
//! A [`World`] owns every entity (cells, food particles, inert barriers), a
//! toroidal spatial hash for neighbor queries, and two chemical signal fields
//! the cells use for sensing: food sources attract, other cells repel. Each
//! tick integrates physics, runs per-variant behavior, resolves collisions,
//! and only then commits the spawn/despawn requests queued along the way, so
//! iteration is never invalidated mid-tick.

use ordered_float::OrderedFloat;
use petri_index::{GridError, TorusGrid, TorusIndex, wrap};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{Key, SlotMap, new_key_type};
use std::collections::{HashSet, VecDeque};
use std::f32::consts::{FRAC_2_PI, TAU};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for world entities backed by a generational slot map.
    pub struct EntityId;
}

new_key_type! {
    /// Stable handle for gradient sources registered in a signal field.
    pub struct SourceId;
}

/// Below this distance a collision normal is degenerate and picked at random.
const DEGENERATE_DISTANCE: f32 = 0.1;
/// Gravity is softened so near-overlapping bodies cannot slingshot.
const GRAVITY_SOFTENING: f32 = 10.0;
/// Accumulated field directions shorter than this are treated as zero.
const DIRECTION_EPSILON: f32 = 1e-4;

// ---------------------------------------------------------------------------
// Vec2
// ---------------------------------------------------------------------------

/// Immutable 2D vector value type used for positions, velocities, and forces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    /// Construct a new vector.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Vector of `length` pointing at `angle` radians.
    #[must_use]
    pub fn from_polar(angle: f32, length: f32) -> Self {
        Self::new(angle.cos() * length, angle.sin() * length)
    }

    #[must_use]
    pub fn magnitude_sq(self) -> f32 {
        self.x * self.x + self.y * self.y
    }

    #[must_use]
    pub fn magnitude(self) -> f32 {
        self.magnitude_sq().sqrt()
    }

    /// Unit vector in the same direction, or zero for (near-)zero input.
    #[must_use]
    pub fn normalized(self) -> Self {
        let magnitude = self.magnitude();
        if magnitude <= DIRECTION_EPSILON {
            Self::ZERO
        } else {
            self.scaled(1.0 / magnitude)
        }
    }

    #[must_use]
    pub fn scaled(self, factor: f32) -> Self {
        Self::new(self.x * factor, self.y * factor)
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }
}

impl std::ops::Add for Vec2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Neg for Vec2 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

impl std::ops::Mul<f32> for Vec2 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        self.scaled(rhs)
    }
}

impl std::ops::AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

// ---------------------------------------------------------------------------
// Torus
// ---------------------------------------------------------------------------

/// World dimensions with wrap-around coordinate math.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Torus {
    pub width: f32,
    pub height: f32,
}

impl Torus {
    #[must_use]
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// Wrap a point into `[0, width) × [0, height)`.
    #[must_use]
    pub fn wrap_point(self, point: Vec2) -> Vec2 {
        Vec2::new(wrap(point.x, self.width), wrap(point.y, self.height))
    }

    /// Shortest wrapped vector from `from` to `to`.
    #[must_use]
    pub fn delta(self, from: Vec2, to: Vec2) -> Vec2 {
        Vec2::new(
            petri_index::wrapped_delta(from.x, to.x, self.width),
            petri_index::wrapped_delta(from.y, to.y, self.height),
        )
    }

    #[must_use]
    pub fn distance_sq(self, a: Vec2, b: Vec2) -> f32 {
        self.delta(a, b).magnitude_sq()
    }

    #[must_use]
    pub fn distance(self, a: Vec2, b: Vec2) -> f32 {
        self.distance_sq(a, b).sqrt()
    }
}

// ---------------------------------------------------------------------------
// Chemical signatures
// ---------------------------------------------------------------------------

/// 2D chemical identity tag in `[0,1) × [0,1)` with toroidal distance.
///
/// Food carries one as its flavor; cells carry one as their preference. The
/// distance between the two drives digestion efficiency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub u: f32,
    pub v: f32,
}

impl Signature {
    /// Largest possible toroidal distance between two signatures.
    pub const MAX_DISTANCE: f32 = std::f32::consts::FRAC_1_SQRT_2;

    /// Construct a signature, wrapping both components into `[0, 1)`.
    #[must_use]
    pub fn new(u: f32, v: f32) -> Self {
        Self {
            u: wrap(u, 1.0),
            v: wrap(v, 1.0),
        }
    }

    /// The chemically opposite signature: the antipode on the identity torus.
    #[must_use]
    pub fn inverted(self) -> Self {
        Self::new(self.u + 0.5, self.v + 0.5)
    }

    /// Toroidal distance in identity space.
    #[must_use]
    pub fn distance(self, other: Self) -> f32 {
        let du = petri_index::wrapped_delta(self.u, other.u, 1.0);
        let dv = petri_index::wrapped_delta(self.v, other.v, 1.0);
        (du * du + dv * dv).sqrt()
    }

    /// Compatibility in `[0, 1]`: 1.0 for identical signatures, 0.0 at the antipode.
    #[must_use]
    pub fn affinity(self, other: Self) -> f32 {
        (1.0 - self.distance(other) / Self::MAX_DISTANCE).clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Gradient / signal channel
// ---------------------------------------------------------------------------

/// A point source registered in a signal field.
///
/// The owner is a plain back-reference; the source's lifetime is managed by
/// whoever registered it, never by the field.
#[derive(Debug, Clone, Copy)]
pub struct GradientSource {
    pub position: Vec2,
    pub strength: f32,
    pub signature: Signature,
    pub owner: Option<EntityId>,
}

/// Result of sampling a signal field at a point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FieldSample {
    /// Sum of falloff-weighted source strengths.
    pub strength: f32,
    /// Unit vector toward the weighted center of influence, or zero.
    pub direction: Vec2,
}

/// One independently-parameterized scalar + direction field built from point
/// sources with distance falloff.
///
/// Each channel owns its own spatial hash, so sampling scans only the cells
/// within `influence_radius` of the query point.
#[derive(Debug)]
pub struct SignalField {
    torus: Torus,
    influence_radius: f32,
    falloff: f32,
    sources: SlotMap<SourceId, GradientSource>,
    grid: TorusGrid<SourceId>,
}

impl SignalField {
    /// Create an empty channel over the given world.
    pub fn new(
        torus: Torus,
        cell_size: f32,
        influence_radius: f32,
        falloff: f32,
    ) -> Result<Self, WorldError> {
        if !(influence_radius.is_finite() && influence_radius > 0.0) {
            return Err(WorldError::InvalidConfig(
                "influence_radius must be positive",
            ));
        }
        if !(falloff.is_finite() && falloff >= 0.0) {
            return Err(WorldError::InvalidConfig(
                "falloff exponent must be non-negative",
            ));
        }
        Ok(Self {
            torus,
            influence_radius,
            falloff,
            sources: SlotMap::with_key(),
            grid: TorusGrid::new(cell_size, torus.width, torus.height)?,
        })
    }

    /// Maximum distance at which a source contributes to a sample.
    #[must_use]
    pub const fn influence_radius(&self) -> f32 {
        self.influence_radius
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true when no sources are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Register a source, returning its handle.
    pub fn add_source(&mut self, source: GradientSource) -> SourceId {
        let position = self.torus.wrap_point(source.position);
        let id = self.sources.insert(GradientSource { position, ..source });
        self.grid.insert(id, position.x, position.y);
        id
    }

    /// Drop a source, returning whether it was registered.
    pub fn remove_source(&mut self, id: SourceId) -> bool {
        if self.sources.remove(id).is_some() {
            self.grid.remove(id);
            true
        } else {
            false
        }
    }

    /// Move a source as its owner moves.
    pub fn update_position(&mut self, id: SourceId, position: Vec2) {
        let position = self.torus.wrap_point(position);
        if let Some(source) = self.sources.get_mut(id) {
            source.position = position;
            self.grid.relocate(id, position.x, position.y);
        }
    }

    /// Adjust a source's emission strength in place.
    pub fn set_strength(&mut self, id: SourceId, strength: f32) {
        if let Some(source) = self.sources.get_mut(id) {
            source.strength = strength;
        }
    }

    /// Borrow a registered source.
    #[must_use]
    pub fn source(&self, id: SourceId) -> Option<&GradientSource> {
        self.sources.get(id)
    }

    /// Sample the field at `at`, aggregating every source in range.
    #[must_use]
    pub fn sample(&self, at: Vec2) -> FieldSample {
        self.sample_filtered(at, |_| true)
    }

    /// Sample the field at `at`, skipping sources rejected by `keep` before
    /// any falloff math is spent on them.
    ///
    /// Weight per source is `strength × (1 − d/R)^falloff`; the direction is
    /// the normalized weight-scaled sum of unit vectors toward each source.
    /// Sampling is pure given the current registrations; a field with nothing
    /// in range yields the zero sample.
    pub fn sample_filtered(
        &self,
        at: Vec2,
        mut keep: impl FnMut(&GradientSource) -> bool,
    ) -> FieldSample {
        let mut strength = 0.0_f32;
        let mut direction = Vec2::ZERO;
        let radius = self.influence_radius;
        let sources = &self.sources;
        let torus = self.torus;
        let falloff = self.falloff;

        self.grid
            .for_each_within(at.x, at.y, radius, &mut |id, dist_sq| {
                let Some(source) = sources.get(id) else { return };
                if !keep(source) {
                    return;
                }
                let distance = dist_sq.into_inner().sqrt();
                let weight = source.strength * (1.0 - distance / radius).powf(falloff);
                strength += weight;
                if distance > DIRECTION_EPSILON {
                    let toward = torus.delta(at, source.position).scaled(1.0 / distance);
                    direction += toward.scaled(weight);
                }
            });

        FieldSample {
            strength,
            direction: direction.normalized(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised when constructing or configuring a world.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl From<GridError> for WorldError {
    fn from(error: GridError) -> Self {
        match error {
            GridError::InvalidConfig(message) => Self::InvalidConfig(message),
        }
    }
}

/// Errors raised when a physics body invariant would be violated.
#[derive(Debug, Error, PartialEq)]
pub enum BodyError {
    #[error("mass must be positive (got {0})")]
    NonPositiveMass(f32),
    #[error("size must be non-negative (got {0})")]
    NegativeSize(f32),
}

// ---------------------------------------------------------------------------
// Physics body
// ---------------------------------------------------------------------------

/// Shared physics state carried by every entity variant.
///
/// Mass is strictly positive and size non-negative; both are enforced at
/// construction and at every mutation site rather than silently clamped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Body {
    position: Vec2,
    velocity: Vec2,
    acceleration: Vec2,
    mass: f32,
    size: f32,
    color: [f32; 3],
    is_static: bool,
    restitution: f32,
    damping: f32,
}

impl Body {
    /// Construct a dynamic body at `position`.
    pub fn new(position: Vec2, mass: f32, size: f32) -> Result<Self, BodyError> {
        if !(mass.is_finite() && mass > 0.0) {
            return Err(BodyError::NonPositiveMass(mass));
        }
        if !(size.is_finite() && size >= 0.0) {
            return Err(BodyError::NegativeSize(size));
        }
        Ok(Self {
            position,
            velocity: Vec2::ZERO,
            acceleration: Vec2::ZERO,
            mass,
            size,
            color: [1.0, 1.0, 1.0],
            is_static: false,
            restitution: 0.5,
            damping: 1.0,
        })
    }

    #[must_use]
    pub fn with_velocity(mut self, velocity: Vec2) -> Self {
        self.velocity = velocity;
        self
    }

    #[must_use]
    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    #[must_use]
    pub fn with_restitution(mut self, restitution: f32) -> Self {
        self.restitution = restitution.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_damping(mut self, damping: f32) -> Self {
        self.damping = damping.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_color(mut self, color: [f32; 3]) -> Self {
        self.color = color;
        self
    }

    #[must_use]
    pub const fn position(&self) -> Vec2 {
        self.position
    }

    #[must_use]
    pub const fn velocity(&self) -> Vec2 {
        self.velocity
    }

    #[must_use]
    pub const fn mass(&self) -> f32 {
        self.mass
    }

    #[must_use]
    pub const fn size(&self) -> f32 {
        self.size
    }

    #[must_use]
    pub const fn color(&self) -> [f32; 3] {
        self.color
    }

    #[must_use]
    pub const fn is_static(&self) -> bool {
        self.is_static
    }

    #[must_use]
    pub const fn restitution(&self) -> f32 {
        self.restitution
    }

    pub fn set_position(&mut self, position: Vec2) {
        self.position = position;
    }

    pub fn set_velocity(&mut self, velocity: Vec2) {
        self.velocity = velocity;
    }

    /// Replace the body's mass, rejecting non-positive values.
    pub fn set_mass(&mut self, mass: f32) -> Result<(), BodyError> {
        if !(mass.is_finite() && mass > 0.0) {
            return Err(BodyError::NonPositiveMass(mass));
        }
        self.mass = mass;
        Ok(())
    }

    /// Replace the body's collision size, rejecting negative values.
    pub fn set_size(&mut self, size: f32) -> Result<(), BodyError> {
        if !(size.is_finite() && size >= 0.0) {
            return Err(BodyError::NegativeSize(size));
        }
        self.size = size;
        Ok(())
    }

    /// Accumulate a force for the next integration step.
    ///
    /// This is the only force-accumulation entry point; gravity and agent
    /// movement both route through it.
    pub fn apply_force(&mut self, force: Vec2) {
        self.acceleration += force.scaled(1.0 / self.mass);
    }

    /// Advance one time step: integrate acceleration into velocity, damp,
    /// clamp speed by uniform rescale, advance and wrap the position, and
    /// reset the accumulator. Static bodies only reset their accumulator.
    pub fn integrate(&mut self, torus: Torus, dt: f32, max_velocity: f32) {
        if self.is_static {
            self.acceleration = Vec2::ZERO;
            return;
        }
        self.velocity += self.acceleration.scaled(dt);
        self.velocity = self.velocity.scaled(self.damping);
        let speed = self.velocity.magnitude();
        if speed > max_velocity {
            self.velocity = self.velocity.scaled(max_velocity / speed);
        }
        self.position = torus.wrap_point(self.position + self.velocity.scaled(dt));
        self.acceleration = Vec2::ZERO;
    }

    /// Gravitational pull this body feels toward `other`, softened at close
    /// range: `G·m₁·m₂ / max(d, 10)²` along the wrapped direction.
    #[must_use]
    pub fn gravity_toward(&self, other: &Body, torus: Torus, g: f32) -> Vec2 {
        let delta = torus.delta(self.position, other.position);
        let distance = delta.magnitude();
        if distance <= DIRECTION_EPSILON {
            return Vec2::ZERO;
        }
        let softened = distance.max(GRAVITY_SOFTENING);
        let magnitude = g * self.mass * other.mass / (softened * softened);
        delta.scaled(magnitude / distance)
    }
}

// ---------------------------------------------------------------------------
// Entity variants
// ---------------------------------------------------------------------------

/// Heritable numeric traits of a cell. Every field is perturbed on
/// reproduction by the evolve rate, which is itself inherited and mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellTraits {
    /// Magnitude of the steering force applied on sense ticks.
    pub movement_force: f32,
    /// Reach for eating; also drives the body's collision size and mass.
    pub eating_distance: f32,
    /// Mutation intensity applied to offspring traits.
    pub evolve_rate: f32,
    /// Energy level above which the cell reproduces (clamped to world bounds).
    pub reproduction_threshold: f32,
    /// Accumulated stomach waste magnitude that triggers expulsion.
    pub waste_threshold: f32,
}

impl Default for CellTraits {
    fn default() -> Self {
        Self {
            movement_force: 40.0,
            eating_distance: 12.0,
            evolve_rate: 0.1,
            reproduction_threshold: 600.0,
            waste_threshold: 30.0,
        }
    }
}

impl CellTraits {
    /// Apply the domain clamps that are part of the trait contract.
    ///
    /// Only the reproduction threshold is deliberately clamped; other traits
    /// drifting out of range kill the cell instead (see cell behavior).
    #[must_use]
    pub fn sanitized(mut self, config: &WorldConfig) -> Self {
        self.reproduction_threshold = self.reproduction_threshold.clamp(
            config.reproduction_threshold_min,
            config.reproduction_threshold_max,
        );
        self
    }
}

/// Mutable per-cell state beyond the shared body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellState {
    /// Stored energy; death at or below the configured floor. Never negative.
    pub energy: f32,
    /// Ticks alive.
    pub age: u64,
    pub traits: CellTraits,
    /// Food-preference identity, same space as food signatures.
    pub preference: Signature,
    /// Identity-space accumulator of indigestible remainder (inverted flavors).
    pub stomach_waste: Vec2,
    /// Total remainder mass behind `stomach_waste`, for averaging on expulsion.
    pub stomach_total: f32,
    /// This cell's registration in the repulsion field.
    #[serde(skip)]
    pub(crate) source: Option<SourceId>,
}

impl CellState {
    #[must_use]
    pub fn new(energy: f32, traits: CellTraits, preference: Signature) -> Self {
        Self {
            energy: energy.max(0.0),
            age: 0,
            traits,
            preference,
            stomach_waste: Vec2::ZERO,
            stomach_total: 0.0,
            source: None,
        }
    }
}

/// Per-food state beyond the shared body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoodState {
    /// Energy transferred to an eater at perfect chemical compatibility.
    pub nutrition: f32,
    /// Chemical identity of this particle.
    pub signature: Signature,
    /// Waste particles additionally damage nearby cells each tick.
    pub is_waste: bool,
    /// This particle's registration in the food field.
    #[serde(skip)]
    pub(crate) source: Option<SourceId>,
}

impl FoodState {
    #[must_use]
    pub fn new(nutrition: f32, signature: Signature, is_waste: bool) -> Self {
        Self {
            nutrition: nutrition.max(0.0),
            signature,
            is_waste,
            source: None,
        }
    }
}

/// Tagged union of entity variants sharing [`Body`] physics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntityKind {
    Cell(CellState),
    Food(FoodState),
    Barrier,
}

/// A simulated entity: shared physics plus variant state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub body: Body,
    pub kind: EntityKind,
}

impl Entity {
    /// Build a cell entity. Size and mass derive from the eating distance.
    pub fn cell(
        position: Vec2,
        velocity: Vec2,
        energy: f32,
        traits: CellTraits,
        preference: Signature,
        config: &WorldConfig,
    ) -> Result<Self, BodyError> {
        let traits = traits.sanitized(config);
        let size = traits.eating_distance;
        let body = Body::new(position, size * config.cell_mass_per_size, size)?
            .with_velocity(velocity)
            .with_damping(config.cell_damping)
            .with_restitution(config.cell_restitution)
            .with_color([preference.u, 0.35, preference.v]);
        Ok(Self {
            body,
            kind: EntityKind::Cell(CellState::new(energy, traits, preference)),
        })
    }

    /// Build a food particle.
    pub fn food(
        position: Vec2,
        nutrition: f32,
        signature: Signature,
        is_waste: bool,
        config: &WorldConfig,
    ) -> Result<Self, BodyError> {
        let color = if is_waste {
            [0.45, 0.35, 0.2]
        } else {
            [0.25, 0.8, signature.u]
        };
        let body = Body::new(position, config.food_mass, config.food_size)?
            .with_damping(config.food_damping)
            .with_restitution(config.food_restitution)
            .with_color(color);
        Ok(Self {
            body,
            kind: EntityKind::Food(FoodState::new(nutrition, signature, is_waste)),
        })
    }

    /// Build an inert static body (obstacle).
    pub fn barrier(position: Vec2, mass: f32, size: f32) -> Result<Self, BodyError> {
        let body = Body::new(position, mass, size)?
            .with_static(true)
            .with_color([0.4, 0.4, 0.45]);
        Ok(Self {
            body,
            kind: EntityKind::Barrier,
        })
    }

    #[must_use]
    pub const fn is_cell(&self) -> bool {
        matches!(self.kind, EntityKind::Cell(_))
    }

    #[must_use]
    pub const fn is_food(&self) -> bool {
        matches!(self.kind, EntityKind::Food(_))
    }

    #[must_use]
    pub const fn as_cell(&self) -> Option<&CellState> {
        match &self.kind {
            EntityKind::Cell(cell) => Some(cell),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_food(&self) -> Option<&FoodState> {
        match &self.kind {
            EntityKind::Food(food) => Some(food),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Static configuration for a Petri world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Width of the world in world units.
    pub world_width: f32,
    /// Height of the world in world units.
    pub world_height: f32,
    /// Bucket edge length for the entity spatial hash and both signal fields.
    pub grid_cell_size: f32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,

    /// Requested integration time step; clamped into the bounds below.
    pub time_step: f32,
    pub min_time_step: f32,
    pub max_time_step: f32,
    /// Speed cap enforced by uniform velocity rescale.
    pub max_velocity: f32,

    /// Whether the collision phase runs at all.
    pub collisions_enabled: bool,
    /// Settling passes per tick for overlap chains.
    pub collision_iterations: u32,

    /// Pairwise gravity is opt-in; it is restricted to `gravity_radius`.
    pub gravity_enabled: bool,
    pub gravity_constant: f32,
    pub gravity_radius: f32,

    /// Food channel: influence radius and falloff exponent.
    pub food_field_radius: f32,
    pub food_field_falloff: f32,
    /// Cell-repulsion channel: influence radius and falloff exponent.
    pub cell_field_radius: f32,
    pub cell_field_falloff: f32,
    /// Emission strength of every cell's repulsion source.
    pub cell_source_strength: f32,
    /// Food source strength per unit of nutrition.
    pub food_source_strength: f32,

    /// Cells re-sample the fields every `sense_interval` ticks.
    pub sense_interval: u32,
    pub food_attraction_weight: f32,
    pub cell_repulsion_weight: f32,
    /// Minimum chemical affinity before a food source is even considered.
    pub compatibility_floor: f32,
    /// Energy cost per unit of applied movement force.
    pub movement_energy_cost: f32,

    /// Baseline energy drain per tick.
    pub metabolism_cost: f32,
    /// A cell at or below this energy dies.
    pub energy_death_floor: f32,

    /// Valid eating-distance range; drifting outside it is lethal.
    pub eating_distance_min: f32,
    pub eating_distance_max: f32,
    /// Body mass per unit of collision size for cells.
    pub cell_mass_per_size: f32,
    pub cell_damping: f32,
    pub cell_restitution: f32,
    pub food_mass: f32,
    pub food_size: f32,
    pub food_damping: f32,
    pub food_restitution: f32,

    /// Flat energy cost of expelling accumulated waste.
    pub waste_expulsion_cost: f32,
    /// Fraction of accumulated remainder that becomes the waste particle's nutrition.
    pub waste_nutrition_factor: f32,
    /// Energy drained from each cell near a waste particle, per tick.
    pub waste_damage: f32,
    pub waste_damage_radius: f32,

    /// Clamp bounds for the heritable reproduction threshold.
    pub reproduction_threshold_min: f32,
    pub reproduction_threshold_max: f32,
    /// Energy the parent pays per offspring.
    pub reproduction_cost: f32,
    /// Fraction of that cost the offspring starts with.
    pub offspring_energy_share: f32,
    /// Initial speed of the offspring, directed away from the parent.
    pub offspring_speed: f32,
    /// Clamp bounds for the heritable evolve rate.
    pub evolve_rate_min: f32,
    pub evolve_rate_max: f32,

    /// Fraction of a dead cell's energy deposited as inverted-identity food.
    pub death_food_fraction: f32,

    /// Consecutive zero-cell ticks before the scene is rebuilt; 0 disables.
    pub extinction_reset_ticks: u32,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            world_width: 1_000.0,
            world_height: 1_000.0,
            grid_cell_size: 50.0,
            rng_seed: None,
            time_step: 1.0,
            min_time_step: 0.01,
            max_time_step: 2.0,
            max_velocity: 25.0,
            collisions_enabled: true,
            collision_iterations: 3,
            gravity_enabled: false,
            gravity_constant: 6.674,
            gravity_radius: 200.0,
            food_field_radius: 300.0,
            food_field_falloff: 2.0,
            cell_field_radius: 140.0,
            cell_field_falloff: 2.0,
            cell_source_strength: 60.0,
            food_source_strength: 1.0,
            sense_interval: 4,
            food_attraction_weight: 1.0,
            cell_repulsion_weight: 0.6,
            compatibility_floor: 0.35,
            movement_energy_cost: 0.02,
            metabolism_cost: 0.5,
            energy_death_floor: 2.0,
            eating_distance_min: 2.0,
            eating_distance_max: 60.0,
            cell_mass_per_size: 0.5,
            cell_damping: 0.92,
            cell_restitution: 0.3,
            food_mass: 1.0,
            food_size: 4.0,
            food_damping: 0.98,
            food_restitution: 0.6,
            waste_expulsion_cost: 5.0,
            waste_nutrition_factor: 0.5,
            waste_damage: 0.8,
            waste_damage_radius: 40.0,
            reproduction_threshold_min: 150.0,
            reproduction_threshold_max: 5_000.0,
            reproduction_cost: 120.0,
            offspring_energy_share: 0.75,
            offspring_speed: 3.0,
            evolve_rate_min: 0.01,
            evolve_rate_max: 0.5,
            death_food_fraction: 0.5,
            extinction_reset_ticks: 120,
            history_capacity: 256,
        }
    }
}

impl WorldConfig {
    /// Validate every invariant the world relies on.
    pub fn validate(&self) -> Result<(), WorldError> {
        if !(self.world_width.is_finite() && self.world_width > 0.0)
            || !(self.world_height.is_finite() && self.world_height > 0.0)
        {
            return Err(WorldError::InvalidConfig("world extents must be positive"));
        }
        if !(self.grid_cell_size.is_finite() && self.grid_cell_size > 0.0) {
            return Err(WorldError::InvalidConfig("grid_cell_size must be positive"));
        }
        if !(self.min_time_step > 0.0 && self.min_time_step <= self.max_time_step) {
            return Err(WorldError::InvalidConfig(
                "time step bounds must satisfy 0 < min <= max",
            ));
        }
        if self.max_velocity <= 0.0 {
            return Err(WorldError::InvalidConfig("max_velocity must be positive"));
        }
        if self.collision_iterations == 0 {
            return Err(WorldError::InvalidConfig(
                "collision_iterations must be at least 1",
            ));
        }
        if self.gravity_constant < 0.0 || self.gravity_radius <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "gravity constant must be non-negative and radius positive",
            ));
        }
        if self.food_field_radius <= 0.0
            || self.cell_field_radius <= 0.0
            || self.food_field_falloff < 0.0
            || self.cell_field_falloff < 0.0
        {
            return Err(WorldError::InvalidConfig(
                "field radii must be positive and falloffs non-negative",
            ));
        }
        if self.cell_source_strength < 0.0 || self.food_source_strength < 0.0 {
            return Err(WorldError::InvalidConfig(
                "source strengths must be non-negative",
            ));
        }
        if self.sense_interval == 0 {
            return Err(WorldError::InvalidConfig("sense_interval must be at least 1"));
        }
        if self.food_attraction_weight < 0.0 || self.cell_repulsion_weight < 0.0 {
            return Err(WorldError::InvalidConfig(
                "channel weights must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.compatibility_floor) {
            return Err(WorldError::InvalidConfig(
                "compatibility_floor must be in [0, 1]",
            ));
        }
        if self.movement_energy_cost < 0.0
            || self.metabolism_cost < 0.0
            || self.energy_death_floor < 0.0
        {
            return Err(WorldError::InvalidConfig(
                "metabolism parameters must be non-negative",
            ));
        }
        if !(self.eating_distance_min > 0.0
            && self.eating_distance_min <= self.eating_distance_max)
        {
            return Err(WorldError::InvalidConfig(
                "eating distance bounds must satisfy 0 < min <= max",
            ));
        }
        if self.cell_mass_per_size <= 0.0 || self.food_mass <= 0.0 || self.food_size < 0.0 {
            return Err(WorldError::InvalidConfig(
                "cell mass factor and food mass must be positive, food size non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.cell_damping)
            || !(0.0..=1.0).contains(&self.food_damping)
            || !(0.0..=1.0).contains(&self.cell_restitution)
            || !(0.0..=1.0).contains(&self.food_restitution)
        {
            return Err(WorldError::InvalidConfig(
                "damping and restitution must be in [0, 1]",
            ));
        }
        if self.waste_expulsion_cost < 0.0
            || self.waste_nutrition_factor < 0.0
            || self.waste_damage < 0.0
            || self.waste_damage_radius <= 0.0
        {
            return Err(WorldError::InvalidConfig(
                "waste parameters must be non-negative, radius positive",
            ));
        }
        if !(self.reproduction_threshold_min > 0.0
            && self.reproduction_threshold_min <= self.reproduction_threshold_max)
        {
            return Err(WorldError::InvalidConfig(
                "reproduction threshold bounds must satisfy 0 < min <= max",
            ));
        }
        if self.reproduction_cost < 0.0
            || !(0.0..=1.0).contains(&self.offspring_energy_share)
            || self.offspring_speed < 0.0
        {
            return Err(WorldError::InvalidConfig(
                "reproduction parameters out of range",
            ));
        }
        if !(self.evolve_rate_min > 0.0 && self.evolve_rate_min <= self.evolve_rate_max) {
            return Err(WorldError::InvalidConfig(
                "evolve rate bounds must satisfy 0 < min <= max",
            ));
        }
        if !(0.0..=1.0).contains(&self.death_food_fraction) {
            return Err(WorldError::InvalidConfig(
                "death_food_fraction must be in [0, 1]",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "history_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Clamp a requested time step into the configured safe range.
    #[must_use]
    pub fn clamp_time_step(&self, dt: f32) -> f32 {
        if !dt.is_finite() {
            return self.min_time_step;
        }
        dt.clamp(self.min_time_step, self.max_time_step)
    }

    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tick summaries and scenes
// ---------------------------------------------------------------------------

/// Per-tick census pushed into the bounded history ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: u64,
    pub cells: usize,
    pub food: usize,
    pub births: usize,
    pub deaths: usize,
    pub total_energy: f32,
    pub average_energy: f32,
}

/// Scene-construction collaborator used for initial seeding and for the
/// automatic extinction reset.
///
/// Implementations queue entities through [`World::queue_addition`]; the
/// world commits them right after the build returns.
pub trait Scene {
    fn build(&mut self, world: &mut World);
}

/// Seeds cells and food uniformly over position and chemistry.
#[derive(Debug, Clone)]
pub struct UniformScene {
    pub cells: usize,
    pub food: usize,
    pub cell_energy: f32,
    pub food_nutrition: f32,
}

impl Default for UniformScene {
    fn default() -> Self {
        Self {
            cells: 40,
            food: 260,
            cell_energy: 400.0,
            food_nutrition: 120.0,
        }
    }
}

impl Scene for UniformScene {
    fn build(&mut self, world: &mut World) {
        let config = world.config().clone();
        for _ in 0..self.cells {
            let position = world.random_position();
            let preference = world.random_signature();
            if let Ok(cell) = Entity::cell(
                position,
                Vec2::ZERO,
                self.cell_energy,
                CellTraits::default(),
                preference,
                &config,
            ) {
                world.queue_addition(cell);
            }
        }
        for _ in 0..self.food {
            let position = world.random_position();
            let signature = world.random_signature();
            let nutrition = self.food_nutrition * world.rng().random_range(0.5..1.5);
            if let Ok(food) = Entity::food(position, nutrition, signature, false, &config) {
                world.queue_addition(food);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The simulation orchestrator.
///
/// Owns the entity arena, the spatial hash, both signal fields, the RNG, and
/// the deferred add/remove queues. All cross-entity effects flow through
/// world-mediated queries; entities never touch each other's state directly.
pub struct World {
    config: WorldConfig,
    torus: Torus,
    tick: u64,
    paused: bool,
    time_step: f32,
    rng: SmallRng,
    entities: SlotMap<EntityId, Entity>,
    grid: TorusGrid<EntityId>,
    food_field: SignalField,
    cell_field: SignalField,
    pending_spawns: Vec<Entity>,
    pending_removals: Vec<EntityId>,
    eaten: HashSet<EntityId>,
    scene: Option<Box<dyn Scene>>,
    extinction_ticks: u32,
    last_births: usize,
    last_deaths: usize,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("tick", &self.tick)
            .field("paused", &self.paused)
            .field("entity_count", &self.entities.len())
            .field("pending_spawns", &self.pending_spawns.len())
            .field("pending_removals", &self.pending_removals.len())
            .finish()
    }
}

impl World {
    /// Instantiate a new world from a validated configuration.
    pub fn new(config: WorldConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let torus = Torus::new(config.world_width, config.world_height);
        let grid = TorusGrid::new(config.grid_cell_size, torus.width, torus.height)?;
        let food_field = SignalField::new(
            torus,
            config.grid_cell_size,
            config.food_field_radius,
            config.food_field_falloff,
        )?;
        let cell_field = SignalField::new(
            torus,
            config.grid_cell_size,
            config.cell_field_radius,
            config.cell_field_falloff,
        )?;
        let rng = config.seeded_rng();
        let time_step = config.clamp_time_step(config.time_step);
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            torus,
            tick: 0,
            paused: false,
            time_step,
            rng,
            entities: SlotMap::with_key(),
            grid,
            food_field,
            cell_field,
            pending_spawns: Vec::new(),
            pending_removals: Vec::new(),
            eaten: HashSet::new(),
            scene: None,
            extinction_ticks: 0,
            last_births: 0,
            last_deaths: 0,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    // -- accessors ---------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    #[must_use]
    pub const fn torus(&self) -> Torus {
        self.torus
    }

    /// Ticks processed since boot (or since the last extinction reset).
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    #[must_use]
    pub const fn time_step(&self) -> f32 {
        self.time_step
    }

    /// Adjust the integration time step, clamped to the configured range.
    pub fn set_time_step(&mut self, dt: f32) {
        self.time_step = self.config.clamp_time_step(dt);
    }

    /// Borrow the world RNG mutably for deterministic spawn helpers.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Read-only iteration over current entities.
    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.entities.iter()
    }

    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    #[must_use]
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.entities.values().filter(|e| e.is_cell()).count()
    }

    #[must_use]
    pub fn food_count(&self) -> usize {
        self.entities.values().filter(|e| e.is_food()).count()
    }

    /// The food-attraction signal channel, e.g. for visualization sampling.
    #[must_use]
    pub fn food_field(&self) -> &SignalField {
        &self.food_field
    }

    /// The cell-repulsion signal channel.
    #[must_use]
    pub fn cell_field(&self) -> &SignalField {
        &self.cell_field
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Install the scene-construction collaborator used for seeding and
    /// extinction recovery.
    pub fn set_scene(&mut self, scene: Box<dyn Scene>) {
        self.scene = Some(scene);
    }

    /// Rebuild the world contents from the installed scene and commit the
    /// queued spawns, zeroing the tick and extinction counters.
    pub fn rebuild_scene(&mut self) {
        let Some(mut scene) = self.scene.take() else {
            self.extinction_ticks = 0;
            return;
        };
        scene.build(self);
        self.scene = Some(scene);
        self.process_pending_changes();
        self.tick = 0;
        self.extinction_ticks = 0;
    }

    /// Uniformly random position inside the world.
    pub fn random_position(&mut self) -> Vec2 {
        Vec2::new(
            self.rng.random_range(0.0..self.torus.width),
            self.rng.random_range(0.0..self.torus.height),
        )
    }

    /// Uniformly random chemical signature.
    pub fn random_signature(&mut self) -> Signature {
        Signature::new(self.rng.random(), self.rng.random())
    }

    // -- neighborhood queries ---------------------------------------------

    /// Members of the spatial-hash bucket at `(cell_x, cell_y)` (wrapped).
    #[must_use]
    pub fn entities_in_cell(&self, cell_x: i64, cell_y: i64) -> Vec<EntityId> {
        self.grid.cell_members(cell_x, cell_y)
    }

    /// Entities within `radius` of `center`, nearest first, with distances.
    #[must_use]
    pub fn entities_within(&self, center: Vec2, radius: f32) -> Vec<(EntityId, f32)> {
        let mut hits: Vec<(EntityId, OrderedFloat<f32>)> = Vec::new();
        self.grid
            .for_each_within(center.x, center.y, radius, &mut |id, dist_sq| {
                hits.push((id, dist_sq));
            });
        hits.sort_by_key(|&(_, dist_sq)| dist_sq);
        hits.into_iter()
            .map(|(id, dist_sq)| (id, dist_sq.into_inner().sqrt()))
            .collect()
    }

    /// The entity nearest to `at` within `radius`, e.g. for a screen pick.
    #[must_use]
    pub fn nearest_entity(&self, at: Vec2, radius: f32) -> Option<EntityId> {
        self.entities_within(at, radius)
            .first()
            .map(|&(id, _)| id)
    }

    // -- deferred mutation -------------------------------------------------

    /// Request an entity spawn; honored at the next tick boundary.
    ///
    /// This is the only mutation path available to entities and external
    /// callers during a tick.
    pub fn queue_addition(&mut self, entity: Entity) {
        self.pending_spawns.push(entity);
    }

    /// Request an entity's destruction; honored at the next tick boundary.
    pub fn queue_removal(&mut self, id: EntityId) {
        self.pending_removals.push(id);
    }

    /// Commit all queued additions, then removals, firing the lifecycle
    /// hooks (spatial-hash and gradient-source registration). Runs once per
    /// tick boundary, never mid-tick.
    pub fn process_pending_changes(&mut self) {
        let spawns = std::mem::take(&mut self.pending_spawns);
        for entity in spawns {
            let is_cell = entity.is_cell();
            self.insert_entity(entity);
            if is_cell {
                self.last_births += 1;
            }
        }
        let removals = std::mem::take(&mut self.pending_removals);
        let mut seen = HashSet::new();
        for id in removals {
            if !seen.insert(id) {
                continue;
            }
            if self.remove_entity(id).is_some_and(|e| e.is_cell()) {
                self.last_deaths += 1;
            }
        }
    }

    /// Immediate insertion; used internally when committing queued spawns.
    fn insert_entity(&mut self, mut entity: Entity) -> EntityId {
        let position = self.torus.wrap_point(entity.body.position());
        entity.body.set_position(position);
        let id = self.entities.insert(entity);
        self.grid.insert(id, position.x, position.y);
        match &mut self.entities[id].kind {
            EntityKind::Cell(cell) => {
                let source = self.cell_field.add_source(GradientSource {
                    position,
                    strength: self.config.cell_source_strength,
                    signature: cell.preference,
                    owner: Some(id),
                });
                cell.source = Some(source);
            }
            EntityKind::Food(food) => {
                let source = self.food_field.add_source(GradientSource {
                    position,
                    strength: food.nutrition * self.config.food_source_strength,
                    signature: food.signature,
                    owner: Some(id),
                });
                food.source = Some(source);
            }
            EntityKind::Barrier => {}
        }
        id
    }

    fn remove_entity(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(id)?;
        self.grid.remove(id);
        match &entity.kind {
            EntityKind::Cell(cell) => {
                if let Some(source) = cell.source {
                    self.cell_field.remove_source(source);
                }
            }
            EntityKind::Food(food) => {
                if let Some(source) = food.source {
                    self.food_field.remove_source(source);
                }
            }
            EntityKind::Barrier => {}
        }
        Some(entity)
    }

    // -- tick pipeline -----------------------------------------------------

    /// Advance one tick. A paused world is a no-op.
    pub fn update(&mut self) {
        if self.paused {
            return;
        }
        self.tick += 1;
        self.eaten.clear();
        if self.config.gravity_enabled {
            self.stage_gravity();
        }
        self.stage_entities();
        if self.config.collisions_enabled {
            self.stage_collisions();
        }
        self.process_pending_changes();
        self.stage_summary();
        self.stage_extinction();
    }

    /// Opt-in neighbor-limited gravity; forces integrate this same tick.
    fn stage_gravity(&mut self) {
        let g = self.config.gravity_constant;
        let radius = self.config.gravity_radius;
        let torus = self.torus;
        let mut forces: Vec<(EntityId, Vec2)> = Vec::new();
        let entities = &self.entities;
        for (id, entity) in entities {
            if entity.body.is_static() {
                continue;
            }
            let position = entity.body.position();
            let mut total = Vec2::ZERO;
            self.grid
                .for_each_within(position.x, position.y, radius, &mut |other, _| {
                    if other == id {
                        return;
                    }
                    if let Some(neighbor) = entities.get(other) {
                        total += entity.body.gravity_toward(&neighbor.body, torus, g);
                    }
                });
            if total != Vec2::ZERO {
                forces.push((id, total));
            }
        }
        for (id, force) in forces {
            if let Some(entity) = self.entities.get_mut(id) {
                entity.body.apply_force(force);
            }
        }
    }

    /// Integrate every entity over a stable snapshot of handles, repairing
    /// its spatial-hash bucket, then run its per-variant behavior hook.
    ///
    /// The hash is repaired incrementally, so behaviors running later in the
    /// pass can observe already-integrated positions of earlier entities.
    fn stage_entities(&mut self) {
        let dt = self.time_step;
        let torus = self.torus;
        let max_velocity = self.config.max_velocity;
        let ids: Vec<EntityId> = self.entities.keys().collect();
        for id in ids {
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            entity.body.integrate(torus, dt, max_velocity);
            let position = entity.body.position();
            let is_cell = entity.is_cell();
            let is_waste = matches!(&entity.kind, EntityKind::Food(food) if food.is_waste);
            self.grid.relocate(id, position.x, position.y);
            if is_cell {
                self.update_cell(id);
            } else if is_waste {
                self.update_waste(id);
            }
        }
    }

    /// Waste particles leach energy from every cell in range, each tick.
    fn update_waste(&mut self, id: EntityId) {
        let damage = self.config.waste_damage;
        if damage <= 0.0 {
            return;
        }
        let radius = self.config.waste_damage_radius;
        let Some(position) = self.entities.get(id).map(|e| e.body.position()) else {
            return;
        };
        let mut victims: Vec<EntityId> = Vec::new();
        {
            let entities = &self.entities;
            self.grid
                .for_each_within(position.x, position.y, radius, &mut |other, _| {
                    if other != id
                        && entities.get(other).is_some_and(Entity::is_cell)
                    {
                        victims.push(other);
                    }
                });
        }
        for victim in victims {
            if let Some(EntityKind::Cell(cell)) =
                self.entities.get_mut(victim).map(|e| &mut e.kind)
            {
                cell.energy = (cell.energy - damage).max(0.0);
            }
        }
    }

    /// One cell's per-tick behavior, always in this order: metabolize,
    /// refresh the repulsion source, expel waste, steer, eat, reproduce.
    fn update_cell(&mut self, id: EntityId) {
        let metabolism = self.config.metabolism_cost;
        let floor = self.config.energy_death_floor;

        let (position, traits, preference, energy, source) = {
            let Some(entity) = self.entities.get_mut(id) else {
                return;
            };
            let position = entity.body.position();
            let EntityKind::Cell(cell) = &mut entity.kind else {
                return;
            };
            cell.age += 1;
            cell.energy = (cell.energy - metabolism).max(0.0);
            (position, cell.traits, cell.preference, cell.energy, cell.source)
        };

        if energy <= floor {
            self.kill_cell(id);
            return;
        }
        // Runaway mutation guard: a degenerate reach is lethal.
        if traits.eating_distance < self.config.eating_distance_min
            || traits.eating_distance > self.config.eating_distance_max
        {
            self.kill_cell(id);
            return;
        }

        if let Some(source) = source {
            self.cell_field.update_position(source, position);
        }

        self.expel_waste(id, position);

        if self.tick % u64::from(self.config.sense_interval.max(1)) == 0 {
            self.steer_cell(id, position, preference, traits.movement_force);
        }

        self.try_eat(id, position, preference, traits.eating_distance);
        self.try_reproduce(id);
    }

    /// Starvation or invariant death: queue removal and deposit part of the
    /// remaining energy as an inverted-identity food particle.
    fn kill_cell(&mut self, id: EntityId) {
        let Some(entity) = self.entities.get(id) else {
            return;
        };
        let EntityKind::Cell(cell) = &entity.kind else {
            return;
        };
        let position = entity.body.position();
        let signature = cell.preference.inverted();
        let nutrition = cell.energy * self.config.death_food_fraction;
        self.queue_removal(id);
        if nutrition > f32::EPSILON
            && let Ok(food) = Entity::food(position, nutrition, signature, false, &self.config)
        {
            self.queue_addition(food);
        }
    }

    /// Expel the stomach accumulator as a waste particle once it crosses the
    /// cell's threshold, paying the flat expulsion cost.
    fn expel_waste(&mut self, id: EntityId, position: Vec2) {
        let cost = self.config.waste_expulsion_cost;
        let factor = self.config.waste_nutrition_factor;
        let expelled = {
            let Some(EntityKind::Cell(cell)) = self.entities.get_mut(id).map(|e| &mut e.kind)
            else {
                return;
            };
            if cell.stomach_total <= 0.0
                || cell.stomach_waste.magnitude() < cell.traits.waste_threshold
            {
                return;
            }
            let signature = Signature::new(
                cell.stomach_waste.x / cell.stomach_total,
                cell.stomach_waste.y / cell.stomach_total,
            );
            let nutrition = cell.stomach_total * factor;
            cell.stomach_waste = Vec2::ZERO;
            cell.stomach_total = 0.0;
            cell.energy = (cell.energy - cost).max(0.0);
            (signature, nutrition)
        };
        let (signature, nutrition) = expelled;
        if let Ok(waste) = Entity::food(position, nutrition, signature, true, &self.config) {
            self.queue_addition(waste);
        }
    }

    /// Blend food attraction against same-kind repulsion and push that way.
    fn steer_cell(
        &mut self,
        id: EntityId,
        position: Vec2,
        preference: Signature,
        movement_force: f32,
    ) {
        let direction = self.movement_direction(id, position, preference);
        if direction == Vec2::ZERO {
            return;
        }
        let cost = movement_force * self.config.movement_energy_cost;
        let Some(entity) = self.entities.get_mut(id) else {
            return;
        };
        entity.body.apply_force(direction.scaled(movement_force));
        if let EntityKind::Cell(cell) = &mut entity.kind {
            cell.energy = (cell.energy - cost).max(0.0);
        }
    }

    /// Aggregate sampler over both channels: compatible food attracts, other
    /// cells repel. Chemically incompatible food is filtered out before any
    /// falloff math is spent on it.
    fn movement_direction(&self, id: EntityId, at: Vec2, preference: Signature) -> Vec2 {
        let floor = self.config.compatibility_floor;
        let food = self
            .food_field
            .sample_filtered(at, |source| preference.affinity(source.signature) >= floor);
        let cells = self
            .cell_field
            .sample_filtered(at, |source| source.owner != Some(id));
        let pull = food
            .direction
            .scaled(food.strength * self.config.food_attraction_weight);
        let push = cells
            .direction
            .scaled(cells.strength * self.config.cell_repulsion_weight);
        (pull - push).normalized()
    }

    /// Consume at most one compatible food particle within reach: the
    /// nearest one. Energy gain scales with chemical affinity; the remainder
    /// lands in the stomach accumulator with inverted identity.
    fn try_eat(&mut self, id: EntityId, position: Vec2, preference: Signature, reach: f32) {
        let floor = self.config.compatibility_floor;
        let mut best: Option<(EntityId, f32)> = None;
        {
            let entities = &self.entities;
            let eaten = &self.eaten;
            self.grid
                .for_each_within(position.x, position.y, reach, &mut |other, dist_sq| {
                    if other == id || eaten.contains(&other) {
                        return;
                    }
                    let Some(entity) = entities.get(other) else { return };
                    let EntityKind::Food(food) = &entity.kind else { return };
                    if preference.affinity(food.signature) < floor {
                        return;
                    }
                    let dist_sq = dist_sq.into_inner();
                    if best.is_none_or(|(_, nearest)| dist_sq < nearest) {
                        best = Some((other, dist_sq));
                    }
                });
        }
        let Some((food_id, _)) = best else { return };
        let Some(EntityKind::Food(food)) = self.entities.get(food_id).map(|e| &e.kind) else {
            return;
        };
        let nutrition = food.nutrition;
        let inverted = food.signature.inverted();
        let efficiency = preference.affinity(food.signature);
        self.eaten.insert(food_id);
        self.queue_removal(food_id);
        if let Some(EntityKind::Cell(cell)) = self.entities.get_mut(id).map(|e| &mut e.kind) {
            cell.energy += nutrition * efficiency;
            let remainder = nutrition * (1.0 - efficiency);
            if remainder > 0.0 {
                cell.stomach_waste += Vec2::new(inverted.u, inverted.v).scaled(remainder);
                cell.stomach_total += remainder;
            }
        }
    }

    /// Above the (clamped) threshold: pay the fixed cost and queue a mutated
    /// offspring just outside the parent's radius, moving away from it.
    fn try_reproduce(&mut self, id: EntityId) {
        let cost = self.config.reproduction_cost;
        let (position, size, traits, preference, ready) = {
            let Some(entity) = self.entities.get(id) else { return };
            let EntityKind::Cell(cell) = &entity.kind else { return };
            (
                entity.body.position(),
                entity.body.size(),
                cell.traits,
                cell.preference,
                cell.energy > cell.traits.reproduction_threshold,
            )
        };
        if !ready {
            return;
        }
        if let Some(EntityKind::Cell(cell)) = self.entities.get_mut(id).map(|e| &mut e.kind) {
            cell.energy = (cell.energy - cost).max(0.0);
        }
        let child_traits = self.mutate_traits(traits);
        let child_preference = self.mutate_signature(preference, child_traits.evolve_rate);
        if child_traits.eating_distance <= 0.0 {
            // Mutated beyond any viable body; the lineage ends here.
            return;
        }
        let angle = self.rng.random_range(0.0..TAU);
        let offset = (size + child_traits.eating_distance) * 0.5 + 1.0;
        let child_position = self.torus.wrap_point(position + Vec2::from_polar(angle, offset));
        let velocity = Vec2::from_polar(angle, self.config.offspring_speed);
        let energy = cost * self.config.offspring_energy_share;
        if let Ok(child) = Entity::cell(
            child_position,
            velocity,
            energy,
            child_traits,
            child_preference,
            &self.config,
        ) {
            self.queue_addition(child);
        }
    }

    /// Arc-cosine-shaped symmetric mutation factor: sign is uniform and the
    /// magnitude density peaks at zero, so small changes dominate.
    fn signed_mutation(&mut self, evolve_rate: f32) -> f32 {
        let u: f32 = self.rng.random();
        let magnitude = 1.0 - u.acos() * FRAC_2_PI;
        let sign = if self.rng.random_bool(0.5) { 1.0 } else { -1.0 };
        sign * evolve_rate * magnitude
    }

    fn mutate_scalar(&mut self, value: f32, evolve_rate: f32) -> f32 {
        value * (1.0 + self.signed_mutation(evolve_rate))
    }

    fn mutate_signature(&mut self, signature: Signature, evolve_rate: f32) -> Signature {
        let du = self.signed_mutation(evolve_rate) * 0.25;
        let dv = self.signed_mutation(evolve_rate) * 0.25;
        Signature::new(signature.u + du, signature.v + dv)
    }

    fn mutate_traits(&mut self, parent: CellTraits) -> CellTraits {
        let evolve_rate = self
            .mutate_scalar(parent.evolve_rate, parent.evolve_rate)
            .clamp(self.config.evolve_rate_min, self.config.evolve_rate_max);
        let traits = CellTraits {
            movement_force: self.mutate_scalar(parent.movement_force, evolve_rate).max(0.0),
            eating_distance: self.mutate_scalar(parent.eating_distance, evolve_rate),
            evolve_rate,
            reproduction_threshold: self
                .mutate_scalar(parent.reproduction_threshold, evolve_rate),
            waste_threshold: self.mutate_scalar(parent.waste_threshold, evolve_rate).max(1.0),
        };
        traits.sanitized(&self.config)
    }

    // -- collisions --------------------------------------------------------

    /// Settle overlaps: repeat up to the configured iteration count, stopping
    /// early once a full pass reports no collision.
    fn stage_collisions(&mut self) {
        let iterations = self.config.collision_iterations.max(1);
        for _ in 0..iterations {
            if !self.collision_pass() {
                break;
            }
        }
    }

    fn pair_key(a: EntityId, b: EntityId) -> (u64, u64) {
        let (a, b) = (a.data().as_ffi(), b.data().as_ffi());
        if a <= b { (a, b) } else { (b, a) }
    }

    /// One pass over all overlapping pairs; each unordered pair is resolved
    /// at most once per pass.
    fn collision_pass(&mut self) -> bool {
        let ids: Vec<EntityId> = self.entities.keys().collect();
        if ids.len() < 2 {
            return false;
        }
        let max_half = ids
            .iter()
            .filter_map(|&id| self.entities.get(id))
            .map(|e| e.body.size() * 0.5)
            .fold(0.0_f32, f32::max);
        let mut any = false;
        let mut seen: HashSet<(u64, u64)> = HashSet::new();
        for &id in &ids {
            let Some(entity) = self.entities.get(id) else {
                continue;
            };
            let position = entity.body.position();
            let reach = entity.body.size() * 0.5 + max_half;
            let mut candidates: Vec<EntityId> = Vec::new();
            self.grid
                .for_each_within(position.x, position.y, reach, &mut |other, _| {
                    if other != id {
                        candidates.push(other);
                    }
                });
            for other in candidates {
                if !seen.insert(Self::pair_key(id, other)) {
                    continue;
                }
                if self.resolve_pair(id, other) {
                    any = true;
                    if let Some(entity) = self.entities.get(id) {
                        let p = entity.body.position();
                        self.grid.relocate(id, p.x, p.y);
                    }
                    if let Some(entity) = self.entities.get(other) {
                        let p = entity.body.position();
                        self.grid.relocate(other, p.x, p.y);
                    }
                }
            }
        }
        any
    }

    /// Separate one overlapping pair and exchange the collision impulse.
    fn resolve_pair(&mut self, a: EntityId, b: EntityId) -> bool {
        let torus = self.torus;
        let Some([ea, eb]) = self.entities.get_disjoint_mut([a, b]) else {
            return false;
        };
        if ea.body.is_static() && eb.body.is_static() {
            return false;
        }
        let delta = torus.delta(ea.body.position(), eb.body.position());
        let distance = delta.magnitude();
        let min_distance = (ea.body.size() + eb.body.size()) * 0.5;
        if min_distance <= 0.0 || distance >= min_distance {
            return false;
        }

        let normal = if distance < DEGENERATE_DISTANCE {
            // Coincident centers: break the tie with a random direction.
            Vec2::from_polar(self.rng.random_range(0.0..TAU), 1.0)
        } else {
            delta.scaled(1.0 / distance)
        };

        let overlap = min_distance - distance;
        if eb.body.is_static() {
            let moved = ea.body.position() - normal.scaled(overlap);
            ea.body.set_position(torus.wrap_point(moved));
        } else if ea.body.is_static() {
            let moved = eb.body.position() + normal.scaled(overlap);
            eb.body.set_position(torus.wrap_point(moved));
        } else {
            // Split proportionally to the other body's mass: heavier moves less.
            let total = ea.body.mass() + eb.body.mass();
            let share_a = eb.body.mass() / total;
            let share_b = ea.body.mass() / total;
            let moved_a = ea.body.position() - normal.scaled(overlap * share_a);
            let moved_b = eb.body.position() + normal.scaled(overlap * share_b);
            ea.body.set_position(torus.wrap_point(moved_a));
            eb.body.set_position(torus.wrap_point(moved_b));
        }

        let relative = eb.body.velocity() - ea.body.velocity();
        let along = relative.dot(normal);
        if along < 0.0 {
            let restitution = (ea.body.restitution() + eb.body.restitution()) * 0.5;
            let inv_a = if ea.body.is_static() { 0.0 } else { 1.0 / ea.body.mass() };
            let inv_b = if eb.body.is_static() { 0.0 } else { 1.0 / eb.body.mass() };
            let impulse = -(1.0 + restitution) * along / (inv_a + inv_b);
            let va = ea.body.velocity() - normal.scaled(impulse * inv_a);
            let vb = eb.body.velocity() + normal.scaled(impulse * inv_b);
            ea.body.set_velocity(va);
            eb.body.set_velocity(vb);
        }
        true
    }

    // -- bookkeeping -------------------------------------------------------

    fn stage_summary(&mut self) {
        let mut cells = 0_usize;
        let mut food = 0_usize;
        let mut total_energy = 0.0_f32;
        for entity in self.entities.values() {
            match &entity.kind {
                EntityKind::Cell(cell) => {
                    cells += 1;
                    total_energy += cell.energy;
                }
                EntityKind::Food(_) => food += 1,
                EntityKind::Barrier => {}
            }
        }
        let average_energy = if cells > 0 {
            total_energy / cells as f32
        } else {
            0.0
        };
        let summary = TickSummary {
            tick: self.tick,
            cells,
            food,
            births: self.last_births,
            deaths: self.last_deaths,
            total_energy,
            average_energy,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        self.last_births = 0;
        self.last_deaths = 0;
    }

    /// Extinction recovery: after enough consecutive ticks with no living
    /// cells, rebuild the scene exactly once and restart the clock.
    fn stage_extinction(&mut self) {
        if self.config.extinction_reset_ticks == 0 {
            return;
        }
        if self.entities.values().any(Entity::is_cell) {
            self.extinction_ticks = 0;
            return;
        }
        self.extinction_ticks += 1;
        if self.extinction_ticks >= self.config.extinction_reset_ticks {
            self.rebuild_scene();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> WorldConfig {
        WorldConfig {
            world_width: 400.0,
            world_height: 400.0,
            grid_cell_size: 40.0,
            rng_seed: Some(42),
            extinction_reset_ticks: 0,
            ..WorldConfig::default()
        }
    }

    fn food_at(world: &World, x: f32, y: f32, signature: Signature, nutrition: f32) -> Entity {
        Entity::food(Vec2::new(x, y), nutrition, signature, false, world.config()).expect("food")
    }

    fn cell_at(world: &World, x: f32, y: f32, energy: f32) -> Entity {
        Entity::cell(
            Vec2::new(x, y),
            Vec2::ZERO,
            energy,
            CellTraits::default(),
            Signature::new(0.3, 0.7),
            world.config(),
        )
        .expect("cell")
    }

    #[test]
    fn vec2_polar_normalize_and_dot() {
        let v = Vec2::from_polar(0.0, 3.0);
        assert!((v.x - 3.0).abs() < 1e-6 && v.y.abs() < 1e-6);
        let unit = Vec2::new(0.0, -8.0).normalized();
        assert!((unit.magnitude() - 1.0).abs() < 1e-6);
        assert_eq!(Vec2::ZERO.normalized(), Vec2::ZERO);
        assert!((Vec2::new(1.0, 2.0).dot(Vec2::new(3.0, 4.0)) - 11.0).abs() < 1e-6);
    }

    #[test]
    fn torus_wraps_points_and_deltas() {
        let torus = Torus::new(100.0, 80.0);
        let wrapped = torus.wrap_point(Vec2::new(-10.0, 95.0));
        assert!((wrapped.x - 90.0).abs() < 1e-4);
        assert!((wrapped.y - 15.0).abs() < 1e-4);
        // Crossing the seam is shorter than crossing the middle.
        let d = torus.delta(Vec2::new(95.0, 40.0), Vec2::new(5.0, 40.0));
        assert!((d.x - 10.0).abs() < 1e-4 && d.y.abs() < 1e-4);
        assert!((torus.distance(Vec2::new(95.0, 40.0), Vec2::new(5.0, 40.0)) - 10.0).abs() < 1e-4);
    }

    #[test]
    fn signature_affinity_and_inversion() {
        let a = Signature::new(0.2, 0.9);
        assert!((a.affinity(a) - 1.0).abs() < 1e-6);
        let opposite = a.inverted();
        assert!(a.affinity(opposite) < 1e-6);
        // Inversion is an involution on the identity torus.
        let back = opposite.inverted();
        assert!((back.u - a.u).abs() < 1e-6 && (back.v - a.v).abs() < 1e-6);
        // Wrapping: 1.2 lands at 0.2.
        let wrapped = Signature::new(1.2, -0.1);
        assert!((wrapped.u - 0.2).abs() < 1e-6);
        assert!((wrapped.v - 0.9).abs() < 1e-6);
    }

    #[test]
    fn field_sample_applies_falloff_and_degenerates_gracefully() {
        let torus = Torus::new(200.0, 200.0);
        let mut field = SignalField::new(torus, 50.0, 100.0, 2.0).expect("field");
        field.add_source(GradientSource {
            position: Vec2::new(50.0, 50.0),
            strength: 100.0,
            signature: Signature::new(0.0, 0.0),
            owner: None,
        });

        let at_distance = field.sample(Vec2::new(60.0, 50.0));
        assert!((at_distance.strength - 81.0).abs() < 1e-3);
        assert!((at_distance.direction.x + 1.0).abs() < 1e-4);
        assert!(at_distance.direction.y.abs() < 1e-4);

        // Self-sample: full strength, no usable direction.
        let on_top = field.sample(Vec2::new(50.0, 50.0));
        assert!((on_top.strength - 100.0).abs() < 1e-3);
        assert_eq!(on_top.direction, Vec2::ZERO);

        // Out of range contributes nothing.
        let far = field.sample(Vec2::new(160.0, 160.0));
        assert_eq!(far, FieldSample::default());
    }

    #[test]
    fn field_sources_move_with_their_owner() {
        let torus = Torus::new(200.0, 200.0);
        let mut field = SignalField::new(torus, 50.0, 100.0, 1.0).expect("field");
        let id = field.add_source(GradientSource {
            position: Vec2::new(10.0, 10.0),
            strength: 50.0,
            signature: Signature::new(0.5, 0.5),
            owner: None,
        });
        field.update_position(id, Vec2::new(150.0, 150.0));
        assert_eq!(field.sample(Vec2::new(10.0, 10.0)).strength, 0.0);
        assert!(field.sample(Vec2::new(150.0, 150.0)).strength > 0.0);
        assert!(field.remove_source(id));
        assert!(!field.remove_source(id));
        assert!(field.is_empty());
    }

    #[test]
    fn filtered_sampling_skips_incompatible_sources() {
        let torus = Torus::new(200.0, 200.0);
        let mut field = SignalField::new(torus, 50.0, 100.0, 2.0).expect("field");
        field.add_source(GradientSource {
            position: Vec2::new(60.0, 50.0),
            strength: 100.0,
            signature: Signature::new(0.0, 0.0),
            owner: None,
        });
        let all = field.sample(Vec2::new(50.0, 50.0));
        let none = field.sample_filtered(Vec2::new(50.0, 50.0), |_| false);
        assert!(all.strength > 0.0);
        assert_eq!(none, FieldSample::default());
    }

    #[test]
    fn body_rejects_invalid_mass_and_size() {
        assert!(matches!(
            Body::new(Vec2::ZERO, 0.0, 1.0),
            Err(BodyError::NonPositiveMass(_))
        ));
        assert!(matches!(
            Body::new(Vec2::ZERO, -2.0, 1.0),
            Err(BodyError::NonPositiveMass(_))
        ));
        assert!(matches!(
            Body::new(Vec2::ZERO, 1.0, -1.0),
            Err(BodyError::NegativeSize(_))
        ));
        let mut body = Body::new(Vec2::ZERO, 1.0, 1.0).expect("body");
        assert_eq!(body.set_mass(0.0), Err(BodyError::NonPositiveMass(0.0)));
        assert_eq!(body.set_size(-0.5), Err(BodyError::NegativeSize(-0.5)));
        assert!(body.set_mass(2.0).is_ok());
        assert!((body.mass() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn integration_wraps_damps_and_clamps() {
        let torus = Torus::new(100.0, 100.0);
        let mut body = Body::new(Vec2::new(98.0, 50.0), 2.0, 1.0)
            .expect("body")
            .with_velocity(Vec2::new(4.0, 0.0))
            .with_damping(0.5);
        body.integrate(torus, 1.0, 100.0);
        // Damped to 2.0/s, wrapped across the right edge.
        assert!((body.velocity().x - 2.0).abs() < 1e-4);
        assert!(body.position().x < 1.0);

        let mut fast = Body::new(Vec2::ZERO, 1.0, 1.0)
            .expect("body")
            .with_velocity(Vec2::new(30.0, 40.0));
        fast.integrate(torus, 1.0, 10.0);
        assert!((fast.velocity().magnitude() - 10.0).abs() < 1e-3);
        // Uniform rescale keeps the heading.
        assert!((fast.velocity().x / fast.velocity().y - 0.75).abs() < 1e-4);
    }

    #[test]
    fn static_bodies_only_reset_their_accumulator() {
        let torus = Torus::new(100.0, 100.0);
        let mut body = Body::new(Vec2::new(10.0, 10.0), 5.0, 4.0)
            .expect("body")
            .with_static(true);
        body.apply_force(Vec2::new(100.0, 0.0));
        body.integrate(torus, 1.0, 50.0);
        assert_eq!(body.position(), Vec2::new(10.0, 10.0));
        assert_eq!(body.velocity(), Vec2::ZERO);
        assert_eq!(body.acceleration, Vec2::ZERO);
    }

    #[test]
    fn apply_force_scales_by_mass() {
        let mut body = Body::new(Vec2::ZERO, 4.0, 1.0).expect("body");
        body.apply_force(Vec2::new(8.0, 0.0));
        assert!((body.acceleration.x - 2.0).abs() < 1e-6);
    }

    #[test]
    fn gravity_is_softened_and_directed() {
        let torus = Torus::new(1_000.0, 1_000.0);
        let a = Body::new(Vec2::new(100.0, 100.0), 10.0, 1.0).expect("a");
        let b = Body::new(Vec2::new(103.0, 100.0), 20.0, 1.0).expect("b");
        let pull = a.gravity_toward(&b, torus, 1.0);
        // Distance 3 is softened to 10: 1 * 10 * 20 / 100.
        assert!((pull.x - 2.0).abs() < 1e-4);
        assert!(pull.y.abs() < 1e-6);
    }

    #[test]
    fn default_config_validates() {
        assert!(WorldConfig::default().validate().is_ok());
    }

    #[test]
    fn config_rejects_bad_values() {
        let mut config = WorldConfig::default();
        config.world_width = 0.0;
        assert!(config.validate().is_err());

        let mut config = WorldConfig::default();
        config.collision_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = WorldConfig::default();
        config.reproduction_threshold_min = 500.0;
        config.reproduction_threshold_max = 100.0;
        assert!(config.validate().is_err());

        let mut config = WorldConfig::default();
        config.eating_distance_min = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn time_step_is_clamped() {
        let mut world = World::new(test_config()).expect("world");
        world.set_time_step(100.0);
        assert!((world.time_step() - world.config().max_time_step).abs() < 1e-6);
        world.set_time_step(0.0);
        assert!((world.time_step() - world.config().min_time_step).abs() < 1e-6);
        world.set_time_step(f32::NAN);
        assert!((world.time_step() - world.config().min_time_step).abs() < 1e-6);
    }

    #[test]
    fn paused_world_does_nothing() {
        let mut world = World::new(test_config()).expect("world");
        let food = food_at(&world, 50.0, 50.0, Signature::new(0.1, 0.1), 10.0);
        world.queue_addition(food);
        world.process_pending_changes();
        world.set_paused(true);
        world.update();
        assert_eq!(world.tick(), 0);
        assert!(world.history().next().is_none());
        world.set_paused(false);
        world.update();
        assert_eq!(world.tick(), 1);
    }

    #[test]
    fn queued_changes_commit_only_at_tick_boundary() {
        let mut world = World::new(test_config()).expect("world");
        for i in 0..4 {
            let food = food_at(
                &world,
                40.0 * i as f32,
                40.0,
                Signature::new(0.9, 0.9),
                10.0,
            );
            world.queue_addition(food);
        }
        assert_eq!(world.entity_count(), 0, "additions are deferred");
        world.process_pending_changes();
        assert_eq!(world.entity_count(), 4);

        let victim = world.entities().next().map(|(id, _)| id).expect("victim");
        world.queue_removal(victim);
        world.queue_removal(victim); // double removal is harmless
        assert_eq!(world.entity_count(), 4, "removals are deferred");
        world.process_pending_changes();
        assert_eq!(world.entity_count(), 3);
        assert!(world.entity(victim).is_none());
    }

    #[test]
    fn committed_entities_are_registered_in_hash_and_fields() {
        let mut world = World::new(test_config()).expect("world");
        let food = food_at(&world, 100.0, 100.0, Signature::new(0.5, 0.5), 80.0);
        let cell = cell_at(&world, 300.0, 300.0, 400.0);
        world.queue_addition(food);
        world.queue_addition(cell);
        world.process_pending_changes();

        assert_eq!(world.food_field().len(), 1);
        assert_eq!(world.cell_field().len(), 1);
        assert!(world.food_field().sample(Vec2::new(110.0, 100.0)).strength > 0.0);

        let near_food = world
            .nearest_entity(Vec2::new(101.0, 101.0), 30.0)
            .expect("pick");
        assert!(world.entity(near_food).expect("entity").is_food());

        let ids: Vec<EntityId> = world.entities().map(|(id, _)| id).collect();
        for id in ids {
            world.queue_removal(id);
        }
        world.process_pending_changes();
        assert!(world.food_field().is_empty());
        assert!(world.cell_field().is_empty());
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn reproduction_threshold_is_clamped_on_construction() {
        let world = World::new(test_config()).expect("world");
        let low = CellTraits {
            reproduction_threshold: 10.0,
            ..CellTraits::default()
        };
        let entity = Entity::cell(
            Vec2::ZERO,
            Vec2::ZERO,
            100.0,
            low,
            Signature::new(0.5, 0.5),
            world.config(),
        )
        .expect("cell");
        let cell = entity.as_cell().expect("cell state");
        assert!((cell.traits.reproduction_threshold - 150.0).abs() < 1e-6);

        let high = CellTraits {
            reproduction_threshold: 999_999.0,
            ..CellTraits::default()
        };
        let entity = Entity::cell(
            Vec2::ZERO,
            Vec2::ZERO,
            100.0,
            high,
            Signature::new(0.5, 0.5),
            world.config(),
        )
        .expect("cell");
        let cell = entity.as_cell().expect("cell state");
        assert!((cell.traits.reproduction_threshold - 5_000.0).abs() < 1e-6);
    }

    #[test]
    fn mutation_factor_is_bounded_by_evolve_rate() {
        let mut world = World::new(test_config()).expect("world");
        for _ in 0..500 {
            let mutated = world.mutate_scalar(100.0, 0.2);
            assert!((80.0..=120.0).contains(&mutated), "got {mutated}");
        }
        // Evolve rate stays inside its configured clamp across generations.
        let mut traits = CellTraits::default();
        for _ in 0..50 {
            traits = world.mutate_traits(traits);
            assert!(
                traits.evolve_rate >= world.config().evolve_rate_min
                    && traits.evolve_rate <= world.config().evolve_rate_max
            );
            assert!(traits.reproduction_threshold >= 150.0);
            assert!(traits.reproduction_threshold <= 5_000.0);
        }
    }

    #[test]
    fn cell_eats_nearest_compatible_food_once() {
        let mut config = test_config();
        config.collisions_enabled = false;
        let mut world = World::new(config).expect("world");
        let preference = Signature::new(0.3, 0.7);
        let cell = cell_at(&world, 200.0, 200.0, 400.0);
        // Two perfectly compatible particles at different ranges.
        let near = food_at(&world, 205.0, 200.0, preference, 60.0);
        let far = food_at(&world, 209.0, 200.0, preference, 60.0);
        world.queue_addition(cell);
        world.queue_addition(near);
        world.queue_addition(far);
        world.process_pending_changes();
        assert_eq!(world.food_count(), 2);

        world.update();

        // Exactly one food consumed per tick, and energy went up by its
        // nutrition (affinity 1.0) minus the metabolism drain.
        assert_eq!(world.food_count(), 1);
        let (_, cell_entity) = world
            .entities()
            .find(|(_, e)| e.is_cell())
            .expect("cell survives");
        let state = cell_entity.as_cell().expect("state");
        let expected = 400.0 - world.config().metabolism_cost + 60.0;
        assert!(
            (state.energy - expected).abs() < 1e-3,
            "energy {} expected {expected}",
            state.energy
        );
        // Perfect affinity leaves nothing for the stomach.
        assert!(state.stomach_total.abs() < 1e-6);
    }

    #[test]
    fn incompatible_food_is_ignored() {
        let mut config = test_config();
        config.collisions_enabled = false;
        let mut world = World::new(config).expect("world");
        let preference = Signature::new(0.3, 0.7);
        let cell = cell_at(&world, 200.0, 200.0, 400.0);
        let opposite = food_at(&world, 204.0, 200.0, preference.inverted(), 60.0);
        world.queue_addition(cell);
        world.queue_addition(opposite);
        world.process_pending_changes();

        world.update();
        assert_eq!(world.food_count(), 1, "antipodal food must survive");
    }

    #[test]
    fn imperfect_digestion_accumulates_inverted_waste() {
        let mut config = test_config();
        config.collisions_enabled = false;
        let mut world = World::new(config).expect("world");
        let preference = Signature::new(0.3, 0.7);
        // Offset flavor: compatible enough to eat, inefficient to digest.
        let flavor = Signature::new(0.4, 0.8);
        let cell = cell_at(&world, 200.0, 200.0, 400.0);
        let food = food_at(&world, 204.0, 200.0, flavor, 100.0);
        world.queue_addition(cell);
        world.queue_addition(food);
        world.process_pending_changes();

        world.update();
        let (_, cell_entity) = world
            .entities()
            .find(|(_, e)| e.is_cell())
            .expect("cell");
        let state = cell_entity.as_cell().expect("state");
        let efficiency = preference.affinity(flavor);
        assert!(efficiency < 1.0 && efficiency > world.config().compatibility_floor);
        assert!((state.stomach_total - 100.0 * (1.0 - efficiency)).abs() < 1e-3);
        assert!(state.stomach_waste.magnitude() > 0.0);
    }

    #[test]
    fn full_stomach_is_expelled_as_waste_food() {
        let mut config = test_config();
        config.collisions_enabled = false;
        let mut world = World::new(config).expect("world");
        let cell = cell_at(&world, 200.0, 200.0, 400.0);
        world.queue_addition(cell);
        world.process_pending_changes();
        let id = world.entities().next().map(|(id, _)| id).expect("id");

        // Pre-load a stomach past the expulsion threshold.
        if let Some(EntityKind::Cell(cell)) = world.entity_mut(id).map(|e| &mut e.kind) {
            cell.stomach_waste = Vec2::new(30.0, 40.0);
            cell.stomach_total = 50.0;
        }
        let energy_before = world
            .entity(id)
            .and_then(Entity::as_cell)
            .map(|c| c.energy)
            .expect("energy");

        world.update();

        let waste = world
            .entities()
            .filter_map(|(_, e)| e.as_food())
            .find(|f| f.is_waste)
            .expect("waste particle spawned");
        assert!((waste.nutrition - 50.0 * world.config().waste_nutrition_factor).abs() < 1e-3);
        // Averaged identity of the accumulated remainder.
        assert!((waste.signature.u - 0.6).abs() < 1e-3);
        assert!((waste.signature.v - 0.8).abs() < 1e-3);

        let state = world.entity(id).and_then(Entity::as_cell).expect("cell");
        assert_eq!(state.stomach_total, 0.0);
        assert!(state.energy < energy_before);
    }

    #[test]
    fn waste_particles_damage_nearby_cells() {
        let mut config = test_config();
        config.collisions_enabled = false;
        config.waste_damage = 5.0;
        let mut world = World::new(config).expect("world");
        let cell = cell_at(&world, 200.0, 200.0, 400.0);
        let waste = Entity::food(
            Vec2::new(210.0, 200.0),
            0.0,
            Signature::new(0.9, 0.1),
            true,
            world.config(),
        )
        .expect("waste");
        world.queue_addition(cell);
        world.queue_addition(waste);
        world.process_pending_changes();

        world.update();
        let (_, cell_entity) = world
            .entities()
            .find(|(_, e)| e.is_cell())
            .expect("cell");
        let state = cell_entity.as_cell().expect("state");
        // Baseline metabolism plus waste damage.
        assert!(state.energy <= 400.0 - world.config().metabolism_cost - 5.0 + 1e-3);
    }

    #[test]
    fn starved_cell_dies_and_deposits_food() {
        let mut config = test_config();
        config.collisions_enabled = false;
        config.metabolism_cost = 10.0;
        let mut world = World::new(config).expect("world");
        let preference = Signature::new(0.3, 0.7);
        let cell = Entity::cell(
            Vec2::new(200.0, 200.0),
            Vec2::ZERO,
            11.0,
            CellTraits::default(),
            preference,
            world.config(),
        )
        .expect("cell");
        world.queue_addition(cell);
        world.process_pending_changes();

        world.update();
        assert_eq!(world.cell_count(), 0, "cell starves at the floor");
        let deposit = world
            .entities()
            .filter_map(|(_, e)| e.as_food())
            .next()
            .expect("death deposit");
        let expected = 1.0 * world.config().death_food_fraction;
        assert!((deposit.nutrition - expected).abs() < 1e-3);
        assert!(deposit.signature.affinity(preference.inverted()) > 0.999);
    }

    #[test]
    fn out_of_range_eating_distance_is_lethal() {
        let mut config = test_config();
        config.collisions_enabled = false;
        let mut world = World::new(config).expect("world");
        let cell = cell_at(&world, 200.0, 200.0, 400.0);
        world.queue_addition(cell);
        world.process_pending_changes();
        let id = world.entities().next().map(|(id, _)| id).expect("id");
        if let Some(EntityKind::Cell(cell)) = world.entity_mut(id).map(|e| &mut e.kind) {
            cell.traits.eating_distance = 500.0;
        }

        world.update();
        assert_eq!(world.cell_count(), 0);
    }

    #[test]
    fn rich_cell_reproduces_with_mutated_offspring() {
        let mut config = test_config();
        config.collisions_enabled = false;
        let mut world = World::new(config).expect("world");
        let cell = cell_at(&world, 200.0, 200.0, 700.0); // above the 600 threshold
        world.queue_addition(cell);
        world.process_pending_changes();
        let parent = world.entities().next().map(|(id, _)| id).expect("parent");

        world.update();
        assert_eq!(world.cell_count(), 2);
        let (child_id, child) = world
            .entities()
            .find(|&(id, ref e)| id != parent && e.is_cell())
            .expect("child");
        let child_state = child.as_cell().expect("state");
        let expected_energy =
            world.config().reproduction_cost * world.config().offspring_energy_share;
        assert!((child_state.energy - expected_energy).abs() < 1e-3);
        assert_eq!(child_state.age, 0);

        // Child spawns outside the parent's radius, moving away.
        let parent_entity = world.entity(parent).expect("parent entity");
        let child_entity = world.entity(child_id).expect("child entity");
        let gap = world.torus().distance(
            parent_entity.body.position(),
            child_entity.body.position(),
        );
        assert!(gap >= parent_entity.body.size() * 0.5);
        assert!(child_entity.body.velocity().magnitude() > 0.0);
    }

    #[test]
    fn steering_pulls_toward_compatible_food() {
        let mut config = test_config();
        config.collisions_enabled = false;
        let mut world = World::new(config).expect("world");
        let preference = Signature::new(0.3, 0.7);
        let food = food_at(&world, 300.0, 200.0, preference, 100.0);
        world.queue_addition(food);
        world.process_pending_changes();

        let id = EntityId::null();
        let direction = world.movement_direction(id, Vec2::new(200.0, 200.0), preference);
        assert!(direction.x > 0.9, "direction {direction:?}");
        assert!(direction.y.abs() < 0.1);
    }

    #[test]
    fn repulsion_pushes_away_from_other_cells() {
        let mut config = test_config();
        config.collisions_enabled = false;
        let mut world = World::new(config).expect("world");
        let other = cell_at(&world, 260.0, 200.0, 400.0);
        world.queue_addition(other);
        world.process_pending_changes();

        let direction =
            world.movement_direction(EntityId::null(), Vec2::new(200.0, 200.0), Signature::new(0.0, 0.0));
        assert!(direction.x < -0.9, "direction {direction:?}");
    }

    #[test]
    fn collision_separates_overlapping_bodies() {
        let mut config = test_config();
        config.extinction_reset_ticks = 0;
        let mut world = World::new(config).expect("world");
        let a = food_at(&world, 200.0, 200.0, Signature::new(0.1, 0.1), 10.0);
        let b = food_at(&world, 202.0, 200.0, Signature::new(0.9, 0.9), 10.0);
        world.queue_addition(a);
        world.queue_addition(b);
        world.process_pending_changes();

        world.update();

        let positions: Vec<Vec2> = world.entities().map(|(_, e)| e.body.position()).collect();
        let sizes: Vec<f32> = world.entities().map(|(_, e)| e.body.size()).collect();
        let gap = world.torus().distance(positions[0], positions[1]);
        assert!(
            gap >= (sizes[0] + sizes[1]) * 0.5 - 1e-3,
            "bodies still penetrate: gap {gap}"
        );
    }

    #[test]
    fn static_bodies_are_never_pushed() {
        let mut world = World::new(test_config()).expect("world");
        let wall = Entity::barrier(Vec2::new(200.0, 200.0), 100.0, 20.0).expect("wall");
        let ball = food_at(&world, 206.0, 200.0, Signature::new(0.5, 0.5), 10.0);
        world.queue_addition(wall);
        world.queue_addition(ball);
        world.process_pending_changes();

        world.update();

        let (wall_pos, ball_pos) = {
            let mut wall_pos = Vec2::ZERO;
            let mut ball_pos = Vec2::ZERO;
            for (_, entity) in world.entities() {
                if entity.body.is_static() {
                    wall_pos = entity.body.position();
                } else {
                    ball_pos = entity.body.position();
                }
            }
            (wall_pos, ball_pos)
        };
        assert_eq!(wall_pos, Vec2::new(200.0, 200.0));
        let gap = world.torus().distance(wall_pos, ball_pos);
        assert!(gap >= (20.0 + world.config().food_size) * 0.5 - 1e-3);
    }

    #[test]
    fn extinction_reset_fires_once_and_zeroes_counters() {
        struct CountingScene(std::sync::Arc<std::sync::Mutex<usize>>);
        impl Scene for CountingScene {
            fn build(&mut self, world: &mut World) {
                *self.0.lock().unwrap() += 1;
                let cell = Entity::cell(
                    Vec2::new(100.0, 100.0),
                    Vec2::ZERO,
                    400.0,
                    CellTraits::default(),
                    Signature::new(0.5, 0.5),
                    world.config(),
                )
                .expect("cell");
                world.queue_addition(cell);
            }
        }

        let mut config = test_config();
        config.extinction_reset_ticks = 3;
        let mut world = World::new(config).expect("world");
        let invocations = std::sync::Arc::new(std::sync::Mutex::new(0_usize));
        world.set_scene(Box::new(CountingScene(invocations.clone())));

        world.update();
        world.update();
        assert_eq!(*invocations.lock().unwrap(), 0);
        world.update();
        assert_eq!(*invocations.lock().unwrap(), 1, "reseed fires exactly once");
        assert_eq!(world.tick(), 0);
        assert_eq!(world.extinction_ticks, 0);
        assert_eq!(world.cell_count(), 1);

        // With a living cell the counter never re-arms.
        world.update();
        assert_eq!(*invocations.lock().unwrap(), 1);
    }

    #[test]
    fn cell_energy_is_never_negative_at_tick_boundaries() {
        let mut config = test_config();
        config.metabolism_cost = 7.0;
        config.waste_damage = 3.0;
        let mut world = World::new(config).expect("world");
        let mut scene = UniformScene {
            cells: 12,
            food: 30,
            cell_energy: 20.0,
            food_nutrition: 40.0,
        };
        scene.build(&mut world);
        world.process_pending_changes();

        for _ in 0..40 {
            world.update();
            for (_, entity) in world.entities() {
                if let Some(cell) = entity.as_cell() {
                    assert!(cell.energy >= 0.0, "negative energy observed");
                }
            }
        }
    }
}
