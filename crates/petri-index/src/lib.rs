//! Toroidal coordinate math and the bucketed spatial hash shared across the
//! Petri workspace.
//!
//! Every spatial query in the simulation goes through [`TorusGrid`]: entities
//! and gradient sources are bucketed by wrapped grid cell, and radius queries
//! scan only the ring of cells that can contain a match. Coordinates wrap at
//! the world edges, so all deltas are shortest-path deltas.

use ordered_float::OrderedFloat;
use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// Errors emitted when constructing a spatial grid.
#[derive(Debug, Error)]
pub enum GridError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Wraps `value` into `[0, extent)`.
///
/// Negative and over-range inputs wrap rather than clamp; a non-positive
/// extent yields `0.0`.
#[must_use]
pub fn wrap(value: f32, extent: f32) -> f32 {
    if extent <= 0.0 || !value.is_finite() {
        return 0.0;
    }
    let wrapped = value.rem_euclid(extent);
    // rem_euclid can round up to the extent itself for tiny negative inputs.
    if wrapped >= extent { 0.0 } else { wrapped }
}

/// Shortest signed difference `to - from` on a circle of circumference `extent`.
///
/// Antisymmetric up to floating error: `wrapped_delta(a, b, e) == -wrapped_delta(b, a, e)`.
#[must_use]
pub fn wrapped_delta(from: f32, to: f32, extent: f32) -> f32 {
    if extent <= 0.0 {
        return to - from;
    }
    let half = extent * 0.5;
    (to - from + half).rem_euclid(extent) - half
}

/// Membership operations shared by toroidal spatial indices.
///
/// Keys are opaque handles (typically generational slot-map keys); the index
/// never owns the things it buckets.
pub trait TorusIndex<K> {
    /// Register `key` at the wrapped position `(x, y)`.
    ///
    /// Inserting a key that is already present is idempotent: the old entry is
    /// removed first, then the key is re-added at the new position.
    fn insert(&mut self, key: K, x: f32, y: f32);

    /// Drop `key` from the index, returning whether it was present.
    fn remove(&mut self, key: K) -> bool;

    /// Move `key` to `(x, y)`, re-bucketing only when the wrapped cell changed.
    ///
    /// A key the index has never seen is inserted fresh.
    fn relocate(&mut self, key: K, x: f32, y: f32);

    /// Visit every member within `radius` of `(x, y)` using wrapped deltas.
    ///
    /// The visitor receives the member key and its squared wrapped distance.
    /// Only the ring of ⌈radius / cell_size⌉ cells around the query cell is
    /// scanned. An empty index yields no visits, never an error.
    fn for_each_within(
        &self,
        x: f32,
        y: f32,
        radius: f32,
        visitor: &mut dyn FnMut(K, OrderedFloat<f32>),
    );
}

#[derive(Debug, Clone, Copy)]
struct Member<K> {
    key: K,
    x: f32,
    y: f32,
}

/// Uniform grid over a fixed-size wrap-around world.
///
/// Buckets keep insertion order; removal shifts only the affected bucket and
/// never reorders unrelated ones.
#[derive(Debug, Clone)]
pub struct TorusGrid<K> {
    cell_size: f32,
    width: f32,
    height: f32,
    cols: usize,
    rows: usize,
    buckets: Vec<Vec<Member<K>>>,
    membership: HashMap<K, usize>,
}

impl<K: Copy + Eq + Hash> TorusGrid<K> {
    /// Create a grid covering `width × height` world units with square buckets
    /// of `cell_size` world units.
    pub fn new(cell_size: f32, width: f32, height: f32) -> Result<Self, GridError> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(GridError::InvalidConfig("cell_size must be positive"));
        }
        if !(width.is_finite() && width > 0.0 && height.is_finite() && height > 0.0) {
            return Err(GridError::InvalidConfig("world extents must be positive"));
        }
        let cols = ((width / cell_size).ceil() as usize).max(1);
        let rows = ((height / cell_size).ceil() as usize).max(1);
        Ok(Self {
            cell_size,
            width,
            height,
            cols,
            rows,
            buckets: vec![Vec::new(); cols * rows],
            membership: HashMap::new(),
        })
    }

    /// Edge length of one bucket in world units.
    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Number of bucket columns.
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Number of bucket rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of registered members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.membership.len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.membership.is_empty()
    }

    /// Drop every member while retaining bucket capacity.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.membership.clear();
    }

    /// Snapshot of the members in the bucket at `(cell_x, cell_y)`, in
    /// insertion order. Out-of-range cell coordinates wrap.
    #[must_use]
    pub fn cell_members(&self, cell_x: i64, cell_y: i64) -> Vec<K> {
        let col = cell_x.rem_euclid(self.cols as i64) as usize;
        let row = cell_y.rem_euclid(self.rows as i64) as usize;
        self.buckets[row * self.cols + col]
            .iter()
            .map(|member| member.key)
            .collect()
    }

    /// Collect every member within `radius` of `(x, y)` together with its
    /// wrapped squared distance.
    #[must_use]
    pub fn query_radius(&self, x: f32, y: f32, radius: f32) -> Vec<(K, f32)> {
        let mut hits = Vec::new();
        self.for_each_within(x, y, radius, &mut |key, dist_sq| {
            hits.push((key, dist_sq.into_inner()));
        });
        hits
    }

    fn bucket_index(&self, x: f32, y: f32) -> usize {
        let col = ((wrap(x, self.width) / self.cell_size) as usize).min(self.cols - 1);
        let row = ((wrap(y, self.height) / self.cell_size) as usize).min(self.rows - 1);
        row * self.cols + col
    }

    /// Wrapped bucket indices covered by a ring of `ring` cells around `center`.
    ///
    /// When the ring spans the whole axis the full range is returned once, so
    /// no bucket is ever visited twice by a single query.
    fn axis_cells(center: usize, ring: usize, len: usize) -> Vec<usize> {
        if 2 * ring + 1 >= len {
            return (0..len).collect();
        }
        let len_i = len as i64;
        (-(ring as i64)..=ring as i64)
            .map(|offset| (center as i64 + offset).rem_euclid(len_i) as usize)
            .collect()
    }

    fn remove_from_bucket(&mut self, key: K, bucket: usize) {
        if let Some(pos) = self.buckets[bucket]
            .iter()
            .position(|member| member.key == key)
        {
            // Order-preserving removal: later members keep their relative order.
            self.buckets[bucket].remove(pos);
        }
    }
}

impl<K: Copy + Eq + Hash> TorusIndex<K> for TorusGrid<K> {
    fn insert(&mut self, key: K, x: f32, y: f32) {
        if self.membership.contains_key(&key) {
            self.remove(key);
        }
        let bucket = self.bucket_index(x, y);
        self.buckets[bucket].push(Member { key, x, y });
        self.membership.insert(key, bucket);
    }

    fn remove(&mut self, key: K) -> bool {
        match self.membership.remove(&key) {
            Some(bucket) => {
                self.remove_from_bucket(key, bucket);
                true
            }
            None => false,
        }
    }

    fn relocate(&mut self, key: K, x: f32, y: f32) {
        let Some(&old_bucket) = self.membership.get(&key) else {
            self.insert(key, x, y);
            return;
        };
        let new_bucket = self.bucket_index(x, y);
        if new_bucket == old_bucket {
            // Same cell: refresh the stored position in place.
            if let Some(member) = self.buckets[old_bucket]
                .iter_mut()
                .find(|member| member.key == key)
            {
                member.x = x;
                member.y = y;
            }
            return;
        }
        self.remove_from_bucket(key, old_bucket);
        self.buckets[new_bucket].push(Member { key, x, y });
        self.membership.insert(key, new_bucket);
    }

    fn for_each_within(
        &self,
        x: f32,
        y: f32,
        radius: f32,
        visitor: &mut dyn FnMut(K, OrderedFloat<f32>),
    ) {
        if radius < 0.0 || self.membership.is_empty() {
            return;
        }
        let ring = (radius / self.cell_size).ceil() as usize;
        let center_col = ((wrap(x, self.width) / self.cell_size) as usize).min(self.cols - 1);
        let center_row = ((wrap(y, self.height) / self.cell_size) as usize).min(self.rows - 1);
        let cols = Self::axis_cells(center_col, ring, self.cols);
        let rows = Self::axis_cells(center_row, ring, self.rows);
        let radius_sq = radius * radius;

        for &row in &rows {
            for &col in &cols {
                for member in &self.buckets[row * self.cols + col] {
                    let dx = wrapped_delta(x, member.x, self.width);
                    let dy = wrapped_delta(y, member.y, self.height);
                    let dist_sq = dx * dx + dy * dy;
                    if dist_sq <= radius_sq {
                        visitor(member.key, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}
