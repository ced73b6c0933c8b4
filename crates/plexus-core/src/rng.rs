//! Deterministic seeded randomness with independent named streams.
//!
//! A single root seed fans out into any number of named [`RngStream`]s. Each
//! stream is seeded with [`hash32`] of `"{root}::{name}"`, so:
//!
//! - every stream is reproducible from the root seed alone, and
//! - drawing from one stream never shifts another stream's sequence,
//!   whatever order the streams are used in.
//!
//! That property is what lets a replayed command log reproduce the exact
//! random draws of the original run.
//!
//! ```
//! use plexus_core::rng::{RngService, Seed};
//!
//! let mut a = RngService::new(Some(Seed::from(7u64)));
//! let mut b = RngService::new(Some(Seed::from(7u64)));
//!
//! // Interleaving differs, sequences do not.
//! let _ = a.stream("noise").float();
//! let x = a.stream("loot").float();
//! let y = b.stream("loot").float();
//! assert_eq!(x, y);
//! ```

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};

use crate::hash::hash32;

/// Name of the stream behind the [`RngService`] shorthand draws.
pub const DEFAULT_STREAM: &str = "default";

// ---------------------------------------------------------------------------
// Seed
// ---------------------------------------------------------------------------

/// A root seed as supplied by a host: a number or an arbitrary string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seed {
    Number(u64),
    Text(String),
}

impl Seed {
    /// Coerce to the 32-bit root seed.
    ///
    /// Numbers keep their low 32 bits. Strings holding a decimal integer are
    /// treated as that number; any other string is hashed.
    pub fn to_root(&self) -> u32 {
        match self {
            Seed::Number(n) => *n as u32,
            Seed::Text(text) => match text.trim().parse::<u64>() {
                Ok(n) => n as u32,
                Err(_) => hash32(text.as_bytes()),
            },
        }
    }

    /// A seed derived from the wall clock, for hosts that do not care about
    /// reproducibility.
    pub fn from_wall_clock() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Seed::Number(u64::from(hash32(millis.to_string().as_bytes())))
    }
}

impl From<u64> for Seed {
    fn from(value: u64) -> Self {
        Seed::Number(value)
    }
}

impl From<u32> for Seed {
    fn from(value: u32) -> Self {
        Seed::Number(u64::from(value))
    }
}

impl From<&str> for Seed {
    fn from(value: &str) -> Self {
        Seed::Text(value.to_owned())
    }
}

impl From<String> for Seed {
    fn from(value: String) -> Self {
        Seed::Text(value)
    }
}

// ---------------------------------------------------------------------------
// RngStream
// ---------------------------------------------------------------------------

/// One named, independently seeded pseudo-random sequence.
#[derive(Debug, Clone)]
pub struct RngStream {
    seed: u32,
    rng: Pcg32,
}

impl RngStream {
    /// Create a stream from its derived 32-bit seed.
    pub fn new(seed: u32) -> Self {
        Self {
            seed,
            rng: Pcg32::seed_from_u64(u64::from(seed)),
        }
    }

    /// The derived seed this stream started from.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Uniform float in `[0, 1)`.
    pub fn float(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform integer in `[min, max]`. Returns `min` when `max < min`.
    pub fn int(&mut self, min: i64, max: i64) -> i64 {
        if max <= min {
            return min;
        }
        self.rng.gen_range(min..=max)
    }

    /// A uniformly chosen element, or `None` for an empty slice.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut self.rng)
    }
}

// ---------------------------------------------------------------------------
// RngService
// ---------------------------------------------------------------------------

/// Root seed plus a lazily populated cache of named streams.
#[derive(Debug, Clone)]
pub struct RngService {
    root: u32,
    streams: HashMap<String, RngStream>,
}

impl RngService {
    /// Create the service. `None` seeds from the wall clock.
    pub fn new(seed: Option<Seed>) -> Self {
        let seed = seed.unwrap_or_else(Seed::from_wall_clock);
        Self {
            root: seed.to_root(),
            streams: HashMap::new(),
        }
    }

    /// The current 32-bit root seed.
    pub fn seed(&self) -> u32 {
        self.root
    }

    /// Replace the root seed and discard every derived stream.
    ///
    /// Streams requested afterwards are re-derived from the new root.
    pub fn set_seed(&mut self, seed: impl Into<Seed>) {
        self.root = seed.into().to_root();
        self.streams.clear();
        tracing::debug!(root = self.root, "rng root seed replaced");
    }

    /// The stream called `name`, created on first use.
    pub fn stream(&mut self, name: &str) -> &mut RngStream {
        let root = self.root;
        self.streams
            .entry(name.to_owned())
            .or_insert_with(|| RngStream::new(derive_stream_seed(root, name)))
    }

    /// Number of streams created since the last reseed.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// [`RngStream::float`] on the default stream.
    pub fn float(&mut self) -> f64 {
        self.stream(DEFAULT_STREAM).float()
    }

    /// [`RngStream::int`] on the default stream.
    pub fn int(&mut self, min: i64, max: i64) -> i64 {
        self.stream(DEFAULT_STREAM).int(min, max)
    }

    /// [`RngStream::pick`] on the default stream.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        self.stream(DEFAULT_STREAM).pick(items)
    }
}

/// `hash32("{root}::{name}")`.
pub fn derive_stream_seed(root: u32, name: &str) -> u32 {
    hash32(format!("{root}::{name}").as_bytes())
}
