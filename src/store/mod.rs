//! Recipe store — triple-redundant, CRC-protected JSON files.
//!
//! Canonical envelope:
//!
//! ```json
//! { "crc32": <u32>, "recipes": [ ... ] }
//! ```
//!
//! `crc32` is the IEEE CRC-32 of the exact serialized bytes of the
//! `recipes` array; deserialization keeps those bytes intact via
//! [`RawValue`] so the check never depends on re-serialization quirks.
//!
//! Save writes all three replicas; success of at least one is success.
//! Load walks primary → backup1 → backup2 and accepts the first file
//! that parses with a matching CRC; a non-primary hit rewrites all
//! three to repair. When every replica fails, a legacy key-value record
//! (bare recipe array, pre-envelope format) is migrated and deleted.

use std::fs;
use std::path::PathBuf;

use crc::Crc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{Error, Result, StoreError};
use crate::ports::{StorageError, StoragePort};

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Tolerance on the ingredient percentage sum.
const PERCENT_SUM_TOLERANCE: f32 = 0.1;

/// NVS location of the legacy (pre-envelope) recipe blob.
const LEGACY_NAMESPACE: &str = "kibblet";
const LEGACY_KEY: &str = "recipes";
const LEGACY_MAX_BYTES: usize = 8192;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    #[serde(rename = "tankUid")]
    pub tank_uid: u64,
    pub percentage: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub uid: u32,
    pub name: String,
    /// Daily ration in grams, split over `servings`.
    #[serde(rename = "dailyWeight")]
    pub daily_weight_g: f32,
    pub servings: u16,
    pub created: i64,
    #[serde(rename = "lastUsed")]
    pub last_used: i64,
    #[serde(rename = "isEnabled")]
    pub enabled: bool,
    pub ingredients: Vec<Ingredient>,
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    crc32: u32,
    recipes: &'a RawValue,
}

#[derive(Deserialize)]
struct EnvelopeIn<'a> {
    crc32: u32,
    #[serde(borrow)]
    recipes: &'a RawValue,
}

fn percentages_valid(ingredients: &[Ingredient]) -> bool {
    let sum: f32 = ingredients.iter().map(|i| i.percentage).sum();
    (sum - 100.0).abs() <= PERCENT_SUM_TOLERANCE
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct RecipeStore<S: StoragePort> {
    paths: [PathBuf; 3],
    legacy: S,
    recipes: Vec<Recipe>,
}

impl<S: StoragePort> RecipeStore<S> {
    /// `paths` is `[primary, backup1, backup2]`.
    pub fn new(paths: [PathBuf; 3], legacy: S) -> Self {
        Self {
            paths,
            legacy,
            recipes: Vec::new(),
        }
    }

    pub fn recipes(&self) -> &[Recipe] {
        &self.recipes
    }

    pub fn recipe_by_uid(&self, uid: u32) -> Option<&Recipe> {
        self.recipes.iter().find(|r| r.uid == uid)
    }

    // ── Load ──────────────────────────────────────────────────

    /// Load from the first replica that verifies; repair or migrate as
    /// needed. Returns the number of recipes loaded.
    pub fn load(&mut self) -> usize {
        for (index, path) in self.paths.clone().iter().enumerate() {
            match Self::read_verified(path) {
                Ok(recipes) => {
                    info!(
                        "store: loaded {} recipe(s) from {}",
                        recipes.len(),
                        path.display()
                    );
                    self.recipes = recipes;
                    if index != 0 {
                        // Primary was bad; heal every replica from the
                        // survivor.
                        warn!("store: repairing replicas from {}", path.display());
                        if let Err(e) = self.save() {
                            warn!("store: replica repair failed ({e})");
                        }
                    }
                    return self.recipes.len();
                }
                Err(e) => {
                    warn!("store: {} rejected ({e})", path.display());
                }
            }
        }

        // Every replica failed; try the legacy key-value record.
        match self.migrate_legacy() {
            Some(count) => count,
            None => {
                warn!("store: no usable recipe storage, starting empty");
                self.recipes = Vec::new();
                0
            }
        }
    }

    fn read_verified(path: &PathBuf) -> core::result::Result<Vec<Recipe>, StoreError> {
        let text = fs::read_to_string(path).map_err(|_| StoreError::NotFound)?;
        let envelope: EnvelopeIn<'_> =
            serde_json::from_str(&text).map_err(|_| StoreError::CrcMismatch)?;
        let raw = envelope.recipes.get();
        if CRC32.checksum(raw.as_bytes()) != envelope.crc32 {
            return Err(StoreError::CrcMismatch);
        }
        serde_json::from_str(raw).map_err(|_| StoreError::CrcMismatch)
    }

    fn migrate_legacy(&mut self) -> Option<usize> {
        let mut buf = vec![0u8; LEGACY_MAX_BYTES];
        let len = match self.legacy.read(LEGACY_NAMESPACE, LEGACY_KEY, &mut buf) {
            Ok(len) => len,
            Err(StorageError::NotFound) => return None,
            Err(e) => {
                warn!("store: legacy read failed ({e})");
                return None;
            }
        };
        let recipes: Vec<Recipe> = match serde_json::from_slice(&buf[..len]) {
            Ok(recipes) => recipes,
            Err(e) => {
                warn!("store: legacy record unparsable ({e})");
                return None;
            }
        };

        info!("store: migrating {} legacy recipe(s)", recipes.len());
        self.recipes = recipes;
        if self.save().is_ok() {
            let _ = self.legacy.delete(LEGACY_NAMESPACE, LEGACY_KEY);
        }
        Some(self.recipes.len())
    }

    // ── Save ──────────────────────────────────────────────────

    /// Write all three replicas. Success requires at least one write to
    /// land.
    pub fn save(&self) -> Result<()> {
        let raw = serde_json::to_string(&self.recipes)
            .map_err(|_| Error::Store(StoreError::WriteFailed))?;
        let crc32 = CRC32.checksum(raw.as_bytes());
        let raw_value =
            RawValue::from_string(raw).map_err(|_| Error::Store(StoreError::WriteFailed))?;
        let envelope = EnvelopeOut {
            crc32,
            recipes: &raw_value,
        };
        let text = serde_json::to_string(&envelope)
            .map_err(|_| Error::Store(StoreError::WriteFailed))?;

        let mut written = 0usize;
        for path in &self.paths {
            match fs::write(path, &text) {
                Ok(()) => written += 1,
                Err(e) => warn!("store: write to {} failed ({e})", path.display()),
            }
        }
        if written == 0 {
            return Err(Error::Store(StoreError::WriteFailed));
        }
        Ok(())
    }

    // ── CRUD ──────────────────────────────────────────────────

    /// Add a recipe; its uid is assigned as `max(existing) + 1`.
    pub fn add_recipe(&mut self, mut recipe: Recipe, now: i64) -> Result<u32> {
        if !percentages_valid(&recipe.ingredients) {
            return Err(Error::Store(StoreError::PercentageSum));
        }
        let uid = self.recipes.iter().map(|r| r.uid).max().unwrap_or(0) + 1;
        recipe.uid = uid;
        recipe.created = now;
        recipe.last_used = 0;
        info!("store: added recipe '{}' (uid {uid})", recipe.name);
        self.recipes.push(recipe);
        self.save()?;
        Ok(uid)
    }

    pub fn update_recipe(&mut self, recipe: Recipe, now: i64) -> Result<()> {
        if !percentages_valid(&recipe.ingredients) {
            return Err(Error::Store(StoreError::PercentageSum));
        }
        let Some(existing) = self.recipes.iter_mut().find(|r| r.uid == recipe.uid) else {
            warn!("store: no recipe with uid {} to update", recipe.uid);
            return Err(Error::Store(StoreError::NotFound));
        };
        existing.name = recipe.name;
        existing.ingredients = recipe.ingredients;
        existing.daily_weight_g = recipe.daily_weight_g;
        existing.servings = recipe.servings;
        existing.enabled = recipe.enabled;
        existing.last_used = now;
        self.save()
    }

    pub fn delete_recipe(&mut self, uid: u32) -> Result<()> {
        let before = self.recipes.len();
        self.recipes.retain(|r| r.uid != uid);
        if self.recipes.len() == before {
            warn!("store: no recipe with uid {uid} to delete");
            return Err(Error::Store(StoreError::NotFound));
        }
        info!("store: deleted recipe {uid}");
        self.save()
    }

    /// Stamp a recipe as just used (after a successful feed).
    pub fn mark_used(&mut self, uid: u32, now: i64) -> Result<()> {
        let Some(recipe) = self.recipes.iter_mut().find(|r| r.uid == uid) else {
            return Err(Error::Store(StoreError::NotFound));
        };
        recipe.last_used = now;
        self.save()
    }
}
