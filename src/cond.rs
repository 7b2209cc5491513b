//! Condition Store: a reactive key -> tri-state map backed by marker files
//! under a runtime directory.
//!
//! A condition key is a slash-delimited path (`net/eth0/up`, `pid/foo`,
//! `hook/basefs-up`). Its state is one of [`CondState::Off`],
//! [`CondState::Flux`], or [`CondState::On`], materialised as the presence
//! (and location) of a marker file: `ON` is a file directly under
//! `cond/<key>`, `FLUX` is a file staged under `cond/flux/<key>`, `OFF` is
//! the absence of both.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{COND_DIR, COND_FLUX_DIR, MAX_COND_LEN};
use crate::error::{CondError, ConfigError};

/// Tri-state value of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondState {
    /// Absent; no marker file.
    Off,
    /// Transitioning; dependents pause rather than stop.
    Flux,
    /// Asserted.
    On,
}

impl CondState {
    fn rank(self) -> u8 {
        match self {
            CondState::Off => 0,
            CondState::Flux => 1,
            CondState::On => 2,
        }
    }

    /// Inversion used when a term in an expression is negated: `Off` and
    /// `On` swap, `Flux` is unaffected (a negated dependency on something
    /// mid-transition still isn't satisfied, but it isn't a hard failure
    /// either).
    fn inverted(self) -> CondState {
        match self {
            CondState::Off => CondState::On,
            CondState::On => CondState::Off,
            CondState::Flux => CondState::Flux,
        }
    }
}

impl PartialOrd for CondState {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.rank().cmp(&other.rank()))
    }
}

impl Ord for CondState {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank().cmp(&other.rank())
    }
}

/// A validated condition key: a non-empty, slash-delimited path with no
/// `..` or empty segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CondKey(String);

impl CondKey {
    /// Parse and validate a key from an expression or a `register()` call.
    /// Rejects path traversal and empty segments; the original C never
    /// needed this because it only ever saw build-time-fixed hook names or
    /// admin-authored condition expressions funneled through the same
    /// process, not arbitrary untrusted input.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.is_empty() || raw.len() > MAX_COND_LEN {
            return Err(ConfigError::InvalidCondKey(
                raw.to_string(),
                "key is empty or exceeds the maximum length",
            ));
        }
        if raw.starts_with('/') || raw.ends_with('/') {
            return Err(ConfigError::InvalidCondKey(
                raw.to_string(),
                "key must not start or end with '/'",
            ));
        }
        for segment in raw.split('/') {
            if segment.is_empty() {
                return Err(ConfigError::InvalidCondKey(
                    raw.to_string(),
                    "key contains an empty segment ('//')",
                ));
            }
            if segment == ".." || segment == "." {
                return Err(ConfigError::InvalidCondKey(
                    raw.to_string(),
                    "key must not contain '.' or '..' segments",
                ));
            }
        }
        Ok(CondKey(raw.to_string()))
    }

    /// Build a key known at compile time to be well-formed (hook points,
    /// `pid/<svc>` liveness keys). Panics in debug builds on malformed
    /// input since these are never attacker- or operator-controlled.
    pub fn new_trusted(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        debug_assert!(!raw.is_empty() && !raw.starts_with('/') && !raw.ends_with('/'));
        CondKey(raw)
    }

    /// Relative filesystem path (using `/` as the key's own separator) of
    /// this key's `ON` marker, relative to `cond/`.
    fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }
}

impl fmt::Display for CondKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single term in a condition expression: a key, optionally negated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondTerm {
    /// The key this term tests.
    pub key: CondKey,
    /// Whether the term is negated (`!key`).
    pub negated: bool,
}

/// A parsed condition expression: a comma-separated list of terms,
/// combined per the aggregation rule in [`CondStore::aggregate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CondExpr {
    /// The expression's terms, in source order.
    pub terms: Vec<CondTerm>,
}

impl CondExpr {
    /// Parse a comma-separated, optionally-`!`-prefixed expression. An
    /// empty or all-whitespace string yields the empty expression, which
    /// aggregates to `On`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut terms = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (negated, key_str) = match part.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, part),
            };
            terms.push(CondTerm {
                key: CondKey::parse(key_str)?,
                negated,
            });
        }
        Ok(CondExpr { terms })
    }

    /// True if the expression has no terms.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// True if `key` appears (negated or not) among this expression's
    /// terms.
    pub fn mentions(&self, key: &CondKey) -> bool {
        self.terms.iter().any(|t| &t.key == key)
    }
}

/// Reactive key -> tri-state condition store backed by marker files.
pub struct CondStore {
    runtime_dir: PathBuf,
    state: HashMap<CondKey, CondState>,
    oneshot: HashSet<CondKey>,
    available: bool,
}

impl CondStore {
    /// Construct a store rooted at `runtime_dir`. `is_available()` reflects
    /// whether `runtime_dir/cond` could be created/stat'd at construction
    /// time; a store that starts unavailable may still accept `set`/`get`
    /// calls purely in memory (mutations are then pending a later flush is
    /// out of scope here — see Non-goals — callers should treat
    /// `!is_available()` as "don't trust persistence yet").
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        let runtime_dir = runtime_dir.into();
        let cond_dir = runtime_dir.join(COND_DIR);
        let available = fs::create_dir_all(&cond_dir).is_ok()
            && fs::create_dir_all(cond_dir.join(COND_FLUX_DIR)).is_ok();
        CondStore {
            runtime_dir,
            state: HashMap::new(),
            oneshot: HashSet::new(),
            available,
        }
    }

    /// Whether the backing runtime directory is mounted and writable.
    pub fn is_available(&self) -> bool {
        self.available
    }

    fn on_path(&self, key: &CondKey) -> PathBuf {
        self.runtime_dir.join(COND_DIR).join(key.relative_path())
    }

    fn flux_path(&self, key: &CondKey) -> PathBuf {
        self.runtime_dir
            .join(COND_DIR)
            .join(COND_FLUX_DIR)
            .join(key.relative_path())
    }

    fn touch(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(path).map(|_| ())
    }

    fn remove_if_present(path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Current state of `key`; `Off` if never set.
    pub fn get(&self, key: &CondKey) -> CondState {
        self.state.get(key).copied().unwrap_or(CondState::Off)
    }

    /// Set `key` to `state`, updating the backing marker files. Returns
    /// `true` if the state actually changed (callers use this to decide
    /// whether to mark dependents dirty and schedule a step).
    pub fn set(&mut self, key: &CondKey, state: CondState) -> Result<bool, CondError> {
        if self.oneshot.contains(key) && state != CondState::On {
            // A one-shot condition is permanent for the boot; demoting it
            // would contradict `set_oneshot`'s contract.
            return Ok(false);
        }
        let changed = self.get(key) != state;
        if self.available {
            match state {
                CondState::On => {
                    Self::touch(&self.on_path(key)).map_err(|source| CondError::MarkerIo {
                        key: key.clone(),
                        source,
                    })?;
                    Self::remove_if_present(&self.flux_path(key)).map_err(|source| {
                        CondError::MarkerIo {
                            key: key.clone(),
                            source,
                        }
                    })?;
                }
                CondState::Flux => {
                    Self::remove_if_present(&self.on_path(key)).map_err(|source| {
                        CondError::MarkerIo {
                            key: key.clone(),
                            source,
                        }
                    })?;
                    Self::touch(&self.flux_path(key)).map_err(|source| CondError::MarkerIo {
                        key: key.clone(),
                        source,
                    })?;
                }
                CondState::Off => {
                    Self::remove_if_present(&self.on_path(key)).map_err(|source| {
                        CondError::MarkerIo {
                            key: key.clone(),
                            source,
                        }
                    })?;
                    Self::remove_if_present(&self.flux_path(key)).map_err(|source| {
                        CondError::MarkerIo {
                            key: key.clone(),
                            source,
                        }
                    })?;
                }
            }
        }
        self.state.insert(key.clone(), state);
        Ok(changed)
    }

    /// Set `key` to `On` and latch it so it can never be cleared again this
    /// boot (used for hook-point conditions, which fire exactly once).
    pub fn set_oneshot(&mut self, key: &CondKey) -> Result<bool, CondError> {
        let changed = self.set(key, CondState::On)?;
        self.oneshot.insert(key.clone());
        Ok(changed)
    }

    /// Clear `key` back to `Off`. No-op (returns `Ok(false)`) if the key is
    /// latched via [`CondStore::set_oneshot`].
    pub fn clear(&mut self, key: &CondKey) -> Result<bool, CondError> {
        if self.oneshot.contains(key) {
            return Ok(false);
        }
        self.set(key, CondState::Off)
    }

    /// Clear every known key whose path starts with `prefix` (a
    /// slash-delimited directory, e.g. `pid` clears all `pid/*` keys).
    /// Returns the keys that were actually changed.
    pub fn clear_path(&mut self, prefix: &str) -> Result<Vec<CondKey>, CondError> {
        let prefix_with_slash = format!("{prefix}/");
        let matching: Vec<CondKey> = self
            .state
            .keys()
            .filter(|k| {
                let s = k.to_string();
                s == prefix || s.starts_with(&prefix_with_slash)
            })
            .cloned()
            .collect();
        let mut changed = Vec::new();
        for key in matching {
            if self.clear(&key)? {
                changed.push(key);
            }
        }
        Ok(changed)
    }

    /// True if `expr` mentions `changed_key` (ignoring negation); used by
    /// the driver to decide whether a mutated key should mark a given
    /// service dirty.
    pub fn affects(&self, changed_key: &CondKey, expr: &CondExpr) -> bool {
        expr.mentions(changed_key)
    }

    /// Aggregate an expression to a single tri-state value: `On` iff every
    /// term (after applying its negation) is `On`; `Off` if any term (after
    /// negation) is `Off`; otherwise `Flux`. An empty expression aggregates
    /// to `On`.
    pub fn aggregate(&self, expr: &CondExpr) -> CondState {
        if expr.is_empty() {
            return CondState::On;
        }
        let mut saw_flux = false;
        for term in &expr.terms {
            let raw = self.get(&term.key);
            let contribution = if term.negated { raw.inverted() } else { raw };
            match contribution {
                CondState::Off => return CondState::Off,
                CondState::Flux => saw_flux = true,
                CondState::On => {}
            }
        }
        if saw_flux {
            CondState::Flux
        } else {
            CondState::On
        }
    }
}
