//! Gate policy resolution.
//!
//! A [`GatePolicy`] is three independent flags. The five canonical presets
//! are named combinations of them; any other combination can be requested
//! as `custom:<flag>+<flag>` for ablation runs.

pub mod variants;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use variants::{load_variant, PromptOverrides, VariantSpec};

/// Which optional validation stages are active for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatePolicy {
    /// RED before patching, GREEN after.
    pub tdd_gate: bool,
    /// Localize through the retrieval index instead of text search.
    pub index_retrieval: bool,
    /// Compile right after applying a patch, rolling back on failure.
    pub compile_gate: bool,
}

/// Canonical presets as (primary name, alias, policy).
const PRESETS: [(&str, &str, GatePolicy); 5] = [
    ("G0", "baseline", GatePolicy::new(false, false, false)),
    ("G1", "tdd", GatePolicy::new(true, false, false)),
    ("G2", "index", GatePolicy::new(false, true, false)),
    ("G3", "compile", GatePolicy::new(false, false, true)),
    ("G5", "full", GatePolicy::new(true, true, true)),
];

impl GatePolicy {
    pub const fn new(tdd_gate: bool, index_retrieval: bool, compile_gate: bool) -> Self {
        Self {
            tdd_gate,
            index_retrieval,
            compile_gate,
        }
    }

    pub const fn baseline() -> Self {
        Self::new(false, false, false)
    }

    pub const fn full() -> Self {
        Self::new(true, true, true)
    }

    /// Resolve a variant name to a policy.
    ///
    /// Accepts preset names (`G0`..`G5`), their aliases and `custom:` flag
    /// lists, case-insensitively.
    pub fn resolve(name: &str) -> Result<Self, ConfigError> {
        let trimmed = name.trim();
        for (primary, alias, policy) in PRESETS {
            if trimmed.eq_ignore_ascii_case(primary) || trimmed.eq_ignore_ascii_case(alias) {
                return Ok(policy);
            }
        }

        let lowered = trimmed.to_ascii_lowercase();
        if let Some(flags) = lowered.strip_prefix("custom:") {
            return Self::from_flags(trimmed, flags);
        }

        Err(ConfigError::UnknownVariant(trimmed.to_string()))
    }

    /// Policy from a `+`/`,` separated flag list such as `tdd+compile`.
    /// `variant` only labels errors.
    pub fn from_flags(variant: &str, flags: &str) -> Result<Self, ConfigError> {
        let mut policy = Self::baseline();
        let flags = flags.trim().to_ascii_lowercase();
        if flags == "none" {
            return Ok(policy);
        }
        let mut seen = 0;
        for flag in flags.split(['+', ',']).map(str::trim).filter(|f| !f.is_empty()) {
            seen += 1;
            match flag {
                "tdd" => policy.tdd_gate = true,
                "index" => policy.index_retrieval = true,
                "compile" => policy.compile_gate = true,
                other => {
                    return Err(ConfigError::UnknownFlag {
                        variant: variant.to_string(),
                        flag: other.to_string(),
                    })
                }
            }
        }
        if seen == 0 {
            return Err(ConfigError::EmptyFlags(variant.to_string()));
        }
        Ok(policy)
    }

    /// All eight flag combinations, presets included.
    pub fn all_combinations() -> Vec<Self> {
        (0u8..8)
            .map(|bits| Self::new(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0))
            .collect()
    }

    /// The canonical presets with their names.
    pub fn presets() -> Vec<(&'static str, &'static str, Self)> {
        PRESETS.to_vec()
    }

    /// Preset name when the flags match one, `custom:...` otherwise.
    pub fn variant_name(&self) -> String {
        PRESETS
            .iter()
            .find(|(_, _, policy)| policy == self)
            .map(|(primary, _, _)| primary.to_string())
            .unwrap_or_else(|| format!("custom:{}", self.flag_list()))
    }

    fn flag_list(&self) -> String {
        let mut flags = Vec::new();
        if self.tdd_gate {
            flags.push("tdd");
        }
        if self.index_retrieval {
            flags.push("index");
        }
        if self.compile_gate {
            flags.push("compile");
        }
        if flags.is_empty() {
            "none".to_string()
        } else {
            flags.join("+")
        }
    }
}

impl FromStr for GatePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s)
    }
}

impl fmt::Display for GatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.variant_name())
    }
}
