//! On-disk variant definitions.
//!
//! Layout:
//!
//! ```text
//! <variants_dir>/<NAME>/config.yaml
//! <variants_dir>/<NAME>/prompts/{system,localize,patch}.txt   (each optional)
//! ```
//!
//! `config.yaml` holds the gate flags and, optionally, session-limit
//! overrides. A missing directory falls back to the built-in preset of the
//! same name.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::GatePolicy;
use crate::config::SessionLimits;
use crate::error::ConfigError;

/// Prompt texts that replace the built-in ones when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptOverrides {
    pub system: Option<String>,
    pub localize: Option<String>,
    pub patch: Option<String>,
}

/// A fully resolved variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    pub policy: GatePolicy,
    pub session: Option<SessionLimits>,
    pub prompts: PromptOverrides,
}

impl VariantSpec {
    /// A preset (or `custom:`) variant with built-in prompts.
    pub fn builtin(name: &str) -> Result<Self, ConfigError> {
        let policy = GatePolicy::resolve(name)?;
        Ok(Self {
            name: policy.variant_name(),
            policy,
            session: None,
            prompts: PromptOverrides::default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct VariantFile {
    tdd_gate: bool,
    index_retrieval: bool,
    compile_gate: bool,
    #[serde(default)]
    session: Option<SessionLimits>,
}

/// Resolve `name`, preferring `<variants_dir>/<NAME>/` when it exists.
pub fn load_variant(name: &str, variants_dir: Option<&Path>) -> Result<VariantSpec, ConfigError> {
    let Some(dir) = variants_dir else {
        return VariantSpec::builtin(name);
    };

    let variant_dir = dir.join(name.trim().to_ascii_uppercase());
    if !variant_dir.is_dir() {
        return VariantSpec::builtin(name);
    }

    let config_path = variant_dir.join("config.yaml");
    let content = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::VariantFile {
        path: config_path.clone(),
        message: e.to_string(),
    })?;
    let file: VariantFile =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::VariantFile {
            path: config_path.clone(),
            message: e.to_string(),
        })?;

    let prompts_dir = variant_dir.join("prompts");
    let prompts = PromptOverrides {
        system: read_optional(&prompts_dir.join("system.txt"))?,
        localize: read_optional(&prompts_dir.join("localize.txt"))?,
        patch: read_optional(&prompts_dir.join("patch.txt"))?,
    };

    tracing::debug!(variant = name, dir = %variant_dir.display(), "Loaded variant from disk");

    Ok(VariantSpec {
        name: name.trim().to_ascii_uppercase(),
        policy: GatePolicy::new(file.tdd_gate, file.index_retrieval, file.compile_gate),
        session: file.session,
        prompts,
    })
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::VariantFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(Some(text))
}
