// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading the compose info file a build leaves behind.

use camino::Utf8Path;
use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::descriptor::SharedImageRefs;
use crate::roles::RoleSpec;

#[derive(Debug, Error)]
pub enum ComposeInfoError {
    #[error("failed to read compose info {path}")]
    Io {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("compose info is not valid JSON")]
    Parse(#[from] serde_json::Error),

    #[error("compose info has neither \"nodes\" nor \"compositions_info\"")]
    NoNodes,

    #[error(
        "composition {name} is not in the compose info (available: {})",
        .available.join(", ")
    )]
    UnknownComposition { name: String, available: Vec<String> },

    #[error(
        "compose info holds several compositions, pick one of: {}",
        .available.join(", ")
    )]
    CompositionRequired { available: Vec<String> },

    #[error("selected flavour ({requested}) differs from compose info ({recorded})")]
    FlavourMismatch { requested: String, recorded: String },
}

/// The flavour a build was made for.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct FlavourInfo {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CompositionEntry {
    nodes: RoleSpec,
    #[serde(default)]
    test_script: Option<String>,
}

/// Both on-disk forms: a single composition with top-level `nodes`, or
/// several under `compositions_info` sharing `all` and `flavour`.
#[derive(Debug, Deserialize)]
struct RawComposeInfo {
    #[serde(default)]
    nodes: Option<RoleSpec>,
    #[serde(default)]
    compositions_info: Option<IndexMap<String, CompositionEntry>>,
    #[serde(default)]
    all: Option<SharedImageRefs>,
    #[serde(default)]
    flavour: Option<FlavourInfo>,
    #[serde(default)]
    test_script: Option<String>,
}

/// One composition's build output.
#[derive(Clone, Debug, PartialEq)]
pub struct ComposeInfo {
    composition: Option<String>,
    roles: RoleSpec,
    all: Option<SharedImageRefs>,
    flavour: Option<FlavourInfo>,
    test_script: Option<String>,
}

impl ComposeInfo {
    pub fn from_path(
        path: &Utf8Path,
        composition: Option<&str>,
        flavour: &str,
    ) -> Result<Self, ComposeInfoError> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            ComposeInfoError::Io { path: path.to_path_buf(), source }
        })?;
        let info = Self::from_json(&contents, composition, flavour)?;
        info!(
            %path,
            composition = ?info.composition,
            roles = info.roles.len(),
            "loaded compose info"
        );
        Ok(info)
    }

    /// Parses compose info and selects `composition` from it.
    ///
    /// A single-composition file ignores `composition`. A multi-composition
    /// file needs it unless it holds exactly one composition.
    pub fn from_json(
        json: &str,
        composition: Option<&str>,
        flavour: &str,
    ) -> Result<Self, ComposeInfoError> {
        let raw: RawComposeInfo = serde_json::from_str(json)?;

        if let Some(recorded) =
            raw.flavour.as_ref().and_then(|f| f.name.as_deref())
        {
            if recorded != flavour {
                return Err(ComposeInfoError::FlavourMismatch {
                    requested: flavour.to_owned(),
                    recorded: recorded.to_owned(),
                });
            }
        }

        let (name, roles, test_script) = match (raw.compositions_info, raw.nodes) {
            (Some(mut compositions), _) => {
                let available = || compositions.keys().cloned().collect();
                let name = match composition {
                    Some(name) if compositions.contains_key(name) => {
                        name.to_owned()
                    }
                    Some(name) => {
                        return Err(ComposeInfoError::UnknownComposition {
                            name: name.to_owned(),
                            available: available(),
                        })
                    }
                    None if compositions.len() == 1 => {
                        compositions.keys().next().cloned().unwrap_or_default()
                    }
                    None => {
                        return Err(ComposeInfoError::CompositionRequired {
                            available: available(),
                        })
                    }
                };
                let entry = compositions
                    .shift_remove(&name)
                    .ok_or(ComposeInfoError::NoNodes)?;
                (Some(name), entry.nodes, entry.test_script.or(raw.test_script))
            }
            (None, Some(nodes)) => {
                (composition.map(str::to_owned), nodes, raw.test_script)
            }
            (None, None) => return Err(ComposeInfoError::NoNodes),
        };

        Ok(Self {
            composition: name,
            roles,
            all: raw.all,
            flavour: raw.flavour,
            test_script,
        })
    }

    /// The selected composition, when the file or the caller named one.
    pub fn composition(&self) -> Option<&str> {
        self.composition.as_deref()
    }

    pub fn roles(&self) -> &RoleSpec {
        &self.roles
    }

    pub fn all(&self) -> Option<&SharedImageRefs> {
        self.all.as_ref()
    }

    pub fn flavour(&self) -> Option<&FlavourInfo> {
        self.flavour.as_ref()
    }

    pub fn test_script(&self) -> Option<&str> {
        self.test_script.as_deref()
    }
}
