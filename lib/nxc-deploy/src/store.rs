// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lookup of build outputs that may live in a store other than the local
//! `/nix/store`, e.g. a store shared over NFS and mounted elsewhere on
//! machines that did not run the build.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// The prefix every store path starts with. Alternative store roots stand
/// in for `/nix`.
const NIX_PREFIX: &str = "/nix";
const STORE_PREFIX: &str = "/nix/store/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{path} does not exist in the local store or in any alternative (searched: {})", .searched.join(", "))]
    NotFound { path: String, searched: Vec<String> },
}

/// Resolves store paths against an ordered list of alternative store roots,
/// falling back to the local filesystem.
#[derive(Clone, Debug, Default)]
pub struct StoreResolver {
    alternatives: Vec<Utf8PathBuf>,
}

impl StoreResolver {
    pub fn new(alternatives: Vec<Utf8PathBuf>) -> Self {
        Self { alternatives }
    }

    pub fn from_config(config: &nxc_config_toml::Store) -> Self {
        Self::new(config.alternative_stores.clone())
    }

    /// The locations that would be searched for `path`, in order.
    pub fn candidates(&self, path: &str) -> Vec<Utf8PathBuf> {
        let local = Utf8Path::new(path)
            .canonicalize_utf8()
            .unwrap_or_else(|_| Utf8PathBuf::from(path));

        let mut candidates = Vec::with_capacity(self.alternatives.len() + 1);
        if local.as_str().starts_with(STORE_PREFIX) {
            let rest = &local.as_str()[NIX_PREFIX.len()..];
            candidates.extend(
                self.alternatives
                    .iter()
                    .map(|alt| Utf8PathBuf::from(format!("{alt}{rest}"))),
            );
        }
        candidates.push(local);
        candidates
    }

    /// Returns the first existing location of `path`.
    pub fn resolve(&self, path: &str) -> Result<Utf8PathBuf, StoreError> {
        let candidates = self.candidates(path);
        for candidate in &candidates {
            if candidate.exists() {
                debug!(%path, resolved = %candidate, "resolved store path");
                return Ok(candidate.clone());
            }
        }

        info!(%path, ?candidates, "store path not found");
        Err(StoreError::NotFound {
            path: path.to_owned(),
            searched: candidates.into_iter().map(String::from).collect(),
        })
    }
}
