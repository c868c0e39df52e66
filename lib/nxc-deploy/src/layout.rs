// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Paths of the files a run reads and writes inside an environment
//! directory.
//!
//! ```text
//! <envdir>/
//! ├── nxc.toml
//! ├── build/<composition>::<flavour>          compose info (build output)
//! ├── deploy/<composition>::<flavour>.json    deployment descriptor
//! └── artifact/<composition>/<flavour>/
//!     └── kexec_scripts/kexec[_<role>].sh
//! ```

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

pub const DEPLOY_DIR: &str = "deploy";
pub const BUILD_DIR: &str = "build";
pub const ARTIFACT_DIR: &str = "artifact";
pub const KEXEC_SCRIPTS_DIR: &str = "kexec_scripts";

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("no deployment files found in {0}")]
    NoDeployments(Utf8PathBuf),

    #[error("{0} is not a file")]
    NotAFile(Utf8PathBuf),

    #[error("deployment file {name} not found (also looked in {dir})")]
    NotFound { name: String, dir: Utf8PathBuf },

    #[error("failed to read {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The run-scoped paths for one composition and flavour.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvLayout {
    envdir: Utf8PathBuf,
    composition: String,
    flavour: String,
}

impl EnvLayout {
    pub fn new(
        envdir: impl Into<Utf8PathBuf>,
        composition: impl Into<String>,
        flavour: impl Into<String>,
    ) -> Self {
        Self {
            envdir: envdir.into(),
            composition: composition.into(),
            flavour: flavour.into(),
        }
    }

    pub fn envdir(&self) -> &Utf8Path {
        &self.envdir
    }

    pub fn composition(&self) -> &str {
        &self.composition
    }

    pub fn flavour(&self) -> &str {
        &self.flavour
    }

    /// `<composition>::<flavour>`, the stem shared by build outputs and
    /// deployment files.
    pub fn composition_flavour_prefix(&self) -> String {
        format!("{}::{}", self.composition, self.flavour)
    }

    pub fn config_file(&self) -> Utf8PathBuf {
        self.envdir.join(nxc_config_toml::CONFIG_FILE_NAME)
    }

    pub fn build_dir(&self) -> Utf8PathBuf {
        self.envdir.join(BUILD_DIR)
    }

    pub fn compose_info_file(&self) -> Utf8PathBuf {
        self.build_dir().join(self.composition_flavour_prefix())
    }

    pub fn deploy_dir(&self) -> Utf8PathBuf {
        self.envdir.join(DEPLOY_DIR)
    }

    /// The deployment file's path relative to the environment directory.
    /// This is also where a content server serving the environment
    /// directory exposes it.
    pub fn deployment_file_relative(&self) -> String {
        format!("{DEPLOY_DIR}/{}.json", self.composition_flavour_prefix())
    }

    pub fn deployment_file(&self) -> Utf8PathBuf {
        self.envdir.join(self.deployment_file_relative())
    }

    pub fn artifact_dir(&self) -> Utf8PathBuf {
        self.envdir
            .join(ARTIFACT_DIR)
            .join(&self.composition)
            .join(&self.flavour)
    }

    pub fn kexec_scripts_dir(&self) -> Utf8PathBuf {
        self.artifact_dir().join(KEXEC_SCRIPTS_DIR)
    }
}

/// Picks the deployment file to consume.
///
/// With no name, this is the most recently created file in
/// `<envdir>/deploy`. A name is tried first as a path, then relative to
/// `<envdir>/deploy`.
pub fn find_deployment_file(
    envdir: &Utf8Path,
    name: Option<&str>,
) -> Result<Utf8PathBuf, LayoutError> {
    let deploy_dir = envdir.join(DEPLOY_DIR);
    let Some(name) = name else {
        return latest_deployment_file(&deploy_dir);
    };

    for candidate in [Utf8PathBuf::from(name), deploy_dir.join(name)] {
        if candidate.exists() {
            if !candidate.is_file() {
                return Err(LayoutError::NotAFile(candidate));
            }
            return Ok(candidate);
        }
    }

    Err(LayoutError::NotFound { name: name.to_owned(), dir: deploy_dir })
}

fn latest_deployment_file(
    deploy_dir: &Utf8Path,
) -> Result<Utf8PathBuf, LayoutError> {
    let io_err =
        |source| LayoutError::Io { path: deploy_dir.to_path_buf(), source };

    let mut latest: Option<(SystemTime, Utf8PathBuf)> = None;
    for entry in deploy_dir.read_dir_utf8().map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let meta = entry.metadata().map_err(io_err)?;
        if !meta.is_file() {
            continue;
        }

        // Not every filesystem records creation time.
        let stamp = meta.created().or_else(|_| meta.modified()).map_err(io_err)?;
        if latest.as_ref().map_or(true, |(t, _)| stamp > *t) {
            latest = Some((stamp, entry.into_path()));
        }
    }

    latest
        .map(|(_, path)| path)
        .ok_or_else(|| LayoutError::NoDeployments(deploy_dir.to_path_buf()))
}

/// Creates `dir` and its parents if it does not exist yet. Newly created
/// directories get `mode`.
pub(crate) fn ensure_dir(dir: &Utf8Path, mode: u32) -> std::io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    info!(path = %dir, "create");
    fs::DirBuilder::new().recursive(true).mode(mode).create(dir)
}

/// Replaces the contents of `path` by writing a sibling file and renaming it
/// into place, so readers never observe a partially written file.
pub(crate) fn write_replace(
    path: &Utf8Path,
    contents: &[u8],
    mode: u32,
) -> std::io::Result<()> {
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{path} has no file name"),
        )
    })?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn paths() {
        let layout = EnvLayout::new("/home/u/env", "webserver", "vm-ramdisk");
        assert_eq!(layout.composition_flavour_prefix(), "webserver::vm-ramdisk");
        assert_eq!(
            layout.deployment_file(),
            "/home/u/env/deploy/webserver::vm-ramdisk.json"
        );
        assert_eq!(
            layout.deployment_file_relative(),
            "deploy/webserver::vm-ramdisk.json"
        );
        assert_eq!(
            layout.compose_info_file(),
            "/home/u/env/build/webserver::vm-ramdisk"
        );
        assert_eq!(
            layout.kexec_scripts_dir(),
            "/home/u/env/artifact/webserver/vm-ramdisk/kexec_scripts"
        );
        assert_eq!(layout.config_file(), "/home/u/env/nxc.toml");
    }

    #[test]
    fn write_replace_overwrites_and_sets_mode() {
        let (_guard, dir) = utf8_tempdir();
        let path = dir.join("script.sh");

        write_replace(&path, b"first", 0o755).unwrap();
        write_replace(&path, b"second", 0o755).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(!dir.join(".script.sh.tmp").exists());
    }

    #[test]
    fn ensure_dir_creates_parents() {
        let (_guard, dir) = utf8_tempdir();
        let nested = dir.join("artifact/c/f/kexec_scripts");
        ensure_dir(&nested, 0o700).unwrap();
        assert!(nested.is_dir());
        // Idempotent.
        ensure_dir(&nested, 0o700).unwrap();
    }

    #[test]
    fn find_deployment_file_by_name_and_latest() {
        let (_guard, dir) = utf8_tempdir();
        let deploy = dir.join(DEPLOY_DIR);

        assert!(matches!(
            find_deployment_file(&dir, None),
            Err(LayoutError::Io { .. })
        ));

        fs::create_dir(&deploy).unwrap();
        assert!(matches!(
            find_deployment_file(&dir, None),
            Err(LayoutError::NoDeployments(_))
        ));

        fs::write(deploy.join("a::vm.json"), "{}").unwrap();
        assert_eq!(
            find_deployment_file(&dir, None).unwrap(),
            deploy.join("a::vm.json")
        );

        assert_eq!(
            find_deployment_file(&dir, Some("a::vm.json")).unwrap(),
            deploy.join("a::vm.json")
        );
        let absolute = deploy.join("a::vm.json");
        assert_eq!(
            find_deployment_file(&dir, Some(absolute.as_str())).unwrap(),
            absolute
        );
        assert!(matches!(
            find_deployment_file(&dir, Some("missing.json")),
            Err(LayoutError::NotFound { .. })
        ));
    }
}
