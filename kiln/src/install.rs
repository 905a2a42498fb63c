// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Local installation of module files and wrapper-script trees
//!
//! Two outputs under two configured roots: the rendered module text at
//! `<module_root>/<path>/<name>/<version>` and a scripts directory at
//! `<scripts_root>/<path>/<name>/<version>-scripts/` holding the built
//! image plus one wrapper symlink per exposed executable. Every created
//! file and every directory from the root down to the leaf ends up mode
//! 0755. A failure part-way removes everything this call created.

use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use fs_err as fs;
use nix::unistd::{AccessFlags, access};
use path_clean::PathClean;
use thiserror::Error;
use tracing::warn;

use crate::{catalog::IMAGE_BASENAME, config::ModuleSettings};

/// World readable + executable, group and owner writable
const WORLD_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
pub struct Installer {
    module_root: PathBuf,
    scripts_root: PathBuf,
    wrapper_script: PathBuf,
}

impl Installer {
    pub fn new(settings: &ModuleSettings) -> Self {
        Self {
            module_root: settings.module_root.clone(),
            scripts_root: settings.scripts_root.clone(),
            wrapper_script: settings.wrapper_script.clone(),
        }
    }

    /// Materialize the module file, image and wrapper symlinks for an
    /// environment. On any error every path created by this call is removed.
    pub fn install(
        &self,
        path: &str,
        name: &str,
        version: &str,
        module_file: &str,
        image: &Path,
        executables: &[String],
    ) -> Result<(), Error> {
        let mut created = Vec::new();

        let result = self.install_inner(path, name, version, module_file, image, executables, &mut created);
        if result.is_err() {
            rollback(&created);
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn install_inner(
        &self,
        path: &str,
        name: &str,
        version: &str,
        module_file: &str,
        image: &Path,
        executables: &[String],
        created: &mut Vec<PathBuf>,
    ) -> Result<(), Error> {
        let module_leaf = resolve(&self.module_root, &[path, name, version])?;
        let scripts_dir = resolve(&self.scripts_root, &[path, name, &format!("{version}-scripts")])?;

        let module_dir = module_leaf.parent().expect("module leaf is under the root");
        create_tree(&self.module_root, module_dir, created)?;
        write_new(&module_leaf, module_file.as_bytes(), created)?;

        create_tree(&self.scripts_root, &scripts_dir, created)?;

        let image_dest = scripts_dir.join(IMAGE_BASENAME);
        copy_new(image, &image_dest, created)?;

        for executable in executables {
            let link = scripts_dir.join(executable);
            fs::os::unix::fs::symlink(&self.wrapper_script, &link)?;
            created.push(link);
        }

        Ok(())
    }

    /// Remove an installed environment's module file and scripts directory
    pub fn uninstall(&self, path: &str, name: &str, version: &str) -> Result<(), Error> {
        let module_leaf = resolve(&self.module_root, &[path, name, version])?;
        let scripts_dir = resolve(&self.scripts_root, &[path, name, &format!("{version}-scripts")])?;

        fs::remove_file(module_leaf)?;
        fs::remove_dir_all(scripts_dir)?;

        Ok(())
    }

    /// Refuse removal up front when a target directory lacks write access
    pub fn ensure_writable(&self, path: &str, name: &str, version: &str) -> Result<(), Error> {
        let module_dir = resolve(&self.module_root, &[path, name])?;
        let scripts_dir = resolve(&self.scripts_root, &[path, name, &format!("{version}-scripts")])?;

        for dir in [module_dir, scripts_dir] {
            if dir.exists() {
                access(&dir, AccessFlags::W_OK).map_err(|_| Error::NotWritable(dir))?;
            }
        }

        Ok(())
    }
}

/// Join request-supplied components beneath a root, refusing results that
/// escape it after normalization
fn resolve(root: &Path, parts: &[&str]) -> Result<PathBuf, Error> {
    let mut leaf = root.to_path_buf();
    for part in parts {
        leaf.push(part);
    }
    let leaf = leaf.clean();

    if !leaf.starts_with(root) || leaf == root {
        return Err(Error::OutsideRoot {
            root: root.to_owned(),
            leaf,
        });
    }

    Ok(leaf)
}

/// Create each missing directory between `root` and `dir`, then set 0755 on
/// the whole chain including the root
fn create_tree(root: &Path, dir: &Path, created: &mut Vec<PathBuf>) -> Result<(), Error> {
    let relative = dir.strip_prefix(root).expect("target resolved under root");

    set_mode(root)?;

    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        if !current.exists() {
            fs::create_dir(&current)?;
            created.push(current.clone());
        }
        set_mode(&current)?;
    }

    Ok(())
}

/// Exclusive-create the file, so a concurrent or repeated install fails
/// rather than clobbering
fn write_new(path: &Path, contents: &[u8], created: &mut Vec<PathBuf>) -> Result<(), Error> {
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    created.push(path.to_owned());

    io::Write::write_all(&mut file, contents)?;
    set_mode(path)?;

    Ok(())
}

fn copy_new(source: &Path, dest: &Path, created: &mut Vec<PathBuf>) -> Result<(), Error> {
    let mut out = fs::OpenOptions::new().write(true).create_new(true).open(dest)?;
    created.push(dest.to_owned());

    let mut source = fs::File::open(source)?;
    io::copy(&mut source, &mut out)?;
    set_mode(dest)?;

    Ok(())
}

fn set_mode(path: &Path) -> Result<(), Error> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(WORLD_MODE))?;
    Ok(())
}

/// Best-effort removal of freshly created paths, deepest first
fn rollback(created: &[PathBuf]) {
    for path in created.iter().rev() {
        let result = if path.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };

        if let Err(error) = result {
            warn!("failed to clean up {}: {error}", path.display());
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("install target {leaf:?} escapes root {root:?}")]
    OutsideRoot { root: PathBuf, leaf: PathBuf },
    #[error("no write access to {0:?}")]
    NotWritable(PathBuf),
    #[error("io")]
    Io(#[from] io::Error),
}
