// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Environment-module and usage-file rendering

use itertools::Itertools;

use crate::{config::ModuleSettings, environment::Definition};

/// Render the module file for an environment
///
/// Declares a help block (description plus the exposed executables),
/// `module-whatis` tags, one `module load` per configured dependency and a
/// single PATH prepend pointing at the wrapper-script directory.
pub fn render_module(definition: &Definition, executables: &[String], settings: &ModuleSettings) -> String {
    let mut out = String::from("#%Module\n\nproc ModulesHelp { } {\n");

    for line in definition.description.lines() {
        out.push_str(&format!("    puts stderr \"{line}\"\n"));
    }
    out.push_str("    puts stderr \"\"\n");
    for executable in executables {
        out.push_str(&format!("    puts stderr \"   - {executable}\"\n"));
    }
    out.push_str("}\n\n");

    out.push_str(&format!("module-whatis \"Name: {}\"\n", definition.name));
    if !definition.version.is_empty() {
        out.push_str(&format!("module-whatis \"Version: {}\"\n", definition.version));
    }
    out.push_str(&format!(
        "module-whatis \"Packages: {}\"\n",
        definition.packages.iter().map(ToString::to_string).join(", ")
    ));
    out.push('\n');

    for dependency in &settings.dependencies {
        out.push_str(&format!("module load {dependency}\n"));
    }
    if !settings.dependencies.is_empty() {
        out.push('\n');
    }

    out.push_str(&format!(
        "prepend-path PATH \"{}/{}/{}/{}-scripts\"\n",
        settings.scripts_root.display(),
        definition.path,
        definition.name,
        definition.version
    ));

    out
}

/// Render the README published next to the build artifacts
pub fn render_readme(definition: &Definition, executables: &[String], settings: &ModuleSettings) -> String {
    let mut out = format!(
        "# {}\n\n{}\n\nTo use this environment, run:\n\n    module load {}/{}/{}/{}\n",
        definition.full_name(),
        definition.description.trim_end(),
        settings.load_path,
        definition.path,
        definition.name,
        definition.version
    );

    if !executables.is_empty() {
        out.push_str("\nThis will add the following executables to your PATH:\n\n");
        for executable in executables {
            out.push_str(&format!("  - {executable}\n"));
        }
    }

    out
}
