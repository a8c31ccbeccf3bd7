// SPDX-License-Identifier: MPL-2.0

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=PANO_RIG_VERSION");

    // packagers set the version explicitly
    let version = std::env::var("PANO_RIG_VERSION").unwrap_or_else(|_| git_version());
    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

/// `git describe` output without the `v` prefix, or the crate version
/// when no repository is available
fn git_version() -> String {
    let described = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty", "--match", "v*"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string());

    match described {
        Some(version) => version.strip_prefix('v').unwrap_or(&version).to_string(),
        None => env!("CARGO_PKG_VERSION").to_string(),
    }
}
