//! Build script for fleetplane
//! Stamps the binary with commit, build time and target triple

use std::process::Command;

use chrono::Utc;

fn git(args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn main() {
    let git_hash = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let build_time = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=FLEETPLANE_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=FLEETPLANE_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=FLEETPLANE_TARGET={}", target);

    println!("cargo:rerun-if-changed=.git/HEAD");
}
