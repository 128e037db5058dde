use std::{
    env,
    process::Command,
    time::{SystemTime, UNIX_EPOCH},
};

const VERSION_VAR: &str = "POOLED_HTTP_VERSION";

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed={VERSION_VAR}");

    // Packagers building from a tarball pin the version explicitly.
    let version = match env::var(VERSION_VAR) {
        Ok(pinned) if !pinned.is_empty() => pinned,
        _ => git_version().unwrap_or_else(|| format!("0.0.0-unknown-{}", timestamp())),
    };

    println!("cargo:rustc-env={VERSION_VAR}={version}");
}

/// `git describe` without the leading `v`; dirty trees get a timestamp suffix.
fn git_version() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())?;
    let described = String::from_utf8(output.stdout).ok()?;
    let described = described.trim();
    let version = described.strip_prefix('v').unwrap_or(described);

    match version {
        "" => None,
        v if v.ends_with("-dirty") => Some(format!("{v}-{}", timestamp())),
        v => Some(v.to_string()),
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
