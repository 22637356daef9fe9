//! Embeds the git revision and build time shown by `agentdeck --version`.
//!
//! Either value can be pinned through the environment for reproducible
//! builds; without git the revision reads "unknown".

use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

const GIT_HASH_VAR: &str = "AGENTDECK_BUILD_GIT_HASH";
const TIMESTAMP_VAR: &str = "AGENTDECK_BUILD_TIMESTAMP";

fn main() {
    for var in [GIT_HASH_VAR, TIMESTAMP_VAR] {
        println!("cargo:rerun-if-env-changed={var}");
    }
    if let Some(git_dir) = git(&["rev-parse", "--git-dir"]) {
        println!("cargo:rerun-if-changed={git_dir}/HEAD");
        if let Some(head_ref) = git(&["symbolic-ref", "-q", "HEAD"]) {
            println!("cargo:rerun-if-changed={git_dir}/{head_ref}");
        }
    }

    let revision = env::var(GIT_HASH_VAR)
        .ok()
        .or_else(|| git(&["describe", "--always", "--dirty", "--abbrev=12"]))
        .unwrap_or_else(|| "unknown".to_string());
    let built_at = env::var(TIMESTAMP_VAR).unwrap_or_else(|_| utc_now_rfc3339());

    println!("cargo:rustc-env={GIT_HASH_VAR}={revision}");
    println!("cargo:rustc-env={TIMESTAMP_VAR}={built_at}");
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn utc_now_rfc3339() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (year, month, day) = civil_from_days(days as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
