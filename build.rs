//! Build script for pfguard
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! printed by `pfguard version`.

fn main() {
    // Re-run build if the default pfctl location is overridden by packagers
    println!("cargo:rerun-if-env-changed=PFGUARD_SYSTEM_PFCTL_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
