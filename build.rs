//! Build script for portshift
//!
//! Embeds build-time information (git commit, dirty status, build timestamp).

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
