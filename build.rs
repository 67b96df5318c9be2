fn main() {
    println!("cargo:rerun-if-env-changed=WGPANEL_GIT_TAG");

    let build_version = std::env::var("WGPANEL_GIT_TAG")
        .ok()
        .map(|v| v.trim().trim_start_matches('v').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    println!("cargo:rustc-env=WGPANEL_BUILD_VERSION={build_version}");
}
