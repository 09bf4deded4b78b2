fn main() {
    // Embed the build timestamp for version banners
    let stamp = chrono::Utc::now().to_rfc3339();
    println!("cargo:rustc-env=BUILD_DATE={stamp}");
}
