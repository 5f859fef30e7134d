fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Version, target and profile for startup logs and the health endpoint
    if let Err(e) = built::write_built_file() {
        panic!("could not write build metadata: {}", e);
    }
}
