//! Compile time configurations for the util crate
fn main() {
    // the POMONA_PKG_NAME variable is used to create local folders under
    // `~/.local/state` and the runtime directory. Changing it moves where
    // capture artifacts are written.
    println!("cargo::rustc-env=POMONA_PKG_NAME=pomona");
}
