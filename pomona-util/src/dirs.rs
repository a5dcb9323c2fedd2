use std::io;
use std::path::PathBuf;

/// Return the application runtime directory
///
/// This is where short lived files such as capture artifacts go. Falls
/// back to the state directory on systems without `XDG_RUNTIME_DIR`.
pub fn runtime_dir() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        return runtime_dir.join(env!("POMONA_PKG_NAME"));
    }
    state_dir()
}

/// Return the application state directory
pub fn state_dir() -> PathBuf {
    let dir = if let Some(state_dir) = dirs::state_dir() {
        state_dir
    } else {
        // Fallback to home directory if state dir is not available
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local")
            .join("state")
    };
    dir.join(env!("POMONA_PKG_NAME"))
}

/// Make sure the runtime directory exists and return its path
pub fn ensure_runtime_dir() -> io::Result<PathBuf> {
    let dir = runtime_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
