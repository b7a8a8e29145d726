use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

/// Directories probed for helper binaries before falling back to `PATH`.
///
/// Probes these locations in order:
///   1. `<exe_dir>/`
///   2. `<exe_dir>/bin/`
///   3. `<exe_dir>/../bin/`
///   4. `<cwd>/`
///   5. `<cwd>/bin/`
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

fn path_dirs() -> Vec<PathBuf> {
    env::var_os("PATH")
        .map(|raw| env::split_paths(&raw).collect())
        .unwrap_or_default()
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Locate `binary` next to the executable, in the working directory, or on
/// `PATH`. Paths with more than one component are only checked as given.
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    let as_path = Path::new(binary);
    if as_path.components().count() > 1 {
        return as_path.is_file().then(|| as_path.to_path_buf());
    }

    find_binary_in_dirs(binary, &candidate_bin_dirs())
        .or_else(|| find_binary_in_dirs(binary, &path_dirs()))
}

pub fn command_for(binary: &str) -> ProcessCommand {
    match resolve_binary(binary) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn find_binary_prefers_first_matching_dir() {
        let first = tempdir().expect("tempdir");
        let second = tempdir().expect("tempdir");
        fs::write(second.path().join("sampler"), b"").expect("write second");
        fs::write(first.path().join("sampler"), b"").expect("write first");

        let found = find_binary_in_dirs(
            "sampler",
            &[first.path().to_path_buf(), second.path().to_path_buf()],
        );
        assert_eq!(found, Some(first.path().join("sampler")));
    }

    #[test]
    fn find_binary_ignores_directories_with_the_same_name() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("ffmpeg")).expect("create dir");

        assert_eq!(
            find_binary_in_dirs("ffmpeg", &[dir.path().to_path_buf()]),
            None
        );
    }

    #[test]
    fn explicit_paths_are_not_searched() {
        let dir = tempdir().expect("tempdir");
        let program = dir.path().join("tool");
        assert_eq!(resolve_binary(&program.to_string_lossy()), None);

        fs::write(&program, b"").expect("write tool");
        assert_eq!(resolve_binary(&program.to_string_lossy()), Some(program));
    }
}
