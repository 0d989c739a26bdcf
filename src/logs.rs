//! Deterministic log file pairs for subprocess output.
//!
//! Every subprocess this crate launches writes its standard output and
//! standard error to a pair of files under `<build_dir>/logs`. The file names
//! derive from an operation tag so that failures can point at concrete paths
//! instead of embedding process output in error messages.

use std::fmt;
use std::fs::File;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Sub-directory of the build directory that receives log files.
pub const LOG_DIR_NAME: &str = "logs";

/// Paths to the stdout and stderr capture files of one operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogPaths {
    /// File receiving standard output.
    pub out: Utf8PathBuf,
    /// File receiving standard error.
    pub err: Utf8PathBuf,
}

impl LogPaths {
    /// Builds the log pair for `name` under `build_dir`.
    ///
    /// Characters that are unsafe in file names (path separators, spaces,
    /// shell metacharacters) are replaced with `_`, so names derived from
    /// copy sources or destinations stay inside the log directory. When any
    /// character had to change, a hash of the original name is appended so
    /// distinct names never share a log pair.
    #[must_use]
    pub fn new(build_dir: &Utf8Path, name: &str) -> Self {
        let stem = sanitise(name);
        let dir = build_dir.join(LOG_DIR_NAME);
        Self {
            out: dir.join(format!("{stem}-out.txt")),
            err: dir.join(format!("{stem}-err.txt")),
        }
    }

    /// Creates (truncating) both log files and returns writable handles.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the log directory cannot be created or a
    /// file cannot be opened for writing.
    pub fn create(&self) -> io::Result<(File, File)> {
        Ok((create_file(&self.out)?, create_file(&self.err)?))
    }
}

impl fmt::Display for LogPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stdout in '{}', stderr in '{}'", self.out, self.err)
    }
}

fn create_file(path: &Utf8Path) -> io::Result<File> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{path} has no parent"))
    })?;
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{path} has no file name"))
    })?;
    Dir::create_ambient_dir_all(parent, ambient_authority())?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok(dir.create(file_name)?.into_std())
}

fn sanitise(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if !trimmed.is_empty() && trimmed == name {
        return trimmed.to_owned();
    }
    let stem = if trimmed.is_empty() { "unnamed" } else { trimmed };
    if name.is_empty() {
        stem.to_owned()
    } else {
        format!("{stem}-{:08x}", fnv1a(name))
    }
}

// 32-bit FNV-1a.
fn fnv1a(name: &str) -> u32 {
    name.bytes().fold(0x811c_9dc5, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("connection-blade-001-port-22", "connection-blade-001-port-22")]
    #[case("copy-to-/etc/hosts-/tmp/x", "copy-to-_etc_hosts-_tmp_x-25e1739a")]
    #[case("../escape", "_escape-0796e859")]
    #[case("", "unnamed")]
    fn log_names_stay_inside_the_log_directory(#[case] name: &str, #[case] stem: &str) {
        let paths = LogPaths::new(Utf8Path::new("/build"), name);
        assert_eq!(paths.out, Utf8PathBuf::from(format!("/build/logs/{stem}-out.txt")));
        assert_eq!(paths.err, Utf8PathBuf::from(format!("/build/logs/{stem}-err.txt")));
    }

    #[rstest]
    #[case("copy-to-a b", "copy-to-a_b")]
    #[case("run-x/y", "run-x_y")]
    #[case("..", "unnamed")]
    fn names_that_clean_to_the_same_stem_get_distinct_logs(
        #[case] unsafe_name: &str,
        #[case] clean_name: &str,
    ) {
        let build_dir = Utf8Path::new("/build");
        let first = LogPaths::new(build_dir, unsafe_name);
        let second = LogPaths::new(build_dir, clean_name);
        assert_ne!(first, second);
        assert_eq!(first, LogPaths::new(build_dir, unsafe_name));
    }

    #[test]
    fn create_makes_the_log_directory() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let build_dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()));
        let paths = LogPaths::new(&build_dir, "run-echo-blade-001");

        paths.create().expect("log files should be created");

        assert!(paths.out.is_file(), "missing {}", paths.out);
        assert!(paths.err.is_file(), "missing {}", paths.err);
    }

    #[test]
    fn display_names_both_files() {
        let paths = LogPaths::new(Utf8Path::new("/b"), "x");
        assert_eq!(
            paths.to_string(),
            "stdout in '/b/logs/x-out.txt', stderr in '/b/logs/x-err.txt'"
        );
    }
}
