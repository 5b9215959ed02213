//! Boundary helpers for the Yocto build environment.
//!
//! The build itself is driven externally; this module covers the points
//! where the rig touches it: importing a recipe's exported variables into
//! the process environment for the duration of a scope, resetting the build
//! configuration files between exclusive build steps, and carving
//! partitions out of built images on the controlling host.

use crate::error::{Error, Result};
use crate::remote::session::run_local;
use log::debug;
use regex::Regex;
use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Scoped override of process environment variables.
///
/// Snapshots the previous values on construction and restores all of them
/// when dropped, on every exit path. `PATH` is treated specially: the new
/// value is prepended and the old `PATH` kept at the end, so the build's
/// tools win lookups without losing the host's.
pub struct EnvOverride {
    saved: Vec<(String, Option<OsString>)>,
}

impl EnvOverride {
    /// Applies the given variable set to the process environment.
    pub fn apply<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut saved = Vec::new();

        for (key, value) in vars {
            saved.push((key.clone(), env::var_os(&key)));

            if key == "PATH" {
                let merged = match env::var_os("PATH") {
                    Some(old) => {
                        let mut merged = OsString::from(value);
                        merged.push(":");
                        merged.push(old);
                        merged
                    }
                    None => OsString::from(value),
                };
                env::set_var(&key, merged);
            } else {
                env::set_var(&key, value);
            }
        }

        debug!("applied {} environment overrides", saved.len());
        Self { saved }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        // Restore in reverse so repeated keys end up at their original value.
        for (key, old) in self.saved.drain(..).rev() {
            match old {
                Some(value) => env::set_var(&key, value),
                None => env::remove_var(&key),
            }
        }
    }
}

/// Parses `VAR="value"` lines from a captured build-environment dump.
///
/// With `export_only`, only `export VAR="value"` lines are taken. The
/// dumped environment omits `MACHINE` on some setups; `UPDATER_MACHINE` is
/// exported as a stand-in and copied over when present.
pub fn parse_exported_variables(
    output: &str,
    export_only: bool,
) -> Result<HashMap<String, String>> {
    let pattern = if export_only {
        r#"^export ([A-Za-z][^=]*)="(.*)"$"#
    } else {
        r#"^(?:export )?([A-Za-z][^=]*)="(.*)"$"#
    };
    let matcher =
        Regex::new(pattern).map_err(|e| Error::Config(format!("bad variable pattern: {}", e)))?;

    let mut vars = HashMap::new();
    for line in output.lines() {
        if let Some(caps) = matcher.captures(line.trim()) {
            vars.insert(caps[1].to_string(), caps[2].to_string());
        }
    }

    if !vars.contains_key("MACHINE") {
        if let Some(machine) = vars.get("UPDATER_MACHINE").cloned() {
            vars.insert("MACHINE".to_string(), machine);
        }
    }

    Ok(vars)
}

// Construct the config paths the same way everywhere.

pub fn local_conf_path(build_dir: &Path) -> PathBuf {
    build_dir.join("conf").join("local.conf")
}

pub fn local_conf_orig_path(build_dir: &Path) -> PathBuf {
    build_dir.join("conf").join("local.conf.orig")
}

pub fn bblayers_conf_path(build_dir: &Path) -> PathBuf {
    build_dir.join("conf").join("bblayers.conf")
}

pub fn bblayers_conf_orig_path(build_dir: &Path) -> PathBuf {
    build_dir.join("conf").join("bblayers.conf.orig")
}

fn append_marked_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(Error::Io)?;
    writeln!(file, "\n## ADDED BY TEST\n{}", line).map_err(Error::Io)?;
    Ok(())
}

/// Appends a configuration line to `local.conf` before a build.
pub fn append_to_local_conf(build_dir: &Path, line: &str) -> Result<()> {
    append_marked_line(&local_conf_path(build_dir), line)
}

/// Appends a layer line to `bblayers.conf` before a build.
pub fn append_to_bblayers_conf(build_dir: &Path, line: &str) -> Result<()> {
    append_marked_line(&bblayers_conf_path(build_dir), line)
}

/// Restores the pristine build configuration from the `.orig` snapshots.
///
/// With `full_cleanup`, the snapshots themselves are removed as well.
pub fn reset_build_conf(build_dir: &Path, full_cleanup: bool) -> Result<()> {
    let pairs = [
        (local_conf_orig_path(build_dir), local_conf_path(build_dir)),
        (
            bblayers_conf_orig_path(build_dir),
            bblayers_conf_path(build_dir),
        ),
    ];

    for (orig, conf) in pairs {
        if orig.exists() {
            fs::copy(&orig, &conf).map_err(Error::Io)?;
            if full_cleanup {
                fs::remove_file(&orig).map_err(Error::Io)?;
            }
        }
    }

    Ok(())
}

/// Extracts partition `number` of a partitioned image into
/// `dst/img<number>.fs`, using `fdisk` offsets and `dd` on the controlling
/// host.
pub fn extract_partition(img: &Path, number: u32, dst: &Path) -> Result<()> {
    let listing = run_local(
        &format!("fdisk -l -o device,start,end {}", img.display()),
        true,
    )?;

    let needle = format!("img{}", number);
    let mut span = None;

    for line in listing.stdout.lines() {
        if !line.contains(&needle) {
            continue;
        }
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let start = fields.next().and_then(|s| s.parse::<u64>().ok());
        let end = fields.next().and_then(|s| s.parse::<u64>().ok());
        if let (Some(start), Some(end)) = (start, end) {
            span = Some((start, end + 1));
        }
    }

    let (start, end) = span.ok_or_else(|| {
        Error::Config(format!(
            "partition {} not found in {}",
            number,
            img.display()
        ))
    })?;

    run_local(
        &format!(
            "dd if={} of={}/img{}.fs skip={} count={}",
            img.display(),
            dst.display(),
            number,
            start,
            end - start
        ),
        true,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_env_override_sets_and_restores() {
        let key = "OTARIG_TEST_ENV_OVERRIDE";
        env::remove_var(key);

        {
            let _guard = EnvOverride::apply([(key.to_string(), "on".to_string())]);
            assert_eq!(env::var(key).unwrap(), "on");
        }

        assert!(env::var_os(key).is_none());
    }

    #[test]
    fn test_env_override_restores_previous_value() {
        let key = "OTARIG_TEST_ENV_PREVIOUS";
        env::set_var(key, "before");

        {
            let _guard = EnvOverride::apply([(key.to_string(), "during".to_string())]);
            assert_eq!(env::var(key).unwrap(), "during");
        }

        assert_eq!(env::var(key).unwrap(), "before");
        env::remove_var(key);
    }

    #[test]
    fn test_parse_exported_variables() {
        let output = r#"
export BUILDDIR="/work/build"
IMAGE_FSTYPES="ext4 sdimg"
# a comment line
not a variable
export PATH="/work/bin"
"#;

        let all = parse_exported_variables(output, false).unwrap();
        assert_eq!(all.get("BUILDDIR").unwrap(), "/work/build");
        assert_eq!(all.get("IMAGE_FSTYPES").unwrap(), "ext4 sdimg");
        assert_eq!(all.get("PATH").unwrap(), "/work/bin");

        let exported = parse_exported_variables(output, true).unwrap();
        assert!(exported.contains_key("BUILDDIR"));
        assert!(!exported.contains_key("IMAGE_FSTYPES"));
    }

    #[test]
    fn test_machine_falls_back_to_updater_machine() {
        let output = r#"UPDATER_MACHINE="qemux86-64""#;
        let vars = parse_exported_variables(output, false).unwrap();
        assert_eq!(vars.get("MACHINE").unwrap(), "qemux86-64");
    }

    #[test]
    fn test_reset_build_conf_restores_snapshot() {
        let dir = TempDir::new().unwrap();
        let conf_dir = dir.path().join("conf");
        fs::create_dir_all(&conf_dir).unwrap();

        fs::write(local_conf_path(dir.path()), "modified\n").unwrap();
        fs::write(local_conf_orig_path(dir.path()), "pristine\n").unwrap();

        reset_build_conf(dir.path(), false).unwrap();
        assert_eq!(
            fs::read_to_string(local_conf_path(dir.path())).unwrap(),
            "pristine\n"
        );
        assert!(local_conf_orig_path(dir.path()).exists());

        reset_build_conf(dir.path(), true).unwrap();
        assert!(!local_conf_orig_path(dir.path()).exists());
    }

    #[test]
    fn test_append_to_local_conf_marks_additions() {
        let dir = TempDir::new().unwrap();
        let conf_dir = dir.path().join("conf");
        fs::create_dir_all(&conf_dir).unwrap();
        fs::write(local_conf_path(dir.path()), "BASE = \"1\"\n").unwrap();

        append_to_local_conf(dir.path(), "EXTRA_FEATURE = \"1\"").unwrap();

        let contents = fs::read_to_string(local_conf_path(dir.path())).unwrap();
        assert!(contents.contains("## ADDED BY TEST"));
        assert!(contents.contains("EXTRA_FEATURE = \"1\""));
        assert!(contents.starts_with("BASE = \"1\"\n"));
    }
}
