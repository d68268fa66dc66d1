//! Installer running `R CMD INSTALL` and `R CMD check`.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{Installer, InstallerRun};
use crate::progress::ProgressParser;

/// Packages bundled with every R installation.
pub const R_CORE_PACKAGES: &[&str] = &[
    "base",
    "boot",
    "class",
    "cluster",
    "codetools",
    "compiler",
    "datasets",
    "foreign",
    "graphics",
    "grDevices",
    "grid",
    "KernSmooth",
    "lattice",
    "MASS",
    "Matrix",
    "methods",
    "mgcv",
    "nlme",
    "nnet",
    "parallel",
    "rpart",
    "spatial",
    "splines",
    "stats",
    "stats4",
    "survival",
    "tcltk",
    "tools",
    "utils",
];

pub struct RCmdInstaller {
    program: PathBuf,
}

impl RCmdInstaller {
    /// `program` is the `R` executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Runs `R CMD <args>`, copying its output to `log` and parsing it as a
    /// progress log. Returns the run and whether the process exited cleanly.
    ///
    /// The process runs in the directory of `log`, which is where R leaves
    /// its `<package>.Rcheck` output.
    #[tracing::instrument(skip(self, args, library_paths))]
    async fn run(
        &self,
        args: Vec<OsString>,
        log: &Path,
        library_paths: &[PathBuf],
    ) -> Result<(InstallerRun, bool)> {
        let r_libs = env::join_paths(library_paths).context("Invalid library path")?;
        let work_dir = match log.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;
        let mut log_file = tokio::fs::File::create(log)
            .await
            .with_context(|| format!("Failed to create log {}", log.display()))?;

        let mut child = Command::new(&self.program)
            .arg("CMD")
            .args(&args)
            .current_dir(work_dir)
            .env("R_LIBS", &r_libs)
            .env("LANGUAGE", "en")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program.display()))?;

        let stdout = child.stdout.take().context("Missing stdout pipe")?;
        let mut stderr = child.stderr.take().context("Missing stderr pipe")?;
        let errors = tokio::spawn(async move {
            let mut text = String::new();
            if let Err(e) = stderr.read_to_string(&mut text).await {
                warn!("Failed to read error output: {}", e);
            }
            text
        });

        let mut parser = ProgressParser::new();
        let mut progress = Vec::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read output")? {
            log_file.write_all(line.as_bytes()).await?;
            log_file.write_all(b"\n").await?;
            progress.extend(parser.push_line(&line));
        }

        let status = child.wait().await.context("Failed to wait for R")?;
        let errors = errors.await.unwrap_or_default();
        if !errors.is_empty() {
            log_file.write_all(errors.as_bytes()).await?;
            for line in errors.lines() {
                progress.extend(parser.push_line(line));
            }
        }
        progress.extend(parser.finish());
        log_file.flush().await?;

        debug!("R CMD {:?} exited with {}", args.first(), status);
        let run = InstallerRun {
            succeeded: parser.is_done(),
            progress,
            counts: parser.counts().clone(),
        };
        Ok((run, status.success()))
    }
}

fn library_arg(library: &Path) -> OsString {
    let mut arg = OsString::from("--library=");
    arg.push(library);
    arg
}

#[async_trait]
impl Installer for RCmdInstaller {
    async fn install_package(
        &self,
        source: &Path,
        library: &Path,
        log: &Path,
        library_paths: &[PathBuf],
    ) -> Result<InstallerRun> {
        info!("Installing {} into {}", source.display(), library.display());
        let args = vec![
            OsString::from("INSTALL"),
            OsString::from("--no-multiarch"),
            OsString::from("--no-lock"),
            library_arg(library),
            source.as_os_str().to_owned(),
        ];

        let (mut run, exited_cleanly) = self.run(args, log, library_paths).await?;
        run.succeeded = run.succeeded && exited_cleanly;
        Ok(run)
    }

    async fn check_package(
        &self,
        source: &Path,
        installed_library: &Path,
        install_log: &Path,
        check_log: &Path,
        library_paths: &[PathBuf],
    ) -> Result<InstallerRun> {
        info!("Checking {}", source.display());
        let mut install = OsString::from("--install=check:");
        install.push(install_log);
        let args = vec![
            OsString::from("check"),
            OsString::from("--no-multiarch"),
            OsString::from("--no-manual"),
            OsString::from("--no-build-vignettes"),
            install,
            library_arg(installed_library),
            source.as_os_str().to_owned(),
        ];

        let (mut run, exited_cleanly) = self.run(args, check_log, library_paths).await?;
        run.succeeded = exited_cleanly;
        Ok(run)
    }

    fn core_package_names(&self) -> Vec<String> {
        R_CORE_PACKAGES.iter().map(|name| name.to_string()).collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::progress::ProgressStatus;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn fake_r(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("R");
        std::fs::write(&path, format!("#!/bin/sh\n{script}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_install_reports_progress_and_library_paths() {
        let dir = tempdir().unwrap();
        let program = fake_r(
            dir.path(),
            "echo \"* installing *source* package 'zoo' ...\"\n\
             echo '** libs'\n\
             echo \"R_LIBS=$R_LIBS\"\n\
             echo '* DONE (zoo)'\n",
        );
        let installer = RCmdInstaller::new(program);
        let log = dir.path().join("logs/install.log");

        let run = installer
            .install_package(
                Path::new("/src/zoo"),
                Path::new("/lib/3"),
                &log,
                &[PathBuf::from("/lib/1"), PathBuf::from("/lib/2")],
            )
            .await
            .unwrap();

        assert!(run.succeeded);
        assert_eq!(run.progress.len(), 1);
        assert_eq!(run.progress[0].lines, vec!["R_LIBS=/lib/1:/lib/2"]);
        assert_eq!(run.progress[0].levels[1], "libs");
        assert!(std::fs::read_to_string(&log).unwrap().contains("* DONE (zoo)"));
    }

    #[tokio::test]
    async fn test_install_without_done_marker_fails() {
        let dir = tempdir().unwrap();
        let program = fake_r(
            dir.path(),
            "echo \"* installing *source* package 'zoo' ...\"\n\
             echo 'ERROR: compilation failed for package zoo' >&2\n\
             exit 1\n",
        );
        let installer = RCmdInstaller::new(program);

        let run = installer
            .install_package(
                Path::new("/src/zoo"),
                Path::new("/lib/3"),
                &dir.path().join("install.log"),
                &[],
            )
            .await
            .unwrap();

        assert!(!run.succeeded);
        assert_eq!(run.progress.len(), 1);
        assert!(run.progress[0].lines[0].starts_with("ERROR: compilation failed"));
    }

    #[tokio::test]
    async fn test_check_counts_statuses() {
        let dir = tempdir().unwrap();
        let program = fake_r(
            dir.path(),
            "echo '* checking for file zoo/DESCRIPTION ... OK'\n\
             echo '* checking R code for possible problems ... NOTE'\n\
             echo 'plot.zoo: no visible binding for global variable x'\n\
             echo '* checking examples ... ERROR'\n\
             echo '* DONE'\n\
             exit 1\n",
        );
        let installer = RCmdInstaller::new(program);

        let run = installer
            .check_package(
                Path::new("/src/zoo"),
                Path::new("/lib/3"),
                Path::new("/logs/3/install.log"),
                &dir.path().join("check.log"),
                &[],
            )
            .await
            .unwrap();

        assert!(!run.succeeded);
        assert_eq!(run.counts.get(ProgressStatus::Note), 1);
        assert_eq!(run.counts.get(ProgressStatus::Error), 1);
        assert_eq!(run.counts.get(ProgressStatus::Ok), 1);
        assert_eq!(run.progress.len(), 2);
    }

    #[tokio::test]
    async fn test_runs_in_the_log_directory() {
        let dir = tempdir().unwrap();
        let program = fake_r(
            dir.path(),
            "echo \"cwd=$(pwd -P)\"\n\
             mkdir zoo.Rcheck\n\
             echo '* DONE'\n",
        );
        let installer = RCmdInstaller::new(program);
        let first = dir.path().join("checks/7-0/check.log");
        let second = dir.path().join("checks/7-1/check.log");

        for log in [&first, &second] {
            let run = installer
                .check_package(
                    Path::new("/src/zoo"),
                    Path::new("/lib/3"),
                    Path::new("/logs/3/install.log"),
                    log,
                    &[],
                )
                .await
                .unwrap();
            assert!(run.succeeded);
        }

        for log in [&first, &second] {
            let run_dir = log.parent().unwrap().canonicalize().unwrap();
            let output = std::fs::read_to_string(log).unwrap();
            assert!(output.contains(&format!("cwd={}", run_dir.display())), "{output}");
            assert!(run_dir.join("zoo.Rcheck").is_dir());
        }
    }

    #[test]
    fn test_core_packages_include_recommended() {
        let names = RCmdInstaller::new("R").core_package_names();
        assert!(names.contains(&"stats".to_string()));
        assert!(names.contains(&"Matrix".to_string()));
    }
}
