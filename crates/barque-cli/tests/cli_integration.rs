use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

struct CliFixture {
    _tmp: TempDir,
    repo_dir: PathBuf,
    source_dir: PathBuf,
}

impl CliFixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("repo");
        let source_dir = tmp.path().join("source");
        fs::create_dir_all(&source_dir).unwrap();
        Self {
            _tmp: tmp,
            repo_dir,
            source_dir,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_barque"));
        cmd.args(args);
        cmd.env("BK_DIR", &self.repo_dir);
        cmd.env_remove("BK_PASSPHRASE");
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().unwrap()
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "command failed: {args:?}\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}

fn snapshot_name(stdout: &str) -> String {
    // "<name>-<ts>: successfully saved ..."
    stdout
        .lines()
        .find_map(|l| l.split_once(':'))
        .expect("snapshot name in output")
        .0
        .to_string()
}

fn write_source(dir: &Path) {
    fs::create_dir_all(dir.join("docs")).unwrap();
    fs::write(dir.join("readme.md"), b"hello barque").unwrap();
    fs::write(dir.join("docs/notes.txt"), vec![7u8; 8 * 1024]).unwrap();
}

#[test]
fn init_backup_list_restore_fsck() {
    let fx = CliFixture::new();
    write_source(&fx.source_dir);

    fx.run_ok(&["init"]);

    let stdout = fx.run_ok(&[
        "backup",
        "--split-bits",
        "10",
        "docs",
        fx.source_dir.to_str().unwrap(),
    ]);
    let name = snapshot_name(&stdout);

    let listing = fx.run_ok(&["list"]);
    assert!(listing.contains("Total of 1 backups:"), "listing: {listing}");
    assert!(listing.contains(&name));

    let out = fx._tmp.path().join("restored");
    fx.run_ok(&["restore", &name, out.to_str().unwrap()]);
    assert_eq!(fs::read(out.join("readme.md")).unwrap(), b"hello barque");
    assert_eq!(
        fs::read(out.join("docs/notes.txt")).unwrap(),
        vec![7u8; 8 * 1024]
    );

    let fsck = fx.run_ok(&["fsck"]);
    assert!(fsck.contains("0 errors"), "fsck: {fsck}");
}

#[test]
fn uninitialized_repo_is_an_error() {
    let fx = CliFixture::new();
    write_source(&fx.source_dir);
    let output = fx.run(&["backup", "x", fx.source_dir.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not initialized"), "stderr: {stderr}");
}

#[test]
fn missing_bk_dir_is_an_error() {
    let fx = CliFixture::new();
    let mut cmd = fx.command(&["list"]);
    cmd.env_remove("BK_DIR");
    let output = cmd.output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("BK_DIR"), "stderr: {stderr}");
}

#[test]
fn unknown_command_exits_one() {
    let fx = CliFixture::new();
    let output = fx.run(&["frobnicate"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn savebits_restorebits_pipe() {
    let fx = CliFixture::new();
    fx.run_ok(&["init"]);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let mut child = fx
        .command(&["savebits", "pipe"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(&payload).unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    let name = snapshot_name(&String::from_utf8_lossy(&output.stdout));

    let output = fx.run(&["restorebits", &name]);
    assert!(output.status.success());
    assert_eq!(output.stdout, payload);
}

#[test]
fn encrypted_repo_requires_passphrase() {
    let fx = CliFixture::new();
    write_source(&fx.source_dir);

    let mut cmd = fx.command(&["init", "--encrypt"]);
    cmd.env("BK_PASSPHRASE", "hunter2hunter2");
    assert!(cmd.output().unwrap().status.success());

    // Without the passphrase every operation is a configuration error.
    let output = fx.run(&["list"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("BK_PASSPHRASE"), "stderr: {stderr}");

    // With it, a full cycle works.
    let mut cmd = fx.command(&[
        "backup",
        "--split-bits",
        "10",
        "secure",
        fx.source_dir.to_str().unwrap(),
    ]);
    cmd.env("BK_PASSPHRASE", "hunter2hunter2");
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let name = snapshot_name(&String::from_utf8_lossy(&output.stdout));

    let out = fx._tmp.path().join("restored");
    let mut cmd = fx.command(&["restore", &name, out.to_str().unwrap()]);
    cmd.env("BK_PASSPHRASE", "hunter2hunter2");
    assert!(cmd.output().unwrap().status.success());
    assert_eq!(fs::read(out.join("readme.md")).unwrap(), b"hello barque");
}
