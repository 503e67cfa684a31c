#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bh_core::{BlackHoleFs, HANG_NAME, HangOptions};
use bh_fuse::{DispatchMode, MountOptions};
use bh_probe::{DEFAULT_TIMEOUT, MountProbe, ProbeOutcome};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exit status of `probe` when the path did not answer with metadata.
const EXIT_UNRESPONSIVE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Mount(MountArgs),
    Probe(ProbeArgs),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MountArgs {
    mountpoint: PathBuf,
    dispatch: DispatchMode,
    allow_other: bool,
    auto_unmount: bool,
    hang: HangOptions,
}

impl MountArgs {
    fn new(mountpoint: PathBuf) -> Self {
        Self {
            mountpoint,
            dispatch: DispatchMode::PerRequestThread,
            allow_other: false,
            auto_unmount: false,
            hang: HangOptions::default(),
        }
    }

    fn mount_options(&self) -> MountOptions {
        MountOptions {
            allow_other: self.allow_other,
            auto_unmount: self.auto_unmount,
            dispatch: self.dispatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProbeArgs {
    path: PathBuf,
    timeout: Duration,
    json: bool,
}

#[derive(Debug, Serialize)]
struct ProbeReport<'a> {
    path: &'a Path,
    timeout_ms: u64,
    #[serde(flatten)]
    outcome: ProbeOutcome,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let args: Vec<String> = env::args().skip(1).collect();
    match parse_args(&args)? {
        Command::Mount(mount) => mount_cmd(&mount).map(|()| 0),
        Command::Probe(probe) => Ok(probe_cmd(&probe)),
        Command::Help => {
            print_usage();
            Ok(0)
        }
    }
}

fn print_usage() {
    println!("blackhole - a FUSE mount that hangs on purpose\n");
    println!("USAGE:");
    println!("  blackhole [mount] <mountpoint> [-f] [-s] [--allow-other] [--auto-unmount]");
    println!("            [--wake-interval-secs N]");
    println!("  blackhole probe <path> [--timeout-ms N] [--json]");
    println!();
    println!("PATHS:");
    println!("  <mountpoint>/       normal directory");
    println!("  <mountpoint>/{HANG_NAME}   stat never returns");
    println!("  anything else       ENOENT");
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };
    match first.as_str() {
        "mount" => parse_mount(&args[1..]).map(Command::Mount),
        "probe" => parse_probe(&args[1..]).map(Command::Probe),
        "--help" | "-h" | "help" => Ok(Command::Help),
        // Bare `blackhole <mountpoint>`.
        _ => parse_mount(args).map(Command::Mount),
    }
}

fn parse_mount(args: &[String]) -> Result<MountArgs> {
    let mut mountpoint = None;
    let mut dispatch = DispatchMode::PerRequestThread;
    let mut allow_other = false;
    let mut auto_unmount = false;
    let mut hang = HangOptions::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            // Always foreground; accepted for familiarity with FUSE tools.
            "-f" | "--foreground" => {}
            "-s" | "--single-threaded" => dispatch = DispatchMode::Inline,
            "--allow-other" => allow_other = true,
            "--auto-unmount" => auto_unmount = true,
            "--wake-interval-secs" => {
                let Some(value) = iter.next() else {
                    bail!("--wake-interval-secs requires a value");
                };
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("invalid --wake-interval-secs: {value}"))?;
                hang = HangOptions::with_wake_interval(Duration::from_secs(secs));
            }
            flag if flag.starts_with('-') => bail!("unknown mount flag: {flag}"),
            path => {
                if mountpoint.is_some() {
                    bail!("mount takes a single <mountpoint>, got extra argument: {path}");
                }
                mountpoint = Some(PathBuf::from(path));
            }
        }
    }

    let Some(mountpoint) = mountpoint else {
        bail!("mount requires <mountpoint>");
    };
    Ok(MountArgs {
        dispatch,
        allow_other,
        auto_unmount,
        hang,
        ..MountArgs::new(mountpoint)
    })
}

fn parse_probe(args: &[String]) -> Result<ProbeArgs> {
    let mut path = None;
    let mut timeout = DEFAULT_TIMEOUT;
    let mut json = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--timeout-ms" => {
                let Some(value) = iter.next() else {
                    bail!("--timeout-ms requires a value");
                };
                let ms: u64 = value
                    .parse()
                    .with_context(|| format!("invalid --timeout-ms: {value}"))?;
                timeout = Duration::from_millis(ms);
            }
            flag if flag.starts_with('-') => bail!("unknown probe flag: {flag}"),
            other => {
                if path.is_some() {
                    bail!("probe takes a single <path>, got extra argument: {other}");
                }
                path = Some(PathBuf::from(other));
            }
        }
    }

    let Some(path) = path else {
        bail!("probe requires <path>");
    };
    Ok(ProbeArgs {
        path,
        timeout,
        json,
    })
}

fn mount_cmd(args: &MountArgs) -> Result<()> {
    eprintln!(
        "Mounting BlackHole at {} ({:?} dispatch)",
        args.mountpoint.display(),
        args.dispatch
    );
    eprintln!(
        "  stat {} will hang forever; Ctrl+C to stop",
        args.mountpoint.join(HANG_NAME).display()
    );

    let ops = Box::new(BlackHoleFs::with_hang_options(args.hang));
    bh_fuse::mount(ops, &args.mountpoint, &args.mount_options())
        .with_context(|| format!("FUSE mount failed at {}", args.mountpoint.display()))?;
    Ok(())
}

fn describe(outcome: ProbeOutcome, timeout: Duration) -> String {
    match outcome {
        ProbeOutcome::Responsive => "responsive".to_owned(),
        ProbeOutcome::Failed { errno: Some(errno) } => {
            format!("answered with an error (errno {errno})")
        }
        ProbeOutcome::Failed { errno: None } => "answered with an error".to_owned(),
        ProbeOutcome::TimedOut => {
            format!("unresponsive (no answer within {} ms)", timeout.as_millis())
        }
        ProbeOutcome::Saturated => "unresponsive (all probe workers are stuck)".to_owned(),
    }
}

fn probe_cmd(args: &ProbeArgs) -> i32 {
    let outcome = MountProbe::default().check(&args.path, args.timeout);

    if args.json {
        let report = ProbeReport {
            path: &args.path,
            timeout_ms: u64::try_from(args.timeout.as_millis()).unwrap_or(u64::MAX),
            outcome,
        };
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(error) => eprintln!("error: serialize probe report: {error}"),
        }
    } else {
        println!("{}: {}", args.path.display(), describe(outcome, args.timeout));
    }

    if outcome.is_responsive() {
        0
    } else {
        EXIT_UNRESPONSIVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn no_arguments_prints_help() {
        assert_eq!(parse_args(&[]).unwrap(), Command::Help);
        assert_eq!(parse_args(&args(&["--help"])).unwrap(), Command::Help);
    }

    #[test]
    fn bare_mountpoint_mounts_with_defaults() {
        let Command::Mount(mount) = parse_args(&args(&["/tmp/mnt"])).unwrap() else {
            panic!("expected mount");
        };
        assert_eq!(mount, MountArgs::new(PathBuf::from("/tmp/mnt")));
        assert_eq!(mount.dispatch, DispatchMode::PerRequestThread);
        assert_eq!(mount.hang, HangOptions::default());
    }

    #[test]
    fn mount_flags_in_any_position() {
        let Command::Mount(mount) = parse_args(&args(&[
            "mount",
            "-f",
            "-s",
            "/tmp/mnt",
            "--allow-other",
            "--auto-unmount",
            "--wake-interval-secs",
            "0",
        ]))
        .unwrap() else {
            panic!("expected mount");
        };
        assert_eq!(mount.mountpoint, PathBuf::from("/tmp/mnt"));
        assert_eq!(mount.dispatch, DispatchMode::Inline);
        assert!(mount.allow_other);
        assert!(mount.auto_unmount);
        assert_eq!(mount.hang, HangOptions::silent());

        let opts = mount.mount_options();
        assert!(opts.allow_other && opts.auto_unmount);
        assert_eq!(opts.dispatch, DispatchMode::Inline);
    }

    #[test]
    fn mount_rejects_bad_input() {
        for bad in [
            &["mount"][..],
            &["mount", "/a", "/b"],
            &["/a", "--bogus"],
            &["/a", "--wake-interval-secs"],
            &["/a", "--wake-interval-secs", "soon"],
        ] {
            assert!(parse_args(&args(bad)).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn probe_defaults_and_flags() {
        let Command::Probe(probe) = parse_args(&args(&["probe", "/tmp/mnt/hang"])).unwrap() else {
            panic!("expected probe");
        };
        assert_eq!(probe.timeout, DEFAULT_TIMEOUT);
        assert!(!probe.json);

        let Command::Probe(probe) = parse_args(&args(&[
            "probe",
            "--json",
            "/tmp/mnt/hang",
            "--timeout-ms",
            "250",
        ]))
        .unwrap() else {
            panic!("expected probe");
        };
        assert_eq!(probe.path, PathBuf::from("/tmp/mnt/hang"));
        assert_eq!(probe.timeout, Duration::from_millis(250));
        assert!(probe.json);
    }

    #[test]
    fn probe_rejects_bad_input() {
        for bad in [
            &["probe"][..],
            &["probe", "/a", "/b"],
            &["probe", "/a", "--timeout-ms"],
            &["probe", "/a", "--timeout-ms", "-5"],
            &["probe", "/a", "--verbose"],
        ] {
            assert!(parse_args(&args(bad)).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn describe_names_each_outcome() {
        let t = Duration::from_millis(1000);
        assert_eq!(describe(ProbeOutcome::Responsive, t), "responsive");
        assert!(describe(ProbeOutcome::Failed { errno: Some(2) }, t).contains("errno 2"));
        assert!(describe(ProbeOutcome::TimedOut, t).contains("1000 ms"));
        assert!(describe(ProbeOutcome::Saturated, t).contains("stuck"));
    }

    #[test]
    fn probe_report_flattens_outcome() {
        let report = ProbeReport {
            path: Path::new("/tmp/mnt/hang"),
            timeout_ms: 1000,
            outcome: ProbeOutcome::TimedOut,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["path"], "/tmp/mnt/hang");
        assert_eq!(json["timeout_ms"], 1000);
        assert_eq!(json["outcome"], "timed_out");
    }

    #[test]
    fn probe_of_existing_directory_exits_zero() {
        let dir = std::env::temp_dir();
        let code = probe_cmd(&ProbeArgs {
            path: dir,
            timeout: DEFAULT_TIMEOUT,
            json: false,
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn probe_of_missing_path_exits_unresponsive() {
        let code = probe_cmd(&ProbeArgs {
            path: PathBuf::from("/blackhole/definitely/missing"),
            timeout: DEFAULT_TIMEOUT,
            json: true,
        });
        assert_eq!(code, EXIT_UNRESPONSIVE);
    }
}
