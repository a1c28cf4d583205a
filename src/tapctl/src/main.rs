//! `tapctl`: the broker/worker control tool (spec §6.4). Talks directly to
//! a worker's `ctl<pid>` socket through `tap-ctl-proto`; does not itself
//! watch the configuration store (that is `blktapctrld`'s job).

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use clap::{Parser, Subcommand};

use tap_ctl_proto::{
    Frame, ListPayload, MsgType, OpenFlags, ParamsPayload, ResponsePayload, CONTROL_DIR,
};
use tap_types::NegErrno;

#[derive(Parser)]
#[command(name = "tapctl", about = "blktap3-style worker control tool")]
struct Cli {
    #[arg(long, default_value = CONTROL_DIR)]
    control_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enumerate known workers (`-p`/`-m`/`-t`/`-f` filter by pid/minor/type/file, currently advisory).
    List {
        #[arg(short = 'p', long)]
        pid: Option<i32>,
        #[arg(short = 'm', long)]
        minor: Option<u32>,
    },
    /// Spawn a bare worker process and print its pid.
    Spawn {
        #[arg(long, default_value = "tapdisk")]
        binary: PathBuf,
    },
    /// Spawn + attach + open in one step.
    Create {
        #[arg(short = 'a', long, value_name = "type:path")]
        arg: String,
        #[arg(short = 'R', long)]
        readonly: bool,
        #[arg(short = 'e', long)]
        minor: Option<u32>,
        #[arg(short = '2', long)]
        secondary: Option<String>,
        #[arg(short = 's', long)]
        standby: bool,
    },
    /// Tear a worker down (force-shutdown + exit).
    Destroy {
        #[arg(short = 'p', long)]
        pid: i32,
        #[arg(short = 'm', long)]
        minor: u32,
        #[arg(short = 't', long)]
        timeout_secs: Option<u64>,
    },
    Attach {
        #[arg(short = 'p', long)]
        pid: i32,
        #[arg(short = 'm', long)]
        minor: u32,
    },
    Detach {
        #[arg(short = 'p', long)]
        pid: i32,
        #[arg(short = 'm', long)]
        minor: u32,
    },
    Open {
        #[arg(short = 'p', long)]
        pid: i32,
        #[arg(short = 'm', long)]
        minor: u32,
        #[arg(short = 'a', long, value_name = "type:path")]
        arg: String,
        #[arg(short = 'R', long)]
        readonly: bool,
    },
    Close {
        #[arg(short = 'p', long)]
        pid: i32,
        #[arg(short = 'm', long)]
        minor: u32,
        #[arg(short = 'f', long)]
        force: bool,
        #[arg(short = 't', long)]
        timeout_secs: Option<u64>,
    },
    Pause {
        #[arg(short = 'p', long)]
        pid: i32,
        #[arg(short = 'm', long)]
        minor: u32,
        #[arg(short = 't', long)]
        timeout_secs: Option<u64>,
    },
    Unpause {
        #[arg(short = 'p', long)]
        pid: i32,
        #[arg(short = 'm', long)]
        minor: u32,
    },
    Stats {
        #[arg(short = 'p', long)]
        pid: i32,
        #[arg(short = 'm', long)]
        minor: u32,
    },
}

fn report(pairs: &[(&str, String)]) {
    if std::io::stdout().is_terminal() {
        for (k, v) in pairs {
            println!("{k:<16} {v}");
        }
    } else {
        let line: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        println!("{}", line.join(" "));
    }
}

fn exit_with(err: NegErrno) -> ! {
    std::process::exit(err.magnitude());
}

fn parse_type_path(s: &str) -> (String, String) {
    match s.split_once(':') {
        Some((t, p)) => (t.to_string(), p.to_string()),
        None => (String::new(), s.to_string()),
    }
}

/// Scans `control_dir` for `ctl<pid>` sockets (same convention as
/// `blktapctrld::CliTapLocator`), used by `list` with no `-p` filter.
fn candidate_pids(control_dir: &PathBuf) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir(control_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name();
            let name = name.to_str()?;
            name.strip_prefix("ctl")?.parse::<i32>().ok()
        })
        .collect()
}

fn call(control_dir: &PathBuf, pid: i32, req: &Frame, timeout: Option<Duration>) -> Frame {
    match tap_ctl_proto::call_typed(control_dir, pid, req, timeout) {
        Ok(resp) => resp,
        Err(e) => exit_with(e),
    }
}

fn response_error(resp: &Frame) -> Option<NegErrno> {
    if resp.msg_type().ok() != Some(MsgType::Error) {
        return None;
    }
    let payload: ResponsePayload = resp.payload_as();
    if payload.error == 0 {
        None
    } else {
        Some(NegErrno::from_raw(payload.error))
    }
}

fn check(resp: &Frame) {
    if let Some(err) = response_error(resp) {
        exit_with(err);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("tapctl: {e}");
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Spawn { binary } => {
            let child = Command::new(binary).spawn()?;
            report(&[("pid", child.id().to_string())]);
        }
        Commands::List { pid, minor } => {
            let pids = match pid {
                Some(pid) => vec![*pid],
                // No `-p`: enumerate every live `ctl<pid>` socket in the
                // control directory, same discovery the broker's
                // `CliTapLocator` uses.
                None => candidate_pids(&cli.control_dir),
            };
            for pid in pids {
                let mut req = Frame::new(MsgType::List, 0);
                req.set_payload(&ListPayload {
                    count: 0,
                    minor: minor.map(|m| m as i32).unwrap_or(-1),
                    state: 0,
                    path: [0u8; tap_ctl_proto::PATH_MAX],
                });
                let Ok(resp) = tap_ctl_proto::call_typed(&cli.control_dir, pid, &req, None) else {
                    continue;
                };
                if response_error(&resp).is_some() {
                    continue;
                }
                let payload: ListPayload = resp.payload_as();
                if let Some(want) = minor {
                    if payload.minor < 0 || payload.minor as u32 != *want {
                        continue;
                    }
                }
                report(&[
                    ("pid", pid.to_string()),
                    ("minor", payload.minor.to_string()),
                    ("state", payload.state.to_string()),
                    ("path", tap_ctl_proto::unpack_path(&payload.path)),
                ]);
            }
        }
        Commands::Create {
            arg,
            readonly,
            minor,
            secondary,
            standby,
        } => {
            let child = Command::new("tapdisk").spawn()?;
            let pid = child.id() as i32;
            // Give the worker a moment to bind its control socket.
            std::thread::sleep(Duration::from_millis(50));

            let minor = minor.unwrap_or(0);
            attach(&cli.control_dir, pid, minor)?;
            open(&cli.control_dir, pid, minor, arg, *readonly, secondary.as_deref(), *standby)?;
            report(&[("pid", pid.to_string()), ("minor", minor.to_string())]);
        }
        Commands::Attach { pid, minor } => {
            attach(&cli.control_dir, *pid, *minor)?;
            report(&[("pid", pid.to_string()), ("minor", minor.to_string())]);
        }
        Commands::Detach { pid, minor } => {
            let req = Frame::new(MsgType::Detach, 0);
            check(&call(&cli.control_dir, *pid, &req, None));
            report(&[("pid", pid.to_string()), ("minor", minor.to_string())]);
        }
        Commands::Open {
            pid,
            minor,
            arg,
            readonly,
        } => {
            open(&cli.control_dir, *pid, *minor, arg, *readonly, None, false)?;
            report(&[("pid", pid.to_string()), ("minor", minor.to_string())]);
        }
        Commands::Close {
            pid,
            minor,
            force,
            timeout_secs,
        } => {
            let timeout = timeout_secs.map(Duration::from_secs);
            let msg = if *force { MsgType::ForceShutdown } else { MsgType::Close };
            let req = Frame::new(msg, 0);
            if *force {
                let _ = tap_ctl_proto::call(&cli.control_dir, *pid, &req, timeout);
            } else {
                check(&call(&cli.control_dir, *pid, &req, timeout));
            }
            report(&[("pid", pid.to_string()), ("minor", minor.to_string())]);
        }
        Commands::Pause { pid, minor, timeout_secs } => {
            let timeout = timeout_secs.map(Duration::from_secs);
            let req = Frame::new(MsgType::Pause, 0);
            check(&call(&cli.control_dir, *pid, &req, timeout));
            report(&[("pid", pid.to_string()), ("minor", minor.to_string())]);
        }
        Commands::Unpause { pid, minor } => {
            let req = Frame::new(MsgType::Resume, 0);
            check(&call(&cli.control_dir, *pid, &req, None));
            report(&[("pid", pid.to_string()), ("minor", minor.to_string())]);
        }
        Commands::Destroy { pid, minor, timeout_secs } => {
            let timeout = timeout_secs.map(Duration::from_secs);
            let close_req = Frame::new(MsgType::Close, 0);
            let _ = tap_ctl_proto::call(&cli.control_dir, *pid, &close_req, timeout);
            let exit_req = Frame::new(MsgType::Exit, 0);
            let _ = tap_ctl_proto::call(&cli.control_dir, *pid, &exit_req, timeout);
            report(&[("pid", pid.to_string()), ("minor", minor.to_string())]);
        }
        Commands::Stats { pid, minor } => {
            let req = Frame::new(MsgType::Stats, 0);
            let resp = call(&cli.control_dir, *pid, &req, None);
            check(&resp);
            let payload: ResponsePayload = resp.payload_as();
            report(&[
                ("pid", pid.to_string()),
                ("minor", minor.to_string()),
                ("stats", tap_ctl_proto::unpack_path(&payload.message)),
            ]);
        }
    }
    Ok(())
}

fn attach(control_dir: &PathBuf, pid: i32, minor: u32) -> anyhow::Result<()> {
    let mut req = Frame::new(MsgType::Attach, 0);
    req.set_payload(&ParamsPayload {
        flags: 0,
        devnum: minor,
        domid: 0,
        path: [0u8; tap_ctl_proto::PATH_MAX],
        prt_devnum: 0,
        secondary: [0u8; tap_ctl_proto::PATH_MAX],
    });
    check(&call(control_dir, pid, &req, None));
    Ok(())
}

fn open(
    control_dir: &PathBuf,
    pid: i32,
    minor: u32,
    type_path: &str,
    readonly: bool,
    secondary: Option<&str>,
    standby: bool,
) -> anyhow::Result<()> {
    let (_ty, path) = parse_type_path(type_path);
    let mut flags = OpenFlags::empty();
    if readonly {
        flags |= OpenFlags::RDONLY;
    }
    let mut secondary_buf = [0u8; tap_ctl_proto::PATH_MAX];
    if let Some(s) = secondary {
        flags |= OpenFlags::SECONDARY;
        if standby {
            flags |= OpenFlags::STANDBY;
        }
        secondary_buf = tap_ctl_proto::pack_path(s);
    }

    let mut req = Frame::new(MsgType::Open, 0);
    req.set_payload(&ParamsPayload {
        flags: flags.bits(),
        devnum: minor,
        domid: 0,
        path: tap_ctl_proto::pack_path(&path),
        prt_devnum: 0,
        secondary: secondary_buf,
    });
    check(&call(control_dir, pid, &req, None));
    Ok(())
}
