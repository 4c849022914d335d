use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::error;
use rocker::config::{
    CGROUP_ROOT, DEFAULT_HOSTNAME, DEFAULT_PIDS_MAX, DEFAULT_ROOTFS, GROUP_PREFIX,
};
use rocker::gate::GateSink;
use rocker::{
    CgroupConfig, HostIsolation, IsolationConfig, LaunchPolicy, LaunchRequest, RootSwitch,
    run_container, run_isolated,
};

#[derive(Parser)]
#[command(name = "rocker")]
#[command(about = "A minimal container runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program in new hostname, pid and mount namespaces
    Run {
        #[command(flatten)]
        isolation: IsolationArgs,
        /// Maximum number of live processes in the container
        #[arg(long, default_value_t = DEFAULT_PIDS_MAX)]
        pids_max: u32,
        #[arg(long, default_value = CGROUP_ROOT)]
        cgroup_root: PathBuf,
        /// Prefix of the per-launch cgroup name
        #[arg(long, default_value = GROUP_PREFIX)]
        cgroup_name: String,
        /// Abort if the process ceiling cannot be written
        #[arg(long)]
        strict_limits: bool,
        /// Kill the container after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<OsString>,
    },
    #[command(name = "isolated-child", hide = true)]
    IsolatedChild {
        #[command(flatten)]
        isolation: IsolationArgs,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<OsString>,
    },
}

#[derive(Args)]
struct IsolationArgs {
    #[arg(long, default_value = DEFAULT_ROOTFS)]
    rootfs: PathBuf,
    #[arg(long, default_value = DEFAULT_HOSTNAME)]
    hostname: String,
    /// Use pivot_root instead of chroot
    #[arg(long)]
    pivot_root: bool,
}

impl From<IsolationArgs> for IsolationConfig {
    fn from(args: IsolationArgs) -> Self {
        Self {
            rootfs: args.rootfs,
            hostname: args.hostname,
            root_switch: if args.pivot_root {
                RootSwitch::PivotRoot
            } else {
                RootSwitch::Chroot
            },
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run {
            isolation,
            pids_max,
            cgroup_root,
            cgroup_name,
            strict_limits,
            timeout,
            command,
        } => {
            let cgroup = CgroupConfig {
                root: cgroup_root,
                group_prefix: cgroup_name,
                strict: strict_limits,
            };
            let policy = LaunchPolicy {
                pids_max,
                timeout: timeout.map(Duration::from_secs),
            };
            match run_container(isolation.into(), cgroup, policy, command) {
                Ok(code) => code,
                Err(e) => {
                    error!("{}", e);
                    e.exit_code()
                }
            }
        }
        Commands::IsolatedChild { isolation, command } => {
            isolated_child(isolation.into(), command)
        }
    };

    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn isolated_child(isolation: IsolationConfig, command: Vec<OsString>) -> i32 {
    let sink = match GateSink::inherited() {
        Ok(sink) => sink,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    let request = match LaunchRequest::from_argv(command) {
        Ok(request) => request,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };

    match run_isolated(sink, &isolation, &request, &mut HostIsolation) {
        Ok(never) => match never {},
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}
