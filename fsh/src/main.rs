use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fsh",
    version,
    about = "Run commands and copy files on many hosts at once over SSH",
    long_about = "`fsh` runs the same operation on a fleet of hosts concurrently, one SSH session per host.

Files are moved with the scp protocol, so the remote side only needs a shell and `scp`.

EXAMPLES:
    # Run a command everywhere
    fsh --host web1 --host deploy@web2:2222 run uptime

    # Copy a directory to the first and third host only
    fsh --host web1 --host web2 --host web3 --only 0,2 upload ./conf /etc/app/conf

    # Fetch a log from every host (saved as app.log0, app.log1, ...)
    fsh --host web1 --host web2 download /var/log/app.log ./app.log

    # Edit a remote file in place
    fsh --host web1 replace /etc/app.conf 'debug=true' 'debug=false'"
)]
struct Args {
    // Hosts
    /// Host to operate on, as `[user@]host[:port]` (can be specified multiple times)
    ///
    /// Hosts are numbered from 0 in the order given; see --only.
    #[arg(long = "host", value_name = "HOST", required = true, action = clap::ArgAction::Append, value_parser = remote::HostDescriptor::parse, help_heading = "Hosts")]
    hosts: Vec<remote::HostDescriptor>,

    /// Private key used to authenticate with every host
    #[arg(short = 'i', long, value_name = "PATH", help_heading = "Hosts")]
    identity: Option<std::path::PathBuf>,

    /// Only operate on the hosts with these indices (comma separated)
    #[arg(long, value_name = "INDICES", value_delimiter = ',', help_heading = "Hosts")]
    only: Vec<usize>,

    // Session options
    /// Keep one SSH session per host open for the whole run
    #[arg(long, help_heading = "Session options")]
    sticky: bool,

    /// Give up connecting to a host after this long
    ///
    /// This option accepts a human readable duration, e.g. "500ms", "10s", "1min" etc.
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Session options")]
    connect_timeout: Option<std::time::Duration>,

    /// Copy program started on the remote hosts
    #[arg(long, default_value = "scp", value_name = "PROGRAM", help_heading = "Session options")]
    scp_program: String,

    /// Remote path scripts are uploaded to before they run
    #[arg(long, default_value = "/tmp/fleet-script", value_name = "PATH", help_heading = "Session options")]
    script_path: String,

    // Progress & output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run a shell command on every host
    ///
    /// A single argument is handed to the remote shell as-is, so pipes and
    /// redirections work when quoted: `fsh ... run 'dmesg | tail'`. Several
    /// arguments are quoted word by word and run as one simple command.
    Run {
        /// Command to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Upload a local script, make it executable and run it
    Script {
        /// Local script file
        path: std::path::PathBuf,
    },
    /// Copy a local file or directory to every host
    Upload {
        local: std::path::PathBuf,
        remote: String,
    },
    /// Copy a remote file or directory from every host
    ///
    /// The local path gets the host index appended, e.g. `out0`, `out1`.
    Download {
        remote: String,
        local: std::path::PathBuf,
    },
    /// Replace every occurrence of a string in a remote text file
    Replace {
        remote: String,
        from: String,
        to: String,
    },
}

impl Command {
    /// Whether the remote output is worth showing.
    fn shows_output(&self) -> bool {
        matches!(self, Command::Run { .. } | Command::Script { .. })
    }
}

fn client_config(args: &Args) -> remote::ClientConfig {
    remote::ClientConfig {
        sticky: args.sticky,
        scp_program: args.scp_program.clone(),
        script_path: args.script_path.clone(),
        connect_timeout: args.connect_timeout,
    }
}

/// Builds the remote command line from the `run` arguments.
fn command_line(words: &[String]) -> String {
    if let [line] = words {
        return line.clone();
    }
    words
        .iter()
        .map(|word| {
            let plain = !word.is_empty()
                && word
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
            if plain {
                word.clone()
            } else {
                remote::shell_escape(word)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_output(prefix: &str, response: &remote::Response) {
    for line in response.stdout.lines() {
        println!("{prefix} {line}");
    }
    for line in response.stderr.lines() {
        eprintln!("{prefix} {line}");
    }
}

struct HostSinks {
    results: async_channel::Receiver<remote::Response>,
    errors: async_channel::Receiver<remote::Error>,
}

#[instrument]
async fn async_main(args: Args) -> Result<()> {
    let config = client_config(&args);
    let mut hosts = Vec::with_capacity(args.hosts.len());
    let mut sinks = Vec::with_capacity(args.hosts.len());
    for descriptor in &args.hosts {
        let mut descriptor = descriptor.clone();
        if let Some(identity) = &args.identity {
            descriptor = descriptor.with_credential(remote::Credential::KeyFile(identity.clone()));
        }
        // every host delivers exactly one outcome
        let (result_tx, result_rx) = async_channel::bounded(1);
        let (error_tx, error_rx) = async_channel::bounded(1);
        let client = remote::HostClient::ssh(descriptor, config.clone());
        hosts.push(remote::Host::new(Arc::new(client), result_tx, error_tx));
        sinks.push(HostSinks {
            results: result_rx,
            errors: error_rx,
        });
    }
    let fleet = remote::Fleet::new(hosts);
    let targets = if args.only.is_empty() {
        remote::Targets::All
    } else {
        remote::Targets::Only(args.only.clone())
    };
    let dispatch = match &args.command {
        Command::Run { command } => fleet.run(&targets, &command_line(command))?,
        Command::Script { path } => fleet.run_script(&targets, path)?,
        Command::Upload { local, remote } => fleet.upload(&targets, local, remote)?,
        Command::Download { remote, local } => fleet.download(&targets, remote, local)?,
        Command::Replace { remote, from, to } => {
            let (from, to) = (from.clone(), to.clone());
            fleet.run_on_file(
                &targets,
                remote,
                Arc::new(move |content: String| content.replace(&from, &to)),
            )?
        }
    };
    let started = dispatch.len();
    dispatch.join().await;
    let mut failed = 0;
    for (index, (host, sink)) in fleet.hosts().iter().zip(&sinks).enumerate() {
        let prefix = format!("[{index} {}]", host.client.host());
        if let Ok(response) = sink.results.try_recv() {
            if args.command.shows_output() {
                print_output(&prefix, &response);
            } else {
                println!("{prefix} done");
            }
        } else if let Ok(error) = sink.errors.try_recv() {
            failed += 1;
            if let Some(response) = error.response() {
                print_output(&prefix, response);
            }
            tracing::error!("{prefix} {error}");
        }
    }
    if args.sticky {
        for host in fleet.hosts() {
            if let Err(error) = host.client.close_session().await {
                tracing::warn!("failed closing session to {}: {error}", host.client.host());
            }
        }
    }
    if failed > 0 {
        return Err(anyhow!("{failed} of {started} hosts failed"));
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_and_indices_are_parsed() {
        let args = Args::try_parse_from([
            "fsh",
            "--host",
            "web1",
            "--host",
            "deploy@web2:2222",
            "--only",
            "1,0",
            "--connect-timeout",
            "1500ms",
            "run",
            "ls",
            "-la",
        ])
        .unwrap();
        assert_eq!(args.hosts.len(), 2);
        assert_eq!(args.hosts[1].user.as_deref(), Some("deploy"));
        assert_eq!(args.hosts[1].port, 2222);
        assert_eq!(args.only, vec![1, 0]);
        assert_eq!(
            args.connect_timeout,
            Some(std::time::Duration::from_millis(1500))
        );
        match &args.command {
            Command::Run { command } => assert_eq!(command_line(command), "ls -la"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn config_follows_flags() {
        let args = Args::try_parse_from([
            "fsh",
            "--host",
            "web1",
            "--sticky",
            "--scp-program",
            "/usr/bin/scp",
            "download",
            "/var/log/syslog",
            "./syslog",
        ])
        .unwrap();
        let config = client_config(&args);
        assert!(config.sticky);
        assert_eq!(config.scp_program, "/usr/bin/scp");
        assert_eq!(config.script_path, "/tmp/fleet-script");
        assert!(!args.command.shows_output());
    }

    #[test]
    fn run_arguments_keep_their_quoting() {
        let words = |words: &[&str]| words.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        assert_eq!(command_line(&words(&["echo", "a  b"])), "echo 'a  b'");
        assert_eq!(command_line(&words(&["echo", "it's", ""])), r"echo 'it'\''s' ''");
        assert_eq!(command_line(&words(&["dmesg | tail -n 5"])), "dmesg | tail -n 5");
        assert_eq!(
            remote::shell_split(&command_line(&words(&["printf", "%s\n", "$HOME", "x y"]))),
            Some(words(&["printf", "%s\n", "$HOME", "x y"]))
        );
    }

    #[test]
    fn host_is_required() {
        assert!(Args::try_parse_from(["fsh", "run", "true"]).is_err());
        assert!(Args::try_parse_from(["fsh", "--host", "a@b@c", "run", "true"]).is_err());
    }
}
