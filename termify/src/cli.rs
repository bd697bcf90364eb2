use clap::{Parser, Subcommand, crate_version};
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    /// A verbose structured log format (default).
    #[default]
    Full,
    /// A pretty human-readable log format used for debugging.
    Pretty,
    /// A JSON log format used for machine consumption.
    Json,
}

#[derive(Clone, Debug, Parser)]
pub struct GlobalOptions {
    #[arg(
        long,
        global = true,
        env = "TERMIFY_CONFIG",
        help = "Path to a termify.yaml with engine settings."
    )]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable additional debug logs.")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Silence all logs"
    )]
    pub quiet: bool,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t,
        help = "Log format written to stderr."
    )]
    pub log_format: LogFormat,
}

#[derive(Debug, Parser)]
#[command(
    name = "termify",
    version = crate_version!(),
    color = clap::ColorChoice::Auto,
    about = "Run and attach to persistent terminal sessions."
)]
pub struct Cli {
    #[command(flatten)]
    pub global_options: GlobalOptions,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run one command in a fresh local shell and print its output.")]
    Exec {
        #[arg(long, help = "Working directory of the shell.")]
        cwd: Option<PathBuf>,

        #[arg(long, help = "Give up after this many milliseconds.")]
        timeout_ms: Option<u64>,

        #[arg(
            long,
            help = "Finish on the first quiet period instead of waiting for a prompt."
        )]
        no_prompt: bool,

        #[arg(
            required = true,
            last = true,
            help = "The command line, passed to the shell as typed."
        )]
        command: Vec<String>,
    },

    #[command(about = "Attach this terminal to a local shell session.")]
    Shell {
        #[arg(long, help = "Working directory of the shell.")]
        cwd: Option<PathBuf>,
    },

    #[command(about = "Check that an SSH server accepts the given credentials.")]
    Probe {
        #[arg(long)]
        host: String,

        #[arg(long, default_value_t = 22)]
        port: u16,

        #[arg(long, help = "Login name on the remote host.")]
        user: String,

        #[arg(
            long,
            value_name = "VAR",
            conflicts_with = "key",
            help = "Environment variable holding the password."
        )]
        password_env: Option<String>,

        #[arg(long, value_name = "FILE", help = "Private key file.")]
        key: Option<PathBuf>,

        #[arg(
            long,
            value_name = "VAR",
            requires = "key",
            help = "Environment variable holding the key passphrase."
        )]
        passphrase_env: Option<String>,

        #[arg(
            long,
            value_name = "SHA256:...",
            help = "Refuse servers whose host key has a different fingerprint."
        )]
        fingerprint: Option<String>,
    },
}
