use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sfetch",
    version,
    about = "Download the most recently modified files of a remote SFTP directory",
    long_about = "`sfetch` connects to an SFTP server, lists a remote directory and downloads the newest files
to a local directory using a fixed number of concurrent transfers.

Connection values can also come from the environment or from a `.env` file in the current
directory (HOST, PORT, SFTP_USER, SFTP_PASSWORD).

EXAMPLE:
    # Download the 20 newest files of /upload into ./inbox with 8 transfers in flight
    sfetch --host sftp.example.com --user alice --remote-dir /upload --max-files 20 --workers 8 --dest-dir inbox --summary

A file that fails to download is logged and skipped; the exit status is non-zero only when the
connection or the directory listing fails."
)]
struct Args {
    // Connection
    /// Server host name or address
    #[arg(long, env = "HOST", help_heading = "Connection")]
    host: Option<String>,

    /// Server port, values that do not parse fall back to 22
    #[arg(long, env = "PORT", value_name = "PORT", help_heading = "Connection")]
    port: Option<String>,

    /// User name to authenticate as
    #[arg(long, env = "SFTP_USER", help_heading = "Connection")]
    user: Option<String>,

    /// Password to authenticate with
    #[arg(long, env = "SFTP_PASSWORD", hide_env_values = true, help_heading = "Connection")]
    password: Option<String>,

    /// Private key to authenticate with instead of a password
    #[arg(long, value_name = "PATH", help_heading = "Connection")]
    identity_file: Option<std::path::PathBuf>,

    /// Passphrase of the private key
    #[arg(long, requires = "identity_file", help_heading = "Connection")]
    identity_passphrase: Option<String>,

    /// Maximum time to establish the connection, including authentication and SFTP startup
    ///
    /// This option accepts a human readable duration, e.g. "500ms", "30s", "1min" etc.
    #[arg(
        long,
        default_value = "30s",
        value_name = "DURATION",
        help_heading = "Connection"
    )]
    connect_timeout: String,

    // Host verification
    /// known_hosts file to verify the server key against (default: ~/.ssh/known_hosts)
    #[arg(long, value_name = "PATH", help_heading = "Host verification")]
    known_hosts: Option<std::path::PathBuf>,

    /// Expected SHA-256 fingerprint of the server key, e.g. "SHA256:nThbg6kX..."
    #[arg(
        long,
        value_name = "FINGERPRINT",
        conflicts_with = "known_hosts",
        help_heading = "Host verification"
    )]
    host_key_fingerprint: Option<String>,

    /// Accept any server key without verification
    ///
    /// This makes the connection vulnerable to man-in-the-middle attacks.
    #[arg(
        long,
        conflicts_with_all = ["known_hosts", "host_key_fingerprint"],
        help_heading = "Host verification"
    )]
    insecure: bool,

    // Download options
    /// Remote directory to download from
    #[arg(long, default_value = common::download::DEFAULT_REMOTE_DIR, value_name = "PATH", help_heading = "Download options")]
    remote_dir: String,

    /// Number of most recently modified files to download
    #[arg(long, default_value = "10", value_name = "N", help_heading = "Download options")]
    max_files: usize,

    /// Number of concurrent transfers
    #[arg(long, default_value = "5", value_name = "N", help_heading = "Download options")]
    workers: usize,

    /// Local directory to write files to, existing files are overwritten
    #[arg(long, default_value = ".", value_name = "PATH", help_heading = "Download options")]
    dest_dir: std::path::PathBuf,

    /// Copy buffer size per transfer, e.g. "32KiB", "1MiB"
    #[arg(long, default_value = "32KiB", value_name = "SIZE", help_heading = "Download options")]
    buffer_size: bytesize::ByteSize,

    /// Do not pre-allocate local files to the remote size before copying
    #[arg(long, help_heading = "Download options")]
    no_preallocate: bool,

    /// Abandon a single file transfer after this long, e.g. "5min" (default: no limit)
    #[arg(long, value_name = "DURATION", help_heading = "Download options")]
    transfer_timeout: Option<String>,

    // Output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: WARN)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
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
}

fn download_settings(args: &Args) -> Result<common::download::Settings> {
    let transfer_timeout = args
        .transfer_timeout
        .as_deref()
        .map(common::config::parse_duration)
        .transpose()
        .context("invalid --transfer-timeout")?;
    let settings = common::download::Settings {
        remote_dir: args.remote_dir.clone(),
        max_files: args.max_files,
        workers: args.workers,
        transfer: common::transfer::Settings {
            dest_dir: args.dest_dir.clone(),
            buffer_size: usize::try_from(args.buffer_size.as_u64())
                .context("--buffer-size does not fit in memory")?,
            preallocate: !args.no_preallocate,
            timeout: transfer_timeout,
        },
    };
    settings.validate().map_err(|error| anyhow!(error))?;
    Ok(settings)
}

fn connect_settings(args: &Args) -> Result<remote::ConnectSettings> {
    let host = args
        .host
        .clone()
        .filter(|host| !host.trim().is_empty())
        .ok_or_else(|| anyhow!("no remote host given, use --host or set HOST"))?;
    let user = args
        .user
        .clone()
        .filter(|user| !user.is_empty())
        .ok_or_else(|| anyhow!("no user name given, use --user or set SFTP_USER"))?;
    let credential = match (&args.identity_file, &args.password) {
        (Some(path), _) => remote::Credential::PrivateKey {
            path: path.clone(),
            passphrase: args.identity_passphrase.clone(),
        },
        (None, Some(password)) => remote::Credential::Password(password.clone()),
        (None, None) => {
            return Err(anyhow!(
                "no credentials given, use --password (or SFTP_PASSWORD) or --identity-file"
            ));
        }
    };
    let host_key_policy = if args.insecure {
        remote::HostKeyPolicy::AcceptAny
    } else if let Some(fingerprint) = &args.host_key_fingerprint {
        remote::HostKeyPolicy::Fingerprint(fingerprint.clone())
    } else {
        remote::HostKeyPolicy::KnownHosts(args.known_hosts.clone())
    };
    Ok(remote::ConnectSettings {
        host: host.trim().to_string(),
        port: common::config::parse_port(args.port.as_deref()),
        user,
        credential,
        timeout: common::config::parse_duration(&args.connect_timeout)
            .context("invalid --connect-timeout")?,
        host_key_policy,
    })
}

#[instrument(skip_all)]
async fn async_main(
    args: Args,
    env_file: std::result::Result<std::path::PathBuf, dotenvy::Error>,
) -> Result<common::BatchReport> {
    match env_file {
        Ok(path) => tracing::debug!("loaded environment from {:?}", path),
        Err(error) if error.not_found() => tracing::debug!("no .env file found"),
        Err(error) => tracing::warn!("failed loading .env file: {}", error),
    }
    let settings = download_settings(&args)?;
    let connect_settings = connect_settings(&args)?;
    let mut connection = remote::connect(&connect_settings).await?;
    match connection.working_dir().await {
        Ok(dir) => tracing::info!("remote working directory: {}", dir),
        Err(error) => tracing::warn!("{:#}", error),
    }
    let result = match connection.fs() {
        Ok(fs) => common::download_files(fs, &settings)
            .await
            .map_err(anyhow::Error::from),
        Err(error) => Err(error),
    };
    connection.close().await;
    let report = result?;
    if !report.is_complete_success() {
        tracing::warn!(
            "{} of {} files failed to download",
            report.files_failed,
            report.files_dispatched
        );
    }
    Ok(report)
}

fn main() -> Result<()> {
    // must run before parsing so that env fallbacks see the file's values
    let env_file = dotenvy::dotenv();
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args, env_file)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
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
