use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Offline-first caching proxy",
    long_about = "Drives the precache engine against a real origin.\n\
                  \n\
                  Resources listed in a build manifest are staged into a versioned\n\
                  partition and promoted atomically. Cached resources are served from\n\
                  a file-backed partition store and stay available while offline."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Cache name prefix shared by every partition
    #[arg(long, global = true, default_value = "precache", help = "Prefix of every partition name")]
    pub prefix: String,

    /// Version of the application being cached
    #[arg(
        long = "version-tag",
        global = true,
        default_value = "0",
        help = "Application version; selects the staging partition"
    )]
    pub version_tag: String,

    /// Build manifest JSON file
    #[arg(
        short,
        long,
        global = true,
        help = "Path to the resource manifest JSON ({\"path\": {\"name\", \"size\", \"hash\"}})"
    )]
    pub manifest: Option<PathBuf>,

    /// Origin the resources are served from
    #[arg(
        short,
        long,
        global = true,
        default_value = "http://localhost/",
        help = "Origin URL; manifest paths are resolved against it"
    )]
    pub origin: String,

    /// Directory holding the partitions
    #[arg(
        short,
        long,
        global = true,
        default_value = "./precache",
        help = "Directory where cache partitions are stored"
    )]
    pub store_dir: PathBuf,

    /// Attempts per resource
    #[arg(long, global = true, default_value = "3", help = "Maximum fetch attempts per resource")]
    pub max_attempts: u32,

    /// Delay between attempts with optional unit (ms, s, m)
    #[arg(
        long,
        global = true,
        default_value = "500ms",
        help = "Delay between fetch attempts with optional unit (ms, s, m, h, d). Examples: \"500ms\", \"2s\""
    )]
    pub retry_delay: String,

    /// Per-attempt timeout
    #[arg(
        long,
        global = true,
        help = "Abort a single fetch attempt after this duration. Examples: \"30s\", \"2m\""
    )]
    pub attempt_timeout: Option<String>,

    /// Runtime entry lifetime
    #[arg(
        long,
        global = true,
        default_value = "7d",
        help = "Lifetime of runtime-cached media. Examples: \"7d\", \"12h\""
    )]
    pub runtime_ttl: String,

    /// Runtime partition capacity
    #[arg(
        long,
        global = true,
        default_value = "50",
        help = "Maximum number of runtime-cached media entries"
    )]
    pub runtime_max_entries: usize,

    /// Overall HTTP timeout in seconds
    #[arg(long, global = true, default_value = "0", help = "Overall HTTP request timeout in seconds (0 = none)")]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(long, global = true, default_value = "30", help = "HTTP connection timeout in seconds")]
    pub connect_timeout: u64,

    /// Custom HTTP headers
    #[arg(
        short = 'H',
        long = "header",
        global = true,
        help = "Add custom HTTP header (format: 'Name: Value'). Can be used multiple times."
    )]
    pub headers: Vec<String>,

    /// Proxy server URL
    #[arg(long, global = true, help = "Upstream proxy server URL (e.g., \"http://proxy.example.com:8080\")")]
    pub proxy: Option<String>,

    /// Proxy type
    #[arg(
        long,
        global = true,
        default_value = "http",
        help = "Proxy type: http, https, socks5 or all"
    )]
    pub proxy_type: String,

    /// Proxy username
    #[arg(long, global = true, help = "Username for proxy authentication")]
    pub proxy_user: Option<String>,

    /// Proxy password
    #[arg(long, global = true, help = "Password for proxy authentication")]
    pub proxy_pass: Option<String>,

    /// Use system proxy settings
    #[arg(long, global = true, help = "Use system proxy settings if available")]
    pub use_system_proxy: bool,

    /// Disable all proxies
    #[arg(long, global = true, conflicts_with = "proxy", help = "Disable all proxy settings")]
    pub no_proxy: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Show progress bars
    #[arg(
        short = 'P',
        long = "progress",
        global = true,
        help = "Show a progress bar for every resource being fetched"
    )]
    pub show_progress: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stage the manifest into a new version and activate it
    Install {
        /// Stop after staging; leave the live version untouched
        #[arg(long)]
        stage_only: bool,
    },

    /// Request one resource through the proxy
    Get {
        /// Path relative to the origin, e.g. "assets/logo.png"
        path: String,

        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,

        /// Write the response body to this file
        #[arg(short = 'O', long)]
        output: Option<PathBuf>,
    },

    /// Fetch every manifest resource that is not cached yet
    DownloadOffline,

    /// List partitions with entry counts and sizes
    Partitions {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Expire and trim the runtime media partition
    Sweep,
}
