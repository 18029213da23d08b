use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keyserver")]
#[command(about = "Issues RSA key pairs with X.509 certificates over TCP")]
pub struct Cli {
    /// Configuration file to use instead of the platform default
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the issuing server
    ///
    /// Examples:
    ///   keyserver serve
    ///   keyserver serve --bind 0.0.0.0:9000 --threads 8
    Serve {
        /// Address to listen on (overrides bind_addr from the config)
        #[arg(short, long)]
        bind: Option<String>,
        /// Number of key generation workers (overrides worker_threads)
        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// Request a key pair and certificate from a running server
    ///
    /// Prints both PEM documents, or writes public_key.pem and
    /// certificate.pem when --out-dir is given.
    ///
    /// Example: keyserver request 127.0.0.1:8080 alice
    Request {
        /// Server address (e.g., 127.0.0.1:8080)
        address: String,
        /// Subject common name to request
        name: String,
        /// Directory to write the PEM files into
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
        /// Seconds to wait for the server to answer
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },

    /// Issuer key management commands
    Issuer {
        #[command(subcommand)]
        command: IssuerCommand,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum IssuerCommand {
    /// Generate the issuer signing key at the configured path
    Generate {
        /// RSA modulus size in bits
        #[arg(long, default_value_t = 4096)]
        bits: usize,
        /// Overwrite an existing key
        #[arg(long)]
        force: bool,
    },
    /// Show the issuer name, key path and key size
    Info,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the configuration file path
    Path,
    /// Print the effective configuration
    Show,
}
