use crate::crypto::issuer::{self, DEFAULT_ISSUER_NAME};
use crate::crypto::storage::{self, ISSUER_KEY_FILE};
use crate::crypto::{Authority, Issuer, KeyIssuer, MAX_VALIDITY_DAYS};
use crate::issuance::IssuancePool;
use crate::network::protocol::{DEFAULT_MAX_NAME_LEN, DEFAULT_READ_TIMEOUT};
use crate::network::{Client, IssuedBundle, Server, WireConfig};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const MIN_KEY_BITS: usize = 1024;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the server listens on
    pub bind_addr: String,
    /// Number of key generation workers
    pub worker_threads: usize,
    /// Issuer distinguished name (RFC 4514)
    pub issuer_name: String,
    /// PEM file holding the issuer RSA private key
    pub issuer_key_path: PathBuf,
    /// Modulus size of generated subject keys
    pub key_bits: usize,
    /// Certificate lifetime
    pub validity_days: u32,
    /// Seconds a client gets to send its request line
    pub read_timeout_secs: u64,
    /// Longest accepted subject name in bytes
    pub max_name_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        let issuer_key_path = storage::default_issuer_key_path()
            .unwrap_or_else(|_| PathBuf::from(ISSUER_KEY_FILE));
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            worker_threads: 4,
            issuer_name: DEFAULT_ISSUER_NAME.to_string(),
            issuer_key_path,
            key_bits: 8192,
            validity_days: 365,
            read_timeout_secs: DEFAULT_READ_TIMEOUT.as_secs(),
            max_name_len: DEFAULT_MAX_NAME_LEN,
        }
    }
}

impl Config {
    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        storage::project_dirs()
            .map(|proj_dirs| proj_dirs.data_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))
    }

    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        storage::project_dirs()
            .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
    }

    /// Get the default config file path
    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default file, creating it if it doesn't exist
    pub fn load_or_create_default() -> Result<Self> {
        Self::load_or_create(&Self::default_config_file()?)
    }

    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            info!("Created default configuration at {}", path.display());
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, content).context("Failed to write configuration file")?;
        Ok(())
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            bail!("worker_threads must be at least 1");
        }
        if self.key_bits < MIN_KEY_BITS {
            bail!(
                "key_bits must be at least {}, got {}",
                MIN_KEY_BITS,
                self.key_bits
            );
        }
        if self.validity_days == 0 || self.validity_days > MAX_VALIDITY_DAYS {
            bail!(
                "validity_days must be between 1 and {}, got {}",
                MAX_VALIDITY_DAYS,
                self.validity_days
            );
        }
        if self.max_name_len == 0 {
            bail!("max_name_len must be at least 1");
        }
        if self.read_timeout_secs == 0 {
            bail!("read_timeout_secs must be at least 1");
        }
        issuer::parse_name(&self.issuer_name)?;
        Ok(())
    }

    pub fn wire_config(&self) -> WireConfig {
        WireConfig {
            max_name_len: self.max_name_len,
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            ..WireConfig::default()
        }
    }
}

/// Main application state
pub struct App {
    /// Application configuration
    pub config: Config,
    /// Where the configuration was loaded from
    pub config_path: PathBuf,
}

impl App {
    /// Load the configuration from `config_path`, or the platform default
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let (config, config_path) = match config_path {
            Some(path) => (Config::load_or_create(&path), path),
            None => (
                Config::load_or_create_default(),
                Config::default_config_file()?,
            ),
        };
        let config = config.context("Failed to initialize configuration")?;
        Ok(App {
            config,
            config_path,
        })
    }

    /// Load the issuer and wrap it in an authority using the configured key size
    pub fn authority(&self) -> Result<Authority> {
        let issuer = Issuer::load(&self.config.issuer_name, &self.config.issuer_key_path)
            .with_context(|| {
                format!(
                    "Failed to load issuer key from {} (run 'keyserver issuer generate' first)",
                    self.config.issuer_key_path.display()
                )
            })?;
        Ok(Authority::new(
            issuer,
            self.config.key_bits,
            self.config.validity_days,
        ))
    }

    /// Handle the 'serve' command
    pub async fn handle_serve(&mut self, bind: Option<String>, threads: Option<usize>) -> Result<()> {
        if let Some(bind) = bind {
            self.config.bind_addr = bind;
        }
        if let Some(threads) = threads {
            self.config.worker_threads = threads;
        }
        self.config.validate().context("Invalid configuration")?;

        let authority = self.authority()?;
        info!(
            "Issuer {} ({}-bit key), issuing {}-bit keys valid for {} days",
            authority.issuer().name(),
            authority.issuer().key_bits(),
            authority.key_bits(),
            authority.validity_days()
        );

        let issuer: Arc<dyn KeyIssuer> = Arc::new(authority);
        let pool = Arc::new(IssuancePool::start(issuer, self.config.worker_threads));
        let server = Server::bind(&self.config.bind_addr, pool, self.config.wire_config()).await?;
        server.run().await
    }

    /// Handle the 'request' command
    pub async fn handle_request(
        &self,
        address: &str,
        name: &str,
        out_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<IssuedBundle> {
        let client = Client::new(crate::network::client::CLIENT_CONNECT_TIMEOUT, timeout);
        let bundle = client
            .request(address, name)
            .await
            .with_context(|| format!("Request for '{}' to {} failed", name, address))?;

        match out_dir {
            Some(dir) => {
                let (key_path, cert_path) = bundle
                    .save(dir)
                    .with_context(|| format!("Failed to write PEM files to {}", dir.display()))?;
                println!("Public key:  {}", key_path.display());
                println!("Certificate: {}", cert_path.display());
            }
            None => {
                print!("{}", bundle.public_key_pem);
                println!();
                print!("{}", bundle.certificate_pem);
            }
        }
        Ok(bundle)
    }

    /// Handle the 'issuer generate' command
    pub fn handle_issuer_generate(&self, bits: usize, force: bool) -> Result<()> {
        if bits < MIN_KEY_BITS {
            bail!("Issuer key must be at least {} bits", MIN_KEY_BITS);
        }
        let key_path = &self.config.issuer_key_path;
        if key_path.exists() {
            if !force {
                bail!(
                    "An issuer key already exists at {} (use --force to overwrite)",
                    key_path.display()
                );
            }
            warn!("Overwriting existing issuer key at {}", key_path.display());
        }

        info!("Generating {}-bit issuer key...", bits);
        let key = Issuer::generate_key(bits)?;
        let pem = Issuer::key_to_pem(&key)?;
        storage::save_key_secure(key_path, pem.as_bytes())?;

        println!("Issuer key written to {}", key_path.display());
        Ok(())
    }

    /// Handle the 'issuer info' command
    pub fn handle_issuer_info(&self) -> Result<()> {
        let authority = self.authority()?;
        println!("Issuer name: {}", authority.issuer().name());
        println!("Key path:    {}", self.config.issuer_key_path.display());
        println!("Key size:    {} bits", authority.issuer().key_bits());
        Ok(())
    }

    /// Handle the 'config show' command
    pub fn handle_config_show(&self) -> Result<()> {
        let content =
            toml::to_string_pretty(&self.config).context("Failed to serialize configuration")?;
        println!("# {}", self.config_path.display());
        print!("{}", content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn app_in(temp_dir: &TempDir) -> App {
        let mut app = App::new(Some(temp_dir.path().join("config.toml"))).unwrap();
        app.config.issuer_key_path = temp_dir.path().join("keys").join("issuer.pem");
        app
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.issuer_name, "CN=FATSUN");
        assert_eq!(config.key_bits, 8192);
        assert_eq!(config.validity_days, 365);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("worker_threads = 16\n").unwrap();
        assert_eq!(config.worker_threads, 16);
        assert_eq!(config.bind_addr, Config::default().bind_addr);
    }

    #[test]
    fn test_config_validation() {
        let invalid = [
            Config {
                worker_threads: 0,
                ..Config::default()
            },
            Config {
                key_bits: 512,
                ..Config::default()
            },
            Config {
                validity_days: 0,
                ..Config::default()
            },
            Config {
                validity_days: MAX_VALIDITY_DAYS + 1,
                ..Config::default()
            },
            Config {
                validity_days: 3_000_000,
                ..Config::default()
            },
            Config {
                max_name_len: 0,
                ..Config::default()
            },
            Config {
                read_timeout_secs: 0,
                ..Config::default()
            },
            Config {
                issuer_name: "nonsense".to_string(),
                ..Config::default()
            },
        ];
        for config in invalid {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }

        let longest = Config {
            validity_days: MAX_VALIDITY_DAYS,
            ..Config::default()
        };
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn test_wire_config_from_settings() {
        let config = Config {
            max_name_len: 64,
            read_timeout_secs: 5,
            ..Config::default()
        };
        let wire = config.wire_config();
        assert_eq!(wire.max_name_len, 64);
        assert_eq!(wire.read_timeout, Duration::from_secs(5));
        assert_eq!(wire.write_timeout, WireConfig::default().write_timeout);

        let defaults = Config::default().wire_config();
        assert_eq!(defaults.max_name_len, WireConfig::default().max_name_len);
        assert_eq!(defaults.read_timeout, WireConfig::default().read_timeout);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(Config::load_from(&path).unwrap(), created);
    }

    #[test]
    fn test_issuer_generate_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let app = app_in(&temp_dir);

        app.handle_issuer_generate(1024, false).unwrap();
        let first = std::fs::read(&app.config.issuer_key_path).unwrap();

        assert!(app.handle_issuer_generate(1024, false).is_err());
        assert_eq!(std::fs::read(&app.config.issuer_key_path).unwrap(), first);

        app.handle_issuer_generate(1024, true).unwrap();
        assert_ne!(std::fs::read(&app.config.issuer_key_path).unwrap(), first);

        let authority = app.authority().unwrap();
        assert_eq!(authority.issuer().key_bits(), 1024);
    }

    #[test]
    fn test_authority_without_key_fails() {
        let temp_dir = TempDir::new().unwrap();
        let app = app_in(&temp_dir);
        assert!(app.authority().is_err());
    }
}
