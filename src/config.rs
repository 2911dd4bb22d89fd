use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::crypto::Keypair;

/// On-disk member configuration.
///
/// The config directory holds the hex-encoded signing key (created on first
/// use) and a `conf.toml` with the member's protocol settings. Settings can
/// be overridden from the environment with a `CUSTODIA_` prefix, e.g.
/// `CUSTODIA_EPHEMERAL=false`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MemberConfig {
    config_path: PathBuf,
    /// Attach a fresh ephemeral public key to every outgoing request.
    pub ephemeral: bool,
    /// Admit signature-stripped shares into the reconstruction pool.
    pub accept_unverified: bool,
    /// Path for the persistent ephemeral key store; in-memory when unset.
    pub key_store_path: Option<String>,
}

impl MemberConfig {
    /// Loads the configuration at `path`, creating the directory, signing
    /// key and a default `conf.toml` on first use.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let config_path = PathBuf::from(path);

        if !config_path.exists() {
            fs::create_dir_all(&config_path)
                .map_err(|err| ConfigError::Foreign(Box::new(err)))?;
        }

        // only create a key if one doesn't exist
        if !config_path.join("key").exists() {
            let keypair = Keypair::generate();
            fs::write(
                config_path.join("key"),
                hex::encode(keypair.secret_bytes()),
            )
            .map_err(|err| ConfigError::Foreign(Box::new(err)))?;
        }

        let config_path = config_path
            .canonicalize()
            .map_err(|err| ConfigError::Foreign(Box::new(err)))?;

        // if the conf.toml file doesn't exist, create it with defaults
        let conf_file = config_path.join("conf.toml");
        if !conf_file.exists() {
            let member_config = MemberConfig {
                config_path: config_path.clone(),
                ephemeral: true,
                accept_unverified: false,
                key_store_path: None,
            };
            let toml = toml::to_string_pretty(&member_config)
                .map_err(|err| ConfigError::Foreign(Box::new(err)))?;
            fs::write(&conf_file, toml).map_err(|err| ConfigError::Foreign(Box::new(err)))?;
        }

        debug!("📝 Loaded config at path: {:#?}", config_path);
        let settings = Config::builder()
            .add_source(config::File::from(conf_file))
            // Eg. `CUSTODIA_EPHEMERAL=false` overrides the ephemeral key mode
            .add_source(config::Environment::with_prefix("CUSTODIA"))
            .build()?;

        settings.try_into()
    }

    /// The member's signing keypair, read back from the key file.
    pub fn keypair(&self) -> Result<Keypair, ConfigError> {
        let encoded = fs::read_to_string(self.config_path.join("key"))
            .map_err(|err| ConfigError::Foreign(Box::new(err)))?;
        let bytes = hex::decode(encoded.trim())
            .map_err(|err| ConfigError::Foreign(Box::new(err)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConfigError::Message("signing key file is not 32 bytes".to_string()))?;
        Ok(Keypair::from_secret_bytes(&bytes))
    }

    /// The member id derived from the persisted signing key.
    pub fn member_id(&self) -> Result<String, ConfigError> {
        Ok(self.keypair()?.id())
    }
}

impl TryFrom<Config> for MemberConfig {
    type Error = ConfigError;

    fn try_from(config: Config) -> Result<Self, Self::Error> {
        Ok(MemberConfig {
            config_path: config.get_string("config_path")?.into(),
            ephemeral: config.get_bool("ephemeral")?,
            accept_unverified: config.get_bool("accept_unverified")?,
            key_store_path: config.get_string("key_store_path").ok(),
        })
    }
}
