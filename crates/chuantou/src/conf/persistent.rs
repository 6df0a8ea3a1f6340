use std::{path::PathBuf, time::Duration};

use educe::Educe;
use figment::{
	Figment,
	providers::{Env, Format, Serialized, Toml, Yaml},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct PersistentConfig {
	pub server: ServerConf,
	pub client: ClientConf,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct ServerConf {
	#[educe(Default = "0.0.0.0")]
	pub host: String,

	#[educe(Default = 7000)]
	pub control_port: u16,

	/// Host name used in `remoteUrl` responses.
	#[educe(Default = "127.0.0.1")]
	pub public_host: String,

	/// Accepted tokens; an empty list accepts any token (development).
	pub auth_tokens: Vec<String>,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(30)))]
	pub heartbeat_interval: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(90)))]
	pub session_timeout: Duration,

	#[educe(Default = None)]
	pub tls: Option<TlsConf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConf {
	pub cert: PathBuf,
	pub key: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct ClientConf {
	#[educe(Default = "127.0.0.1:7000")]
	pub server_url: String,

	#[educe(Default = "")]
	pub token: String,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(1)))]
	pub reconnect_interval: Duration,

	#[educe(Default = 10)]
	pub max_reconnect_attempts: u32,

	#[educe(Default = false)]
	pub skip_cert_verify: bool,

	pub proxies: Vec<ProxyEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyEntry {
	pub remote_port: u16,
	pub local_port: u16,
	/// Defaults to 127.0.0.1.
	pub local_host: Option<String>,
	pub protocol: Option<chuantou_core::types::Protocol>,
}

impl PersistentConfig {
	pub fn export_to_file(&self, file_path: &PathBuf, format: &str) -> eyre::Result<()> {
		use std::{fs, io::Write};

		match format.to_lowercase().as_str() {
			"yaml" => {
				let yaml_content = serde_yaml::to_string(&self)?;
				let mut file = fs::File::create(file_path)?;
				file.write_all(yaml_content.as_bytes())?;
			}
			"toml" => {
				let toml_content = toml::to_string_pretty(&self)?;
				let mut file = fs::File::create(file_path)?;
				file.write_all(toml_content.as_bytes())?;
			}
			_ => return Err(eyre::eyre!("Unsupported file format: {}", format)),
		}

		Ok(())
	}

	pub fn load(config_path: Option<String>, config_dir: Option<PathBuf>) -> eyre::Result<Self> {
		// Defaults first; files and environment merge over them.
		let mut figment = Figment::from(Serialized::defaults(PersistentConfig::default()));

		if let Some(config_dir) = config_dir {
			let config_file = config_dir.join("config.toml");
			if config_file.exists() {
				figment = figment.merge(Toml::file(config_file));
			}

			let config_file = config_dir.join("config.yaml");
			if config_file.exists() {
				figment = figment.merge(Yaml::file(config_file));
			}
		} else {
			let config_toml = std::path::Path::new("config.toml");
			if config_toml.exists() {
				figment = figment.merge(Toml::file(config_toml));
			}

			let config_yaml = std::path::Path::new("config.yaml");
			if config_yaml.exists() {
				figment = figment.merge(Yaml::file(config_yaml));
			}
		}

		if let Some(config_path) = config_path {
			if config_path.ends_with(".yaml") || config_path.ends_with(".yml") {
				figment = figment.merge(Yaml::file(config_path));
			} else {
				figment = figment.merge(Toml::file(config_path));
			}
		}

		// Environment variables override config files.
		figment = figment.merge(Env::prefixed("CHUANTOU_").split("__"));

		let config: PersistentConfig = figment.extract()?;
		Ok(config)
	}
}
