use config::{Config, ConfigError, Environment, File};
use ozone_artery::{DeliveryOptions, FabricConfig};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    pub socket_port: u16,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    pub secret_path: PathBuf,
    pub require_secret: bool,
    #[serde(deserialize_with = "deserialize_list")]
    pub peers: Vec<String>,
    pub wait_for_ack: bool,
    #[serde(default, with = "humantime_serde")]
    pub ack_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub link_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(split_list(value))
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c| c == ',' || c == ';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl OrchestratorConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("socket_port", i64::from(ozone_core::DEFAULT_SOCKET_PORT))?
            .set_default("heartbeat_interval", "3s")?
            .set_default("secret_path", "/run/secrets/o3_key")?
            .set_default("require_secret", false)?
            .set_default("peers", Vec::<String>::new())?
            .set_default("wait_for_ack", false)?
            .set_default("connect_timeout", "10s")?
            .set_default("link_capacity", 1024)?
            .set_default("status_interval", "30s")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("OZONE")
                .try_parsing(true)
                .ignore_empty(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn fabric_config(&self) -> FabricConfig {
        FabricConfig {
            heartbeat_interval: self.heartbeat_interval,
        }
    }

    pub fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions {
            wait_for_ack: self.wait_for_ack,
            ack_timeout: self.ack_timeout,
        }
    }
}
