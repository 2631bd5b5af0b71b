use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::operations::FleetSettings;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Control plane address (host name or IP).
    pub server: String,
    pub port: u16,
    pub scheme: String,
    /// Identity directory URL, e.g. `ldaps://ipa.domain.internal:389`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ldap: Option<String>,
    /// Overrides the domain derived from `ldap`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Local address outbound HTTP calls are bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_address: Option<IpAddr>,
    pub tick_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub health_enabled: bool,
    pub health_interval_secs: u64,
    pub managed_label: String,
    pub companion_suffix: String,
    pub companion_image: String,
    pub vnc_port: u16,
    pub novnc_internal_port: u16,
    pub homefolder_root: PathBuf,
    pub keytab_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 443,
            scheme: "http".into(),
            ldap: None,
            domain: None,
            source_address: None,
            tick_interval_secs: 2,
            request_timeout_secs: 2,
            health_enabled: false,
            health_interval_secs: 2,
            managed_label: "se.domain.app-type=user".into(),
            companion_suffix: "_novnc".into(),
            companion_image: "divisora/novnc:latest".into(),
            vnc_port: 5900,
            novnc_internal_port: 6080,
            homefolder_root: "/opt/homefolders".into(),
            keytab_root: "/opt/keytabs".into(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("cubicled.toml"))
            .merge(Json::file("cubicled.json"))
            .merge(Env::prefixed("CUBICLED_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(server_file) = std::env::var("CUBICLED_SERVER_FILE") {
            config.server = std::fs::read_to_string(server_file)?.trim().to_string();
        }

        if config.server.trim().is_empty() {
            anyhow::bail!("Control plane address (`server`) must be set");
        }
        if config.domain.is_none() {
            config.domain = config.ldap.as_deref().and_then(domain_from_ldap);
        }
        if config.domain.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("Could not derive a domain: set `ldap` or `domain`");
        }
        if config.tick_interval_secs == 0 {
            anyhow::bail!("`tick_interval_secs` must be at least 1");
        }
        if config.request_timeout_secs == 0 {
            anyhow::bail!("`request_timeout_secs` must be at least 1");
        }
        if config.health_enabled && config.health_interval_secs == 0 {
            anyhow::bail!("`health_interval_secs` must be at least 1");
        }
        if config.companion_suffix.is_empty() {
            anyhow::bail!("`companion_suffix` must not be empty");
        }

        Ok(config)
    }

    pub fn control_plane_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.server, self.port)
    }

    /// Always set after [`Config::load`].
    pub fn domain(&self) -> &str {
        self.domain.as_deref().unwrap_or_default()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            label: self.managed_label.clone(),
            companion_suffix: self.companion_suffix.clone(),
            companion_image: self.companion_image.clone(),
            vnc_port: self.vnc_port,
            novnc_internal_port: self.novnc_internal_port,
            homefolder_root: self.homefolder_root.clone(),
        }
    }
}

/// The managed domain is the directory host name without its first label:
/// `ldaps://ipa.domain.internal:389` gives `domain.internal`.
pub fn domain_from_ldap(ldap: &str) -> Option<String> {
    let url = reqwest::Url::parse(ldap).ok()?;
    let host = url.host_str()?;
    let (_, domain) = host.split_once('.')?;
    (!domain.is_empty()).then(|| domain.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn derives_domain_from_ldap_host() {
        assert_eq!(
            domain_from_ldap("ldaps://ipa.domain.internal:389").as_deref(),
            Some("domain.internal")
        );
        assert_eq!(
            domain_from_ldap("ldap://ldap.example.com").as_deref(),
            Some("example.com")
        );
        assert_eq!(domain_from_ldap("ldap://localhost"), None);
        assert_eq!(domain_from_ldap("not a url"), None);
    }

    #[test]
    fn loads_layers_and_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cubicled.toml",
                r#"
                server = "core.domain.internal"
                ldap = "ldaps://ipa.domain.internal:389"
                "#,
            )?;
            jail.set_env("CUBICLED_PORT", "8080");
            jail.set_env("CUBICLED_SOURCE_ADDRESS", "192.0.2.10");

            let config = Config::load().expect("config");
            assert_eq!(config.control_plane_url(), "http://core.domain.internal:8080");
            assert_eq!(config.domain(), "domain.internal");
            assert_eq!(config.source_address, Some("192.0.2.10".parse().unwrap()));
            assert_eq!(config.tick_interval(), Duration::from_secs(2));
            assert_eq!(config.fleet_settings().companion_name("d"), "d_novnc");
            Ok(())
        });
    }

    #[test]
    fn requires_server_and_domain() {
        Jail::expect_with(|jail| {
            assert!(Config::load().is_err());

            jail.set_env("CUBICLED_SERVER", "core");
            assert!(Config::load().is_err());

            jail.set_env("CUBICLED_DOMAIN", "example.org");
            let config = Config::load().expect("config");
            assert_eq!(config.domain(), "example.org");
            Ok(())
        });
    }

    #[test]
    fn rejects_unusable_intervals_and_suffix() {
        Jail::expect_with(|jail| {
            jail.set_env("CUBICLED_SERVER", "core");
            jail.set_env("CUBICLED_DOMAIN", "example.org");

            jail.set_env("CUBICLED_TICK_INTERVAL_SECS", "0");
            assert!(Config::load().is_err());
            jail.set_env("CUBICLED_TICK_INTERVAL_SECS", "5");

            jail.set_env("CUBICLED_REQUEST_TIMEOUT_SECS", "0");
            assert!(Config::load().is_err());
            jail.set_env("CUBICLED_REQUEST_TIMEOUT_SECS", "3");

            jail.create_file("cubicled.toml", r#"companion_suffix = """#)?;
            assert!(Config::load().is_err());
            jail.create_file("cubicled.toml", r#"companion_suffix = "_web""#)?;

            let config = Config::load().expect("config");
            assert_eq!(config.tick_interval(), Duration::from_secs(5));
            assert_eq!(config.request_timeout(), Duration::from_secs(3));
            assert_eq!(config.fleet_settings().companion_name("d"), "d_web");
            Ok(())
        });
    }
}
