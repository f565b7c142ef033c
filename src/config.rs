//! TOML configuration.
//!
//! Loaded once at startup; every section has defaults so a minimal
//! file (or none at all) yields a working bridge on a local broker.
//! Durations accept humantime strings (`"30s"`, `"1m"`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::gateway::GatewayId;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub backend: BackendConfig,
    pub integration: IntegrationConfig,
    pub metadata: MetadataConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Gateway backend to run: "semtech_udp" or "basic_station".
    #[serde(rename = "type")]
    pub backend_type: String,
    pub semtech_udp: SemtechUdpConfig,
    pub basic_station: BasicStationConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            backend_type: "semtech_udp".to_string(),
            semtech_udp: SemtechUdpConfig::default(),
            basic_station: BasicStationConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SemtechUdpConfig {
    pub udp_bind: String,
    /// Accept uplinks whose CRC check failed.
    pub skip_crc_check: bool,
    /// Stamp uplinks with the current time when the gateway has no
    /// time source.
    pub fake_rx_time: bool,
    pub configuration: Vec<PacketForwarderConfig>,
}

impl Default for SemtechUdpConfig {
    fn default() -> Self {
        SemtechUdpConfig {
            udp_bind: "0.0.0.0:1700".to_string(),
            skip_crc_check: false,
            fake_rx_time: false,
            configuration: Vec::new(),
        }
    }
}

/// Per-gateway packet-forwarder configuration descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct PacketForwarderConfig {
    pub gateway_id: GatewayId,
    pub base_file: String,
    pub output_file: String,
    pub restart_command: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BasicStationConfig {
    pub bind: String,
    pub tls_cert: String,
    pub tls_key: String,
    /// When set, client certificates are required (mutual TLS).
    pub ca_cert: String,
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    pub region: String,
    pub frequency_min: u32,
    pub frequency_max: u32,
    pub filters: BasicStationFilters,
}

impl Default for BasicStationConfig {
    fn default() -> Self {
        BasicStationConfig {
            bind: "0.0.0.0:3001".to_string(),
            tls_cert: String::new(),
            tls_key: String::new(),
            ca_cert: String::new(),
            ping_interval: Duration::from_secs(60),
            read_timeout: Duration::from_secs(65),
            write_timeout: Duration::from_secs(1),
            region: "EU868".to_string(),
            frequency_min: 0,
            frequency_max: 0,
            filters: BasicStationFilters::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BasicStationFilters {
    /// NetIDs announced to the gateway, 6 hex characters each.
    pub net_ids: Vec<String>,
    /// JoinEUI ranges announced to the gateway, [begin, end] pairs.
    pub join_euis: Vec<[GatewayId; 2]>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Payload marshaler: "protobuf" or "json".
    pub marshaler: String,
    pub mqtt: MqttConfig,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        IntegrationConfig {
            marshaler: "protobuf".to_string(),
            mqtt: MqttConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Publish topic, `{gateway_id}` and `{event_type}` substituted.
    pub event_topic_template: String,
    /// Subscribe topic, must end in a wildcard.
    pub command_topic_template: String,
    /// Publish topic for notify events.
    pub notify_topic_template: String,
    pub auth: MqttAuthConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            event_topic_template: "gateway/{gateway_id}/event/{event_type}".to_string(),
            command_topic_template: "gateway/{gateway_id}/command/#".to_string(),
            notify_topic_template: "gateway/notify/{event_type}".to_string(),
            auth: MqttAuthConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttAuthConfig {
    /// "generic", "gcp_cloud_iot_core" or "azure_iot_hub".
    #[serde(rename = "type")]
    pub auth_type: String,
    pub generic: GenericAuthConfig,
    pub gcp_cloud_iot_core: GcpCloudIotCoreAuthConfig,
    pub azure_iot_hub: AzureIotHubAuthConfig,
}

impl Default for MqttAuthConfig {
    fn default() -> Self {
        MqttAuthConfig {
            auth_type: "generic".to_string(),
            generic: GenericAuthConfig::default(),
            gcp_cloud_iot_core: GcpCloudIotCoreAuthConfig::default(),
            azure_iot_hub: AzureIotHubAuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenericAuthConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub ca_cert: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub qos: u8,
    pub clean_session: bool,
    pub client_id: String,
}

impl Default for GenericAuthConfig {
    fn default() -> Self {
        GenericAuthConfig {
            server: "tcp://127.0.0.1:1883".to_string(),
            username: String::new(),
            password: String::new(),
            ca_cert: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            qos: 0,
            clean_session: true,
            client_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcpCloudIotCoreAuthConfig {
    pub server: String,
    pub device_id: String,
    pub project_id: String,
    pub cloud_region: String,
    pub registry_id: String,
    #[serde(with = "humantime_serde")]
    pub jwt_expiration: Duration,
    pub jwt_key_file: String,
}

impl Default for GcpCloudIotCoreAuthConfig {
    fn default() -> Self {
        GcpCloudIotCoreAuthConfig {
            server: "ssl://mqtt.googleapis.com:8883".to_string(),
            device_id: String::new(),
            project_id: String::new(),
            cloud_region: String::new(),
            registry_id: String::new(),
            jwt_expiration: Duration::from_secs(24 * 60 * 60),
            jwt_key_file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AzureIotHubAuthConfig {
    /// Composite `HostName=...;DeviceId=...;SharedAccessKey=...`
    /// string; when set it overrides the individual fields below.
    pub device_connection_string: String,
    pub hostname: String,
    pub device_id: String,
    pub device_key: String,
    #[serde(with = "humantime_serde")]
    pub sas_token_expiration: Duration,
}

impl Default for AzureIotHubAuthConfig {
    fn default() -> Self {
        AzureIotHubAuthConfig {
            device_connection_string: String::new(),
            hostname: String::new(),
            device_id: String::new(),
            device_key: String::new(),
            sas_token_expiration: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    #[serde(rename = "static")]
    pub static_map: HashMap<String, String>,
    pub dynamic: DynamicMetadataConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DynamicMetadataConfig {
    #[serde(with = "humantime_serde")]
    pub execution_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_execution_duration: Duration,
    pub commands: HashMap<String, String>,
}

impl Default for DynamicMetadataConfig {
    fn default() -> Self {
        DynamicMetadataConfig {
            execution_interval: Duration::from_secs(60),
            max_execution_duration: Duration::from_secs(1),
            commands: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.backend.backend_type, "semtech_udp");
        assert_eq!(config.backend.semtech_udp.udp_bind, "0.0.0.0:1700");
        assert_eq!(
            config.integration.mqtt.event_topic_template,
            "gateway/{gateway_id}/event/{event_type}"
        );
        assert_eq!(config.integration.marshaler, "protobuf");
    }

    #[test]
    fn test_full_file() {
        let config: Config = toml::from_str(
            r#"
            [logging]
            level = "debug"

            [backend]
            type = "basic_station"

            [backend.basic_station]
            bind = "0.0.0.0:3001"
            region = "US915"
            ping_interval = "30s"

            [[backend.semtech_udp.configuration]]
            gateway_id = "0102030405060708"
            base_file = "/etc/pf/base.json"
            output_file = "/etc/pf/conf.json"
            restart_command = "systemctl restart pf"

            [integration]
            marshaler = "json"

            [integration.mqtt.auth.generic]
            server = "ssl://broker:8883"
            qos = 1

            [metadata.static]
            serial = "ab-123"

            [metadata.dynamic]
            execution_interval = "5m"
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.backend_type, "basic_station");
        assert_eq!(config.backend.basic_station.region, "US915");
        assert_eq!(
            config.backend.basic_station.ping_interval,
            Duration::from_secs(30)
        );
        let pf = &config.backend.semtech_udp.configuration[0];
        assert_eq!(pf.gateway_id.to_string(), "0102030405060708");
        assert_eq!(config.integration.mqtt.auth.generic.qos, 1);
        assert_eq!(
            config.metadata.dynamic.execution_interval,
            Duration::from_secs(300)
        );
    }
}
