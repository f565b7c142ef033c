//! MQTT authentication providers.
//!
//! Each provider owns the broker coordinates and credential
//! refreshing for one hosting flavor: `init` is applied once when the
//! client is created, `update` before every connect attempt (the
//! hosted variants mint short-lived tokens there), and
//! `reconnect_after` drives the periodic reconnect that rotates those
//! tokens before they expire.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use paho_mqtt as mqtt;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use sha2::Sha256;

use crate::config::{AzureIotHubAuthConfig, GcpCloudIotCoreAuthConfig, GenericAuthConfig};

pub trait Authentication: Send + Sync {
    /// Client creation options: server URI and client id.
    fn init(&self) -> anyhow::Result<mqtt::CreateOptions>;

    /// Refresh credentials on the connect options. Called before
    /// every connect attempt.
    fn update(&self, opts: &mut mqtt::ConnectOptionsBuilder) -> anyhow::Result<()>;

    /// Interval after which the client must reconnect with fresh
    /// credentials; `None` disables the periodic reconnect.
    fn reconnect_after(&self) -> Option<Duration>;
}

/// Plain username/password with optional TLS.
pub struct GenericAuthentication {
    config: GenericAuthConfig,
}

impl GenericAuthentication {
    pub fn new(config: &GenericAuthConfig) -> anyhow::Result<Self> {
        Ok(GenericAuthentication {
            config: config.clone(),
        })
    }
}

impl Authentication for GenericAuthentication {
    fn init(&self) -> anyhow::Result<mqtt::CreateOptions> {
        let mut builder = mqtt::CreateOptionsBuilder::new().server_uri(&self.config.server);
        if !self.config.client_id.is_empty() {
            builder = builder.client_id(&self.config.client_id);
        }
        Ok(builder.finalize())
    }

    fn update(&self, opts: &mut mqtt::ConnectOptionsBuilder) -> anyhow::Result<()> {
        opts.clean_session(self.config.clean_session);
        if !self.config.username.is_empty() {
            opts.user_name(&self.config.username);
        }
        if !self.config.password.is_empty() {
            opts.password(&self.config.password);
        }

        if !self.config.ca_cert.is_empty() || !self.config.tls_cert.is_empty() {
            let mut ssl = mqtt::SslOptionsBuilder::new();
            if !self.config.ca_cert.is_empty() {
                ssl.trust_store(&self.config.ca_cert)
                    .context("set ca cert")?;
            }
            if !self.config.tls_cert.is_empty() {
                ssl.key_store(&self.config.tls_cert)
                    .context("set tls cert")?;
                ssl.private_key(&self.config.tls_key)
                    .context("set tls key")?;
            }
            opts.ssl_options(ssl.finalize());
        }
        Ok(())
    }

    fn reconnect_after(&self) -> Option<Duration> {
        None
    }
}

/// GCP Cloud IoT Core: the password is a short-lived RS256 JWT over
/// the project id, rotated by the periodic reconnect.
pub struct GcpCloudIotCoreAuthentication {
    server: String,
    client_id: String,
    project_id: String,
    jwt_expiration: Duration,
    key_pair: RsaKeyPair,
}

impl GcpCloudIotCoreAuthentication {
    pub fn new(config: &GcpCloudIotCoreAuthConfig) -> anyhow::Result<Self> {
        let client_id = format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            config.project_id, config.cloud_region, config.registry_id, config.device_id
        );

        let key_file = std::fs::File::open(&config.jwt_key_file)
            .with_context(|| format!("open jwt key file {}", config.jwt_key_file))?;
        let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
            .context("read jwt key file")?
            .ok_or_else(|| anyhow::anyhow!("no private key in {}", config.jwt_key_file))?;

        use tokio_rustls::rustls::pki_types::PrivateKeyDer;
        let key_pair = match &key {
            PrivateKeyDer::Pkcs8(der) => RsaKeyPair::from_pkcs8(der.secret_pkcs8_der()),
            PrivateKeyDer::Pkcs1(der) => RsaKeyPair::from_der(der.secret_pkcs1_der()),
            _ => anyhow::bail!("unsupported private key format in {}", config.jwt_key_file),
        }
        .map_err(|e| anyhow::anyhow!("parse rsa key: {}", e))?;

        Ok(GcpCloudIotCoreAuthentication {
            server: config.server.clone(),
            client_id,
            project_id: config.project_id.clone(),
            jwt_expiration: config.jwt_expiration,
            key_pair,
        })
    }

    fn create_jwt(&self, now: u64) -> anyhow::Result<String> {
        let header = BASE64_URL.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let claims = BASE64_URL.encode(
            serde_json::to_vec(&serde_json::json!({
                "aud": self.project_id,
                "iat": now,
                "exp": now + self.jwt_expiration.as_secs(),
            }))?,
        );
        let signing_input = format!("{}.{}", header, claims);

        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(
                &RSA_PKCS1_SHA256,
                &SystemRandom::new(),
                signing_input.as_bytes(),
                &mut signature,
            )
            .map_err(|e| anyhow::anyhow!("sign jwt: {}", e))?;

        Ok(format!("{}.{}", signing_input, BASE64_URL.encode(signature)))
    }
}

impl Authentication for GcpCloudIotCoreAuthentication {
    fn init(&self) -> anyhow::Result<mqtt::CreateOptions> {
        Ok(mqtt::CreateOptionsBuilder::new()
            .server_uri(&self.server)
            .client_id(&self.client_id)
            .finalize())
    }

    fn update(&self, opts: &mut mqtt::ConnectOptionsBuilder) -> anyhow::Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        opts.user_name("unused");
        opts.password(self.create_jwt(now)?);
        opts.ssl_options(mqtt::SslOptionsBuilder::new().finalize());
        Ok(())
    }

    fn reconnect_after(&self) -> Option<Duration> {
        Some(self.jwt_expiration)
    }
}

/// Azure IoT Hub: the password is an HMAC-SHA256 SAS token over the
/// escaped resource URI and expiry, rotated by the periodic
/// reconnect.
pub struct AzureIotHubAuthentication {
    hostname: String,
    device_id: String,
    device_key: Vec<u8>,
    sas_token_expiration: Duration,
}

impl AzureIotHubAuthentication {
    pub fn new(config: &AzureIotHubAuthConfig) -> anyhow::Result<Self> {
        let mut hostname = config.hostname.clone();
        let mut device_id = config.device_id.clone();
        let mut device_key = config.device_key.clone();

        if !config.device_connection_string.is_empty() {
            let kv = parse_connection_string(&config.device_connection_string)?;
            if let Some(v) = kv.get("HostName") {
                hostname = v.clone();
            }
            if let Some(v) = kv.get("DeviceId") {
                device_id = v.clone();
            }
            if let Some(v) = kv.get("SharedAccessKey") {
                device_key = v.clone();
            }
        }

        let device_key = BASE64
            .decode(&device_key)
            .context("decode device key")?;

        Ok(AzureIotHubAuthentication {
            hostname,
            device_id,
            device_key,
            sas_token_expiration: config.sas_token_expiration,
        })
    }
}

impl Authentication for AzureIotHubAuthentication {
    fn init(&self) -> anyhow::Result<mqtt::CreateOptions> {
        Ok(mqtt::CreateOptionsBuilder::new()
            .server_uri(format!("ssl://{}:8883", self.hostname))
            .client_id(&self.device_id)
            .finalize())
    }

    fn update(&self, opts: &mut mqtt::ConnectOptionsBuilder) -> anyhow::Result<()> {
        let resource_uri = format!("{}/devices/{}", self.hostname, self.device_id);
        let expiry = SystemTime::now().duration_since(UNIX_EPOCH)?
            + self.sas_token_expiration;
        let token = create_sas_token(&resource_uri, &self.device_key, expiry.as_secs())?;

        opts.user_name(format!("{}/{}", self.hostname, self.device_id));
        opts.password(token);
        opts.ssl_options(mqtt::SslOptionsBuilder::new().finalize());
        Ok(())
    }

    fn reconnect_after(&self) -> Option<Duration> {
        Some(self.sas_token_expiration)
    }
}

fn create_sas_token(uri: &str, device_key: &[u8], expiry_unix: u64) -> anyhow::Result<String> {
    let encoded = urlencoding::encode(uri).into_owned();
    let signature = format!("{}\n{}", encoded, expiry_unix);

    let mut mac = Hmac::<Sha256>::new_from_slice(device_key)
        .map_err(|e| anyhow::anyhow!("invalid device key: {}", e))?;
    mac.update(signature.as_bytes());
    let hash = urlencoding::encode(&BASE64.encode(mac.finalize().into_bytes())).into_owned();

    // The hub only needs `sr`, `sig` and `se`.
    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded, hash, expiry_unix
    ))
}

fn parse_connection_string(s: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for pair in s.split(';') {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected key=value, got: {}", pair))?;
        out.insert(k.to_string(), v.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_string() {
        let kv = parse_connection_string(
            "HostName=iothub.azure-devices.net;DeviceId=gw-1;SharedAccessKey=Zm9vYmFy",
        )
        .unwrap();
        assert_eq!(kv["HostName"], "iothub.azure-devices.net");
        assert_eq!(kv["DeviceId"], "gw-1");
        assert_eq!(kv["SharedAccessKey"], "Zm9vYmFy");

        assert!(parse_connection_string("NotAPair").is_err());
    }

    #[test]
    fn test_connection_string_overrides_fields() {
        let auth = AzureIotHubAuthentication::new(&AzureIotHubAuthConfig {
            device_connection_string:
                "HostName=iothub.azure-devices.net;DeviceId=gw-1;SharedAccessKey=Zm9vYmFy"
                    .to_string(),
            hostname: "ignored".to_string(),
            device_id: "ignored".to_string(),
            device_key: String::new(),
            sas_token_expiration: Duration::from_secs(3600),
        })
        .unwrap();
        assert_eq!(auth.hostname, "iothub.azure-devices.net");
        assert_eq!(auth.device_id, "gw-1");
        assert_eq!(auth.device_key, b"foobar");
    }

    #[test]
    fn test_sas_token_shape() {
        let token =
            create_sas_token("iothub.azure-devices.net/devices/gw-1", b"foobar", 1700000000)
                .unwrap();
        assert!(token.starts_with("SharedAccessSignature sr=iothub.azure-devices.net%2Fdevices%2Fgw-1&sig="));
        assert!(token.ends_with("&se=1700000000"));
    }

    #[test]
    fn test_sas_token_is_deterministic() {
        let a = create_sas_token("host/devices/d", b"key", 1700000000).unwrap();
        let b = create_sas_token("host/devices/d", b"key", 1700000000).unwrap();
        let c = create_sas_token("host/devices/d", b"key", 1700000001).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_generic_reconnect_disabled() {
        let auth = GenericAuthentication::new(&GenericAuthConfig::default()).unwrap();
        assert!(auth.reconnect_after().is_none());
    }
}
