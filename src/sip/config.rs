//! SIP Configuration
//!
//! Server settings for the signaling endpoint and the extension credentials
//! supplied by the credential store.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// SIP transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SipTransport {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl SipTransport {
    pub fn default_port(&self) -> u16 {
        match self {
            SipTransport::Udp | SipTransport::Tcp => 5060,
            SipTransport::Tls => 5061,
        }
    }
}

impl std::fmt::Display for SipTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipTransport::Udp => write!(f, "UDP"),
            SipTransport::Tcp => write!(f, "TCP"),
            SipTransport::Tls => write!(f, "TLS"),
        }
    }
}

/// Audio codec for SIP calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SipCodec {
    /// G.711 μ-law (US standard) - Payload type 0
    #[default]
    Pcmu,
    /// G.711 A-law (EU standard) - Payload type 8
    Pcma,
}

impl SipCodec {
    /// RTP payload type number
    pub fn payload_type(&self) -> u8 {
        match self {
            SipCodec::Pcmu => 0,
            SipCodec::Pcma => 8,
        }
    }

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        8000 // G.711 always uses 8kHz
    }

    /// Codec name for SDP
    pub fn sdp_name(&self) -> &'static str {
        match self {
            SipCodec::Pcmu => "PCMU",
            SipCodec::Pcma => "PCMA",
        }
    }
}

/// Extension credentials handed over by the credential store.
///
/// Immutable for the lifetime of an agent; new credentials mean a new agent.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Logical extension (SIP username)
    pub extension: String,
    /// Registration secret
    pub secret: String,
}

impl Credentials {
    pub fn new(extension: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            secret: secret.into(),
        }
    }

    /// Load credentials from `SIP_USERNAME` / `SIP_PASSWORD`
    pub fn from_env() -> Result<Self, ConfigError> {
        let extension =
            std::env::var("SIP_USERNAME").map_err(|_| ConfigError::Missing("SIP_USERNAME"))?;
        let secret =
            std::env::var("SIP_PASSWORD").map_err(|_| ConfigError::Missing("SIP_PASSWORD"))?;
        let credentials = Self::new(extension, secret);
        credentials.validate()?;
        Ok(credentials)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extension.trim().is_empty() {
            return Err(ConfigError::Invalid("SIP extension is required".to_string()));
        }
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid("SIP password is required".to_string()));
        }
        Ok(())
    }
}

// Keep the secret out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("extension", &self.extension)
            .field("secret", &"***")
            .finish()
    }
}

/// Signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    /// SIP server hostname (e.g., "pbx.example.com")
    pub server_host: String,

    /// SIP server port (default: 5060 for UDP/TCP, 5061 for TLS)
    pub server_port: u16,

    /// SIP domain (usually same as server_host)
    pub domain: String,

    /// Transport protocol
    pub transport: SipTransport,

    /// Preferred audio codec
    pub codec: SipCodec,

    /// Local IP for SIP and RTP (auto-detected if None)
    pub local_ip: Option<String>,

    /// Local RTP port range start
    pub rtp_port_start: u16,

    /// Local RTP port range end
    pub rtp_port_end: u16,

    /// Registration expiry in seconds
    pub register_expires: u32,

    /// User agent string
    pub user_agent: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: 5060,
            domain: String::new(),
            transport: SipTransport::Udp,
            codec: SipCodec::Pcmu,
            local_ip: None,
            rtp_port_start: 20000,
            rtp_port_end: 30000,
            register_expires: 3600,
            user_agent: "VoIP-Softphone/1.0 (Rust)".to_string(),
        }
    }
}

impl SipConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_host =
            std::env::var("SIP_TRUNK_HOST").map_err(|_| ConfigError::Missing("SIP_TRUNK_HOST"))?;

        let transport = match std::env::var("SIP_TRANSPORT")
            .unwrap_or_default()
            .to_uppercase()
            .as_str()
        {
            "TCP" => SipTransport::Tcp,
            "TLS" => SipTransport::Tls,
            _ => SipTransport::Udp,
        };

        let server_port = std::env::var("SIP_TRUNK_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or_else(|| transport.default_port());

        let domain = std::env::var("SIP_DOMAIN").unwrap_or_else(|_| server_host.clone());

        let codec = match std::env::var("SIP_CODEC")
            .unwrap_or_default()
            .to_uppercase()
            .as_str()
        {
            "PCMA" | "ALAW" => SipCodec::Pcma,
            _ => SipCodec::Pcmu,
        };

        let config = Self {
            server_host,
            server_port,
            domain,
            transport,
            codec,
            local_ip: std::env::var("SIP_LOCAL_IP").ok(),
            rtp_port_start: std::env::var("SIP_RTP_PORT_START")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(20000),
            rtp_port_end: std::env::var("SIP_RTP_PORT_END")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(30000),
            register_expires: std::env::var("SIP_REGISTER_EXPIRES")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3600),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_host.is_empty() {
            return Err(ConfigError::Invalid("SIP server host is required".to_string()));
        }
        if self.rtp_port_start >= self.rtp_port_end {
            return Err(ConfigError::Invalid("RTP port range is invalid".to_string()));
        }
        Ok(())
    }

    /// Get the SIP URI for registration
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}:{}", self.server_host, self.server_port)
    }

    /// Get the address-of-record for an extension
    pub fn aor(&self, extension: &str) -> String {
        format!("sip:{}@{}", extension, self.domain)
    }

    /// Get the request URI for a dialed target
    pub fn target_uri(&self, digits: &str) -> String {
        format!("sip:{}@{}", digits, self.server_host)
    }

    /// Get the Contact URI
    pub fn contact_uri(&self, extension: &str, local_ip: &str, local_port: u16) -> String {
        format!("sip:{}@{}:{}", extension, local_ip, local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_missing_host() {
        let config = SipConfig::default();
        assert!(config.validate().is_err());

        let config = SipConfig {
            server_host: "pbx.example.com".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_port_range() {
        let config = SipConfig {
            server_host: "pbx.example.com".to_string(),
            rtp_port_start: 30000,
            rtp_port_end: 20000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_uris() {
        let config = SipConfig {
            server_host: "pbx.example.com".to_string(),
            domain: "example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(config.registrar_uri(), "sip:pbx.example.com:5060");
        assert_eq!(config.aor("1001"), "sip:1001@example.com");
        assert_eq!(config.target_uri("5551234"), "sip:5551234@pbx.example.com");
        assert_eq!(config.contact_uri("1001", "10.0.0.2", 15060), "sip:1001@10.0.0.2:15060");
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let credentials = Credentials::new("1001", "hunter2");
        let printed = format!("{:?}", credentials);
        assert!(printed.contains("1001"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_credentials_validate() {
        assert!(Credentials::new("1001", "pw").validate().is_ok());
        assert!(Credentials::new(" ", "pw").validate().is_err());
        assert!(Credentials::new("1001", "").validate().is_err());
    }
}
