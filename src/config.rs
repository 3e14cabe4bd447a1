//! JSON configuration shared by the client and server roles.

use std::error::Error;
use std::fs;

use serde::Deserialize;

use crate::protocol::{
    Security, OPT_BASIC_FORMAT, OPT_CHUNK_MASKING, OPT_CHUNK_STREAM, OPT_GLOBAL_PADDING,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server role: listen address.
    #[serde(default)]
    pub local_host: String,
    #[serde(default)]
    pub local_port: u16,
    /// Client role: the vmess server. Server role: the decoy redirect target.
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    pub uuid: String,
    #[serde(default)]
    pub alter_id: usize,
    /// "aes-128-gcm", "chacha20-poly1305", "none", or empty for the
    /// unframed basic format.
    #[serde(default)]
    pub security: String,
    /// XOR-mask chunk lengths with the SHAKE-128 keystream (client role).
    #[serde(default)]
    pub chunk_masking: bool,
    /// Append random padding to each chunk; requires `chunk_masking`.
    #[serde(default)]
    pub global_padding: bool,
    /// Maximum distinct source IPs per user, 0 = unlimited (server role).
    #[serde(default)]
    pub ip_limit: usize,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {}", path, e))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| format!("failed to parse config {}: {}", path, e))?;
        Ok(config)
    }

    /// Resolve the security string and option byte the client will request.
    pub fn security_options(&self) -> Result<(Security, u8), Box<dyn Error + Send + Sync>> {
        let (security, mut opt) = match self.security.to_lowercase().as_str() {
            "aes-128-gcm" => (Security::Aes128Gcm, OPT_CHUNK_STREAM),
            "chacha20-poly1305" => (Security::Chacha20Poly1305, OPT_CHUNK_STREAM),
            "none" => (Security::None, OPT_CHUNK_STREAM),
            // no method specified: raw bytes after the header
            "" => (Security::None, OPT_BASIC_FORMAT),
            other => return Err(format!("unknown security type: {}", other).into()),
        };
        if opt & OPT_CHUNK_STREAM != 0 && self.chunk_masking {
            opt |= OPT_CHUNK_MASKING;
            if self.global_padding {
                opt |= OPT_GLOBAL_PADDING;
            }
        }
        Ok((security, opt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_options() {
        let mut config = Config {
            uuid: "a684455c-b14f-11ea-bf0d-42010aaa0003".to_string(),
            security: "aes-128-gcm".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.security_options().unwrap(),
            (Security::Aes128Gcm, OPT_CHUNK_STREAM)
        );

        config.security = String::new();
        assert_eq!(
            config.security_options().unwrap(),
            (Security::None, OPT_BASIC_FORMAT)
        );

        config.security = "ChaCha20-Poly1305".to_string();
        config.chunk_masking = true;
        config.global_padding = true;
        assert_eq!(
            config.security_options().unwrap(),
            (
                Security::Chacha20Poly1305,
                OPT_CHUNK_STREAM | OPT_CHUNK_MASKING | OPT_GLOBAL_PADDING
            )
        );

        config.security = "aes-256-gcm".to_string();
        assert!(config.security_options().is_err());
    }

    #[test]
    fn test_padding_requires_masking() {
        let config = Config {
            uuid: String::new(),
            security: "none".to_string(),
            global_padding: true,
            ..Default::default()
        };
        let (_, opt) = config.security_options().unwrap();
        assert_eq!(opt & OPT_GLOBAL_PADDING, 0);
    }

    #[test]
    fn test_parse_json() {
        let raw = r#"{
            "local_host": "127.0.0.1",
            "local_port": 10086,
            "remote_host": "decoy.example.com",
            "remote_port": 80,
            "uuid": "a684455c-b14f-11ea-bf0d-42010aaa0003",
            "alter_id": 4,
            "security": "aes-128-gcm"
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.local_port, 10086);
        assert_eq!(config.alter_id, 4);
        assert!(!config.chunk_masking);
    }
}
