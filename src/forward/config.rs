use std::env;
use std::net::{IpAddr, Ipv4Addr};

use anyhow::{anyhow, bail, Context};
use base64::Engine;
use tracing::debug;

use crate::config::{TlsMaterial, UldpConfig};
use crate::wire::origin::OriginAddress;

/// Configuration of a forwarding run, read from the environment of the deployment
#[derive(Clone, Debug)]
pub struct ForwarderConfig {
    pub uldp: UldpConfig,
    /// origin address of all forwarded messages
    pub origin: OriginAddress,
    /// render JSON records as flat `path=value` text instead of JSON
    pub flatten: bool,
    pub debug: bool,
}

impl ForwarderConfig {
    pub fn from_env() -> anyhow::Result<ForwarderConfig> {
        ForwarderConfig::from_lookup(|key| env::var(key).ok())
    }

    /// reads the configuration through a lookup function that has the same semantics as reading
    ///  environment variables
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<ForwarderConfig> {
        let Some(host) = lookup("ULDP_HOST") else {
            bail!("ULDP_HOST is not set");
        };
        let mut uldp = UldpConfig::new(host);
        uldp.collector_domain = lookup("ULDP_COLLECTOR_DOMAIN")
            .filter(|d| !d.is_empty());

        if let Some(tls) = tls_material(&lookup)? {
            debug!("TLS material is configured");
            uldp = uldp.with_tls(tls);
        }
        if let Some(port) = lookup("ULDP_PORT") {
            uldp.port = port.parse()
                .with_context(|| format!("invalid ULDP_PORT {:?}", port))?;
        }
        uldp.use_compression = is_true(lookup("ULDP_COMPRESSION"));
        if let Some(size) = lookup("ULDP_ACK_QUEUE_SIZE") {
            uldp.ack_pending_budget = size.parse()
                .with_context(|| format!("invalid ULDP_ACK_QUEUE_SIZE {:?}", size))?;
        }
        uldp.validate()?;

        let origin = match lookup("ULDP_SOURCE_IP").or_else(|| lookup("SOURCE_IP")) {
            None => OriginAddress::Literal(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            Some(s) => s.parse()?,
        };

        Ok(ForwarderConfig {
            uldp,
            origin,
            flatten: !is_false(lookup("FLATTEN")),
            debug: is_true(lookup("DEBUG")),
        })
    }
}

fn is_true(value: Option<String>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn is_false(value: Option<String>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("false"))
}

/// TLS is configured if and only if CA, certificate and key are all present
fn tls_material(lookup: &impl Fn(&str) -> Option<String>) -> anyhow::Result<Option<TlsMaterial>> {
    let (Some(ca), Some(cert), Some(key)) = (lookup("TLS_CA"), lookup("TLS_CERT"), lookup("TLS_KEY")) else {
        return Ok(None);
    };

    Ok(Some(TlsMaterial {
        ca_pem: decode_base64("TLS_CA", ca.as_str())?,
        cert_pem: decode_base64("TLS_CERT", cert.as_str())?,
        key_pem: decode_base64("TLS_KEY", key.as_str())?,
        key_passphrase: lookup("TLS_KEY_PASSPHRASE"),
        check_server_name: !is_false(lookup("TLS_CHECK_NAME")),
    }))
}

fn decode_base64(name: &str, value: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|e| anyhow!("{} is not valid base64: {}", name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<ForwarderConfig> {
        let vars = vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        ForwarderConfig::from_lookup(|key| vars.get(key).cloned())
    }

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn test_minimal() {
        let config = config(&[("ULDP_HOST", "lmi.example")]).unwrap();
        assert_eq!(config.uldp.host, "lmi.example");
        assert_eq!(config.uldp.port, 5516);
        assert!(config.uldp.tls.is_none());
        assert!(config.uldp.collector_domain.is_none());
        assert!(!config.uldp.use_compression);
        assert_eq!(config.origin, OriginAddress::Literal("0.0.0.0".parse().unwrap()));
        assert!(config.flatten);
        assert!(!config.debug);
    }

    #[test]
    fn test_missing_host() {
        assert!(config(&[]).is_err());
    }

    #[rstest]
    #[case::auto("auto", OriginAddress::Unspecified)]
    #[case::v4("10.1.2.3", OriginAddress::Literal("10.1.2.3".parse().unwrap()))]
    #[case::v6("fe80::1", OriginAddress::Literal("fe80::1".parse().unwrap()))]
    fn test_source_ip(#[case] value: &str, #[case] expected: OriginAddress) {
        let config = config(&[("ULDP_HOST", "h"), ("ULDP_SOURCE_IP", value)]).unwrap();
        assert_eq!(config.origin, expected);
    }

    #[rstest]
    #[case::unset(&[], OriginAddress::Literal("0.0.0.0".parse().unwrap()))]
    #[case::short_name(&[("SOURCE_IP", "10.1.2.3")], OriginAddress::Literal("10.1.2.3".parse().unwrap()))]
    #[case::prefixed_name_wins(&[("SOURCE_IP", "10.1.2.3"), ("ULDP_SOURCE_IP", "auto")], OriginAddress::Unspecified)]
    fn test_source_ip_variable(#[case] vars: &[(&str, &str)], #[case] expected: OriginAddress) {
        let mut vars = vars.to_vec();
        vars.push(("ULDP_HOST", "h"));
        assert_eq!(config(&vars).unwrap().origin, expected);
    }

    #[rstest]
    #[case::source_ip(&[("ULDP_SOURCE_IP", "not an address")])]
    #[case::port(&[("ULDP_PORT", "99999")])]
    #[case::queue_size(&[("ULDP_ACK_QUEUE_SIZE", "-1")])]
    #[case::tls_base64(&[("TLS_CA", "%%%"), ("TLS_CERT", "YQ=="), ("TLS_KEY", "YQ==")])]
    fn test_invalid(#[case] vars: &[(&str, &str)]) {
        let mut vars = vars.to_vec();
        vars.push(("ULDP_HOST", "h"));
        assert!(config(&vars).is_err());
    }

    #[test]
    fn test_flags() {
        let config = config(&[
            ("ULDP_HOST", "h"),
            ("FLATTEN", "false"),
            ("DEBUG", "true"),
            ("ULDP_COMPRESSION", "TRUE"),
            ("ULDP_ACK_QUEUE_SIZE", "1000"),
            ("ULDP_COLLECTOR_DOMAIN", "tenant"),
        ]).unwrap();
        assert!(!config.flatten);
        assert!(config.debug);
        assert!(config.uldp.use_compression);
        assert_eq!(config.uldp.ack_pending_budget, 1000);
        assert_eq!(config.uldp.collector_domain.as_deref(), Some("tenant"));
    }

    #[test]
    fn test_tls() {
        let ca = b64("-----BEGIN CERTIFICATE-----\nca\n-----END CERTIFICATE-----\n");
        let cert = b64("cert");
        let key = b64("key");
        let config = config(&[
            ("ULDP_HOST", "h"),
            ("TLS_CA", ca.as_str()),
            ("TLS_CERT", cert.as_str()),
            ("TLS_KEY", key.as_str()),
            ("TLS_KEY_PASSPHRASE", "secret"),
            ("TLS_CHECK_NAME", "False"),
        ]).unwrap();

        assert_eq!(config.uldp.port, 5515);
        let tls = config.uldp.tls.unwrap();
        assert!(tls.ca_pem.starts_with(b"-----BEGIN CERTIFICATE-----"));
        assert_eq!(tls.cert_pem, b"cert");
        assert_eq!(tls.key_pem, b"key");
        assert_eq!(tls.key_passphrase.as_deref(), Some("secret"));
        assert!(!tls.check_server_name);
    }

    #[test]
    fn test_tls_needs_all_parts() {
        let (ca, cert) = (b64("ca"), b64("cert"));
        let config = config(&[("ULDP_HOST", "h"), ("TLS_CA", ca.as_str()), ("TLS_CERT", cert.as_str())]).unwrap();
        assert!(config.uldp.tls.is_none());
        assert_eq!(config.uldp.port, 5516);
    }

    #[test]
    fn test_explicit_port_overrides_tls_default() {
        let (ca, cert, key) = (b64("ca"), b64("cert"), b64("key"));
        let config = config(&[
            ("ULDP_HOST", "h"),
            ("ULDP_PORT", "6000"),
            ("TLS_CA", ca.as_str()),
            ("TLS_CERT", cert.as_str()),
            ("TLS_KEY", key.as_str()),
        ]).unwrap();
        assert_eq!(config.uldp.port, 6000);
        assert!(config.uldp.tls.unwrap().check_server_name);
    }
}
