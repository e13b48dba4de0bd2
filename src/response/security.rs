//! Fixed, CORS and Content-Security-Policy headers

use crate::config::SecurityConfig;
use crate::http::{Error, Headers, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

/// Placeholder in CSP sources replaced by the per-request nonce
pub const NONCE_PLACEHOLDER: &str = "{nonce}";

/// Request store key holding the nonce handlers put in their markup
pub const NONCE_KEY: &str = "csp_nonce";

/// Headers added to every response unless the handler set them already
#[derive(Debug, Clone, Default)]
pub struct SecurityHeaders {
    fixed: Vec<(String, String)>,
    cors: Vec<(&'static str, String)>,
    /// Policy with the nonce placeholder still in it
    csp: Option<String>,
}

impl SecurityHeaders {
    pub fn from_config(config: &SecurityConfig) -> Self {
        let mut fixed: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        fixed.sort();

        let mut cors = Vec::new();
        if let Some(origin) = &config.cors_allow_origin {
            cors.push(("Access-Control-Allow-Origin", origin.clone()));
            if !config.cors_allow_methods.is_empty() {
                cors.push(("Access-Control-Allow-Methods", config.cors_allow_methods.join(", ")));
            }
            if !config.cors_allow_headers.is_empty() {
                cors.push(("Access-Control-Allow-Headers", config.cors_allow_headers.join(", ")));
            }
        }

        let csp = if config.csp.is_empty() {
            None
        } else {
            let mut directives: Vec<_> = config.csp.iter().collect();
            directives.sort();
            let policy = directives
                .into_iter()
                .map(|(directive, sources)| {
                    if sources.is_empty() {
                        directive.clone()
                    } else {
                        format!("{} {}", directive, sources.join(" "))
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            Some(policy)
        };

        SecurityHeaders { fixed, cors, csp }
    }

    /// Whether the policy carries a nonce placeholder
    pub fn uses_nonce(&self) -> bool {
        self.csp.as_deref().is_some_and(|policy| policy.contains(NONCE_PLACEHOLDER))
    }

    /// Set the headers, substituting `nonce` into the policy
    ///
    /// Without a request nonce a fresh one is drawn. Stops at the first
    /// value that cannot go on the wire.
    pub fn apply(&self, headers: &mut Headers, nonce: Option<&str>) -> Result<()> {
        for (name, value) in &self.fixed {
            check_value(name, value)?;
            headers.set_default(name, value.as_str());
        }
        for (name, value) in &self.cors {
            check_value(name, value)?;
            headers.set_default(name, value.as_str());
        }
        if let Some(policy) = &self.csp {
            let policy = if policy.contains(NONCE_PLACEHOLDER) {
                match nonce {
                    Some(nonce) => policy.replace(NONCE_PLACEHOLDER, nonce),
                    None => policy.replace(NONCE_PLACEHOLDER, &generate_nonce()),
                }
            } else {
                policy.clone()
            };
            check_value("Content-Security-Policy", &policy)?;
            headers.set_default("Content-Security-Policy", policy);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.fixed.is_empty() && self.cors.is_empty() && self.csp.is_none()
    }
}

fn check_value(name: &str, value: &str) -> Result<()> {
    if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(Error::InvalidHeader(format!("{} contains a control character", name)));
    }
    Ok(())
}

/// 128 random bits, base64
pub fn generate_nonce() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    STANDARD.encode(raw)
}
