//! JWT-aware credential helper backed by the `atlas` CLI.
//!
//! Tokens are cached in the renderer's permanent storage and reused until
//! their `exp` claim is within 30 seconds of expiry. The claim is read
//! without signature verification; a token that cannot be parsed counts as
//! expired.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{RenderError, Renderer};

pub(crate) const DEFAULT_COMMAND: &str = "/opt/atlassian/bin/atlas";

const TOKEN_KEY: &str = "token";

/// Tokens expiring within this window count as expired.
const EXPIRY_LEEWAY_SECS: i64 = 30;

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

impl Renderer {
    /// Return a cached token if still valid, otherwise fetch a fresh one via
    /// the external CLI and cache it.
    pub(crate) fn slauth_token(
        &self,
        groups: &str,
        audience: &str,
        environment: &str,
    ) -> Result<String, RenderError> {
        {
            let storage = self.permanent_storage.read();
            if let Some(token) = storage.get(TOKEN_KEY) {
                if !token_has_expired(token) {
                    tracing::debug!("use existing token");
                    return Ok(token.clone());
                }
            }
        }

        // Refresh under the write lock; a concurrent render that lost the
        // race re-checks before spawning a second fetch.
        let mut storage = self.permanent_storage.write();
        if let Some(token) = storage.get(TOKEN_KEY) {
            if !token_has_expired(token) {
                return Ok(token.clone());
            }
        }

        tracing::info!("requesting slauth token");

        let token = self.request_slauth_token(groups, audience, environment)?;
        storage.insert(TOKEN_KEY.to_string(), token.clone());
        Ok(token)
    }

    fn request_slauth_token(
        &self,
        groups: &str,
        audience: &str,
        environment: &str,
    ) -> Result<String, RenderError> {
        let mut cmd = Command::new(&self.credential_command);
        cmd.arg("slauth").arg("token");

        let groups = groups
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if !groups.is_empty() {
            cmd.arg("-g").arg(groups);
        }

        if !audience.is_empty() {
            cmd.arg("--aud").arg(audience);
        }

        if !environment.is_empty() {
            cmd.arg("-e").arg(environment);
        }

        let output = cmd.output().map_err(|e| {
            RenderError::Credential(format!("{}: {e}", self.credential_command.display()))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderError::Credential(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// True if the token's `exp` claim is within [`EXPIRY_LEEWAY_SECS`] of now,
/// or the token cannot be parsed at all.
fn token_has_expired(token: &str) -> bool {
    let Some(exp) = read_expiry(token) else {
        tracing::debug!("token has no readable exp claim, treating as expired");
        return true;
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();

    exp - now <= EXPIRY_LEEWAY_SECS
}

/// Read the `exp` claim from the payload segment, skipping signature
/// verification entirely.
fn read_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Claims = serde_json::from_slice(&decoded).ok()?;
    claims.exp
}
