//! Credential update path available once the device is in recovery mode.
//!
//! The HTTP servers on both targets are thin wrappers around [`handle_save`]
//! and [`status_page`]; a [`PortalReply`] with `restart` set means the new key
//! is persisted and the process must restart to pick it up.

use log::{info, warn};

use crate::{
    credential::{ApiKey, CredentialStore},
    error::{CredentialError, RecoveryError},
    types::{DeviceStatus, OperatingMode},
};

pub const FORM_FIELD: &str = "apikey";
pub const RESTART_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    pub restart: bool,
}

impl PortalReply {
    fn html(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/html",
            body: body.into(),
            restart: false,
        }
    }

    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.into(),
            restart: false,
        }
    }
}

pub fn status_page(status: &DeviceStatus) -> String {
    let fingerprint = status.key_fingerprint.as_deref().unwrap_or("none");
    let mut html = String::from("<html><body><h1>Circadian Light Setup</h1>");
    if status.mode == OperatingMode::Recovery.as_str() {
        html.push_str("<p>Device is unauthorized. Please update the API key.</p>");
    }
    html.push_str(&format!(
        "<p>Mode: {} &middot; key {} &middot; schedule {}</p>",
        status.mode,
        fingerprint,
        if status.schedule_loaded { "loaded" } else { "missing" },
    ));
    html.push_str("<form action='/save' method='POST'>");
    html.push_str("API Key: <input type='text' name='apikey' size='70'><br><br>");
    html.push_str("<input type='submit' value='Save &amp; Reboot'>");
    html.push_str("</form></body></html>");
    html
}

/// Pulls the `apikey` field out of an `application/x-www-form-urlencoded` body.
pub fn credential_from_form(body: &str) -> Option<String> {
    body.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        if name != FORM_FIELD {
            return None;
        }
        let value = value.replace('+', " ");
        urlencoding::decode(&value).ok().map(|decoded| decoded.into_owned())
    })
}

/// Validates and persists a replacement credential. Only allowed in recovery.
pub fn accept_credential<S: CredentialStore>(
    mode: OperatingMode,
    candidate: Option<&str>,
    store: &mut S,
) -> Result<ApiKey, RecoveryError> {
    if mode != OperatingMode::Recovery {
        return Err(RecoveryError::NotInRecovery);
    }

    let key = ApiKey::parse(candidate.ok_or(CredentialError::Missing)?)?;
    store
        .save(&key)
        .map_err(|err| RecoveryError::Storage(err.to_string()))?;
    info!("stored replacement API key {}", key.fingerprint());
    Ok(key)
}

pub fn handle_save<S: CredentialStore>(
    mode: OperatingMode,
    form_body: &str,
    store: &mut S,
) -> PortalReply {
    let candidate = credential_from_form(form_body);
    match accept_credential(mode, candidate.as_deref(), store) {
        Ok(_) => PortalReply {
            restart: true,
            ..PortalReply::html(200, "<body>Saved! Rebooting...</body>")
        },
        Err(RecoveryError::NotInRecovery) => {
            PortalReply::text(409, "Device is not in recovery mode")
        }
        Err(RecoveryError::Rejected(CredentialError::Missing)) => {
            warn!("recovery submission without a key");
            PortalReply::text(400, "Missing apikey")
        }
        Err(RecoveryError::Rejected(err)) => {
            warn!("recovery submission rejected: {err}");
            PortalReply::html(400, "<body>Invalid Key Length</body>")
        }
        Err(err @ RecoveryError::Storage(_)) => {
            warn!("{err}");
            PortalReply::text(500, "Failed to store key")
        }
    }
}
