//! SASL PLAIN credential parsing.
//!
//! Two payload conventions are accepted: the RFC 4616 NUL-separated form and
//! a slash-delimited legacy form still emitted by older appliance firmware
//! and the Android client.

use base64::prelude::*;

use crate::XmppError;

/// Credentials extracted from a SASL PLAIN payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    /// Controller username or bot serial number
    pub uid: String,
    /// Client resource, when the payload carries one
    pub resource: String,
    /// Trailing secret (password / authcode)
    pub authcode: String,
}

/// Parse a base64 SASL PLAIN payload.
///
/// Accepted shapes:
/// - `\0{uid}\0{authcode}` (RFC 4616, empty authzid)
/// - `\0{uid}\0{resource}\0{authcode}` (legacy)
/// - `\0{uid}/{resource}/{authcode}` (legacy, slash-delimited)
pub fn parse_plain(payload: &str) -> Result<PlainCredentials, XmppError> {
    let decoded = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| XmppError::auth_failed(format!("Invalid base64: {}", e)))?;
    let text = String::from_utf8(decoded)
        .map_err(|e| XmppError::auth_failed(format!("Invalid UTF-8: {}", e)))?;

    if !text.contains('\0') {
        return Err(XmppError::auth_failed("Missing NUL separator"));
    }

    if text.contains('/') {
        // Slash-delimited: only the first field is NUL-framed.
        let parts: Vec<&str> = text.split('/').collect();
        let uid = nul_framed_uid(parts[0])?;
        return Ok(PlainCredentials {
            uid,
            resource: parts.get(1).copied().unwrap_or_default().to_string(),
            authcode: parts.get(2).copied().unwrap_or_default().to_string(),
        });
    }

    let fields: Vec<&str> = text.split('\0').collect();
    match fields.len() {
        // [authzid, authcid, password]
        3 => Ok(PlainCredentials {
            uid: fields[1].to_string(),
            resource: String::new(),
            authcode: fields[2].to_string(),
        }),
        // [authzid, authcid, resource, password]
        4 => Ok(PlainCredentials {
            uid: fields[1].to_string(),
            resource: fields[2].to_string(),
            authcode: fields[3].to_string(),
        }),
        _ => Err(XmppError::auth_failed("Malformed PLAIN payload")),
    }
}

/// Extract the authcid from a `\0{authcid}`-framed field.
fn nul_framed_uid(field: &str) -> Result<String, XmppError> {
    field
        .split('\0')
        .nth(1)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| XmppError::auth_failed("Missing authcid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(raw: &str) -> String {
        BASE64_STANDARD.encode(raw.as_bytes())
    }

    #[test]
    fn rfc_form() {
        let creds = parse_plain(&encode("\0SN123\0pw")).expect("parse");
        assert_eq!(
            creds,
            PlainCredentials {
                uid: "SN123".to_string(),
                resource: String::new(),
                authcode: "pw".to_string(),
            }
        );
    }

    #[test]
    fn legacy_nul_form_with_resource() {
        let creds = parse_plain(&encode("\0user42\0mobile\0secret")).expect("parse");
        assert_eq!(creds.uid, "user42");
        assert_eq!(creds.resource, "mobile");
        assert_eq!(creds.authcode, "secret");
    }

    #[test]
    fn legacy_slash_form() {
        let creds = parse_plain(&encode("\0user42/mobile/0000")).expect("parse");
        assert_eq!(creds.uid, "user42");
        assert_eq!(creds.resource, "mobile");
        assert_eq!(creds.authcode, "0000");
    }

    #[test]
    fn payload_without_nul_is_rejected() {
        assert!(matches!(
            parse_plain(&encode("user42:pw")),
            Err(XmppError::AuthFailed(_))
        ));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        assert!(matches!(
            parse_plain("!!not-base64!!"),
            Err(XmppError::AuthFailed(_))
        ));
    }
}
