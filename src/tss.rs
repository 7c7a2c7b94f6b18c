//! Tatsu Signing Server client
//!
//! Personalized disk images must be countersigned by Apple: the host
//! assembles a request from the device's personalization identifiers and
//! the image's build manifest, posts it as an XML plist and gets an
//! `ApImg4Ticket` back.

use log::{debug, warn};
use plist::Value;

use crate::{util::plist_to_xml_bytes, MuxdevError};

const TSS_CLIENT_VERSION_STRING: &str = "libauthinstall-1033.0.2";
/// Requests are posted over HTTPS and verified against the system roots
pub const TSS_CONTROLLER_ACTION_URL: &str = "https://gs.apple.com/TSS/controller?action=2";

#[derive(Debug)]
pub struct TssRequest {
    inner: plist::Dictionary,
    endpoint: String,
}

impl TssRequest {
    pub fn new() -> Self {
        let mut inner = plist::Dictionary::new();
        inner.insert("@HostPlatformInfo".into(), "mac".into());
        inner.insert("@VersionInfo".into(), TSS_CLIENT_VERSION_STRING.into());
        inner.insert(
            "@UUID".into(),
            uuid::Uuid::new_v4().to_string().to_uppercase().into(),
        );
        Self {
            inner,
            endpoint: TSS_CONTROLLER_ACTION_URL.into(),
        }
    }

    /// Overrides the signing endpoint; only useful for tests
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, val: impl Into<Value>) {
        self.inner.insert(key.into(), val.into());
    }

    /// Posts the request and returns the signed response plist
    pub async fn send(&self) -> Result<Value, MuxdevError> {
        debug!(
            "Sending TSS request: {}",
            crate::pretty_print_dictionary(&self.inner)
        );
        let client = reqwest::Client::new();

        let res = client
            .post(&self.endpoint)
            .header("Cache-Control", "no-cache")
            .header("Content-type", "text/xml; charset=\"utf-8\"")
            .header("User-Agent", "InetURL/1.0")
            .header("Expect", "")
            .body(plist_to_xml_bytes(&self.inner))
            .send()
            .await?
            .text()
            .await?;

        parse_response(&res)
    }
}

impl Default for TssRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// The signer answers `STATUS=0&MESSAGE=SUCCESS&REQUEST_STRING=<xml>`
fn parse_response(body: &str) -> Result<Value, MuxdevError> {
    debug!("Apple responded with {body}");
    let message = body
        .split('&')
        .find_map(|field| field.strip_prefix("MESSAGE="));
    match message {
        Some(m) if m.starts_with("SUCCESS") => {}
        Some(m) => {
            warn!("TSS responded with non-success message: {m}");
            return Err(MuxdevError::UnexpectedResponse);
        }
        None => {
            warn!("TSS response carried no MESSAGE field");
            return Err(MuxdevError::UnexpectedResponse);
        }
    }

    match body.split_once("REQUEST_STRING=") {
        Some((_, xml)) => Ok(plist::from_bytes(xml.as_bytes())?),
        None => {
            warn!("TSS response didn't contain a request string");
            Err(MuxdevError::UnexpectedResponse)
        }
    }
}

/// Folds a build manifest's `RestoreRequestRules` into a TSS entry
///
/// Each rule names conditions over the request parameters; when they all
/// hold, the rule's actions overwrite the entry. Action value 255 means
/// "leave unset".
pub fn apply_restore_request_rules(
    input: &mut plist::Dictionary,
    parameters: &plist::Dictionary,
    rules: &[Value],
) {
    for rule in rules {
        let rule = match rule {
            Value::Dictionary(rule) => rule,
            _ => {
                warn!("Rule wasn't a dictionary");
                continue;
            }
        };
        let conditions = match rule.get("Conditions") {
            Some(Value::Dictionary(c)) => c,
            _ => {
                warn!("Conditions doesn't exist or wasn't a dictionary!");
                continue;
            }
        };

        let mut conditions_fulfilled = true;
        for (key, value) in conditions {
            let actual = match key.as_str() {
                "ApRawProductionMode" => parameters.get("ApProductionMode"),
                "ApCurrentProductionMode" => parameters.get("ApProductionMode"),
                "ApRawSecurityMode" => parameters.get("ApSecurityMode"),
                "ApRequiresImage4" => parameters.get("ApSupportsImg4"),
                "ApDemotionPolicyOverride" => parameters.get("DemotionPolicy"),
                "ApInRomDFU" => parameters.get("ApInRomDFU"),
                _ => {
                    warn!("Unhandled condition key {key}");
                    None
                }
            };

            if actual != Some(value) {
                conditions_fulfilled = false;
                break;
            }
        }

        if !conditions_fulfilled {
            continue;
        }

        let actions = match rule.get("Actions") {
            Some(Value::Dictionary(a)) => a,
            _ => {
                warn!("Actions doesn't exist or wasn't a dictionary!");
                continue;
            }
        };

        for (key, value) in actions {
            if value.as_unsigned_integer() == Some(255) || value.as_signed_integer() == Some(255) {
                continue;
            }

            input.remove(key);
            input.insert(key.to_owned(), value.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_response() {
        let mut ticket = plist::Dictionary::new();
        ticket.insert("ApImg4Ticket".into(), Value::Data(vec![1, 2, 3]));
        let xml = String::from_utf8(plist_to_xml_bytes(&ticket)).unwrap();
        let body = format!("STATUS=0&MESSAGE=SUCCESS&REQUEST_STRING={xml}");

        let parsed = parse_response(&body).unwrap();
        let parsed = parsed.into_dictionary().unwrap();
        assert_eq!(
            parsed.get("ApImg4Ticket"),
            Some(&Value::Data(vec![1, 2, 3]))
        );
    }

    #[test]
    fn rejects_failure_response() {
        let body = "STATUS=94&MESSAGE=This device isn't eligible for the requested build.";
        assert!(parse_response(body).is_err());
        assert!(parse_response("garbage").is_err());
    }

    #[test]
    fn rules_fold_matching_actions() {
        let mut entry = plist::Dictionary::new();
        entry.insert("Digest".into(), Value::Data(vec![]));

        let mut parameters = plist::Dictionary::new();
        parameters.insert("ApProductionMode".into(), true.into());
        parameters.insert("ApSupportsImg4".into(), true.into());

        let mut conditions = plist::Dictionary::new();
        conditions.insert("ApRawProductionMode".into(), true.into());
        let mut actions = plist::Dictionary::new();
        actions.insert("EPRO".into(), true.into());
        actions.insert("Skipped".into(), 255.into());
        let mut rule = plist::Dictionary::new();
        rule.insert("Conditions".into(), Value::Dictionary(conditions));
        rule.insert("Actions".into(), Value::Dictionary(actions));

        apply_restore_request_rules(
            &mut entry,
            &parameters,
            &[Value::Dictionary(rule)],
        );

        assert_eq!(entry.get("EPRO"), Some(&Value::Boolean(true)));
        assert!(entry.get("Skipped").is_none());
    }

    #[test]
    fn rules_with_unmet_conditions_do_nothing() {
        let mut entry = plist::Dictionary::new();

        let parameters = plist::Dictionary::new(); // no ApProductionMode

        let mut conditions = plist::Dictionary::new();
        conditions.insert("ApRawProductionMode".into(), true.into());
        let mut actions = plist::Dictionary::new();
        actions.insert("EPRO".into(), true.into());
        let mut rule = plist::Dictionary::new();
        rule.insert("Conditions".into(), Value::Dictionary(conditions));
        rule.insert("Actions".into(), Value::Dictionary(actions));

        apply_restore_request_rules(
            &mut entry,
            &parameters,
            &[Value::Dictionary(rule)],
        );

        assert!(entry.is_empty());
    }
}
