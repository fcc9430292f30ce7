//! BIP21 payment URIs
//!
//! `bitcoin:<address>?amount=<BTC>&label=<text>&message=<text>&lightning=<invoice>`
//!
//! Producing a URI includes only the fields that are set. Parsing accepts the
//! scheme in any case, ignores unknown parameters and rejects unknown
//! `req-` parameters, which a payer is required to understand.

use bitcoin::{Amount, Denomination};
use std::fmt;
use std::str::FromStr;
use url::form_urlencoded;
use url::Url;

use crate::address::validate_address;
use crate::{CoreError, Network};

const SCHEME: &str = "bitcoin";

// ============================================================================
// Data Structures
// ============================================================================

/// Payment request as carried by a `bitcoin:` URI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentUri {
    /// On-chain address; may be empty for lightning-only requests
    pub address: String,
    pub amount_sats: Option<u64>,
    pub label: Option<String>,
    pub message: Option<String>,
    /// BOLT11 invoice for unified QR codes
    pub lightning: Option<String>,
}

impl PaymentUri {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_amount(mut self, sats: u64) -> Self {
        self.amount_sats = Some(sats);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_lightning(mut self, invoice: impl Into<String>) -> Self {
        self.lightning = Some(invoice.into());
        self
    }

    /// Check the address against `network`
    pub fn validate(&self, network: Network) -> Result<(), CoreError> {
        if self.address.is_empty() {
            if self.lightning.is_none() {
                return Err(CoreError::InvalidUri("no address or invoice".to_string()));
            }
            return Ok(());
        }
        validate_address(&self.address, network).map(|_| ())
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Format sats as a BTC decimal without trailing zeros
fn format_btc(sats: u64) -> String {
    let whole = sats / 100_000_000;
    let fraction = sats % 100_000_000;
    if fraction == 0 {
        return whole.to_string();
    }
    let digits = format!("{:08}", fraction);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl fmt::Display for PaymentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());

        if let Some(sats) = self.amount_sats.filter(|s| *s > 0) {
            query.append_pair("amount", &format_btc(sats));
        }
        if let Some(label) = non_empty(&self.label) {
            query.append_pair("label", label);
        }
        if let Some(message) = non_empty(&self.message) {
            query.append_pair("message", message);
        }
        if let Some(lightning) = non_empty(&self.lightning) {
            query.append_pair("lightning", lightning);
        }

        // A literal '+' is already escaped as %2B, so every '+' left is a space
        let query = query.finish().replace('+', "%20");

        write!(f, "{}:{}", SCHEME, self.address)?;
        if !query.is_empty() {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

// ============================================================================
// Parsing
// ============================================================================

impl FromStr for PaymentUri {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s.trim()).map_err(|e| CoreError::InvalidUri(e.to_string()))?;
        if url.scheme() != SCHEME {
            return Err(CoreError::InvalidUri(format!("unsupported scheme {}", url.scheme())));
        }

        let mut uri = PaymentUri::new(url.path().trim());

        for (key, value) in url.query_pairs() {
            let key = key.to_lowercase();
            match key.as_str() {
                "amount" => {
                    let amount = Amount::from_str_in(&value, Denomination::Bitcoin)
                        .map_err(|e| CoreError::InvalidUri(format!("amount {}: {}", value, e)))?;
                    uri.amount_sats = Some(amount.to_sat());
                }
                "label" => uri.label = Some(value.into_owned()),
                "message" => uri.message = Some(value.into_owned()),
                "lightning" => uri.lightning = Some(value.into_owned()),
                other if other.starts_with("req-") => {
                    return Err(CoreError::InvalidUri(format!(
                        "unsupported required parameter {}",
                        other
                    )));
                }
                _ => {}
            }
        }

        if uri.address.is_empty() && uri.lightning.is_none() {
            return Err(CoreError::InvalidUri("no address or invoice".to_string()));
        }

        Ok(uri)
    }
}
