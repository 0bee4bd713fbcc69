use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    pub output: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    #[serde(default)]
    pub attendee_name: Option<String>,
    #[serde(default)]
    pub downloads: Vec<Download>,
}

/// Ticket order returned by the issuance backend. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedTicket {
    #[serde(default)]
    pub code: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub total: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub downloads: Vec<Download>,
}

impl IssuedTicket {
    /// Parses an upstream reply. Anything without a non-empty order code is
    /// not a ticket.
    pub fn from_reply(reply: Value) -> Option<Self> {
        serde_json::from_value::<IssuedTicket>(reply)
            .ok()
            .filter(|t| !t.code.trim().is_empty())
    }

    /// Document of the whole order, if one was rendered.
    pub fn pdf_url(&self) -> Option<&str> {
        self.downloads
            .iter()
            .find(|d| d.output == "pdf")
            .map(|d| d.url.as_str())
    }
}

// Totals arrive as decimal strings from one backend and as numbers from another
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}
