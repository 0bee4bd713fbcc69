use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tenant::SaleMode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleChannel {
    /// Sold at the counter.
    #[default]
    Local,
    /// Sold remotely; the ticket goes out by email.
    Online,
}

impl SaleChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleChannel::Local => "local",
            SaleChannel::Online => "online",
        }
    }
}

/// A fully validated sale, ready to be issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleDraft {
    pub company_id: i64,
    pub event_id: String,
    pub ticket_type_id: i64,
    pub quantity: u32,
    pub client_name: String,
    /// CPF digits only.
    pub client_document: String,
    pub client_document_type: String,
    /// `YYYY-MM-DD`, empty when not collected.
    pub client_birth_date: String,
    /// Digits only, empty when not collected.
    pub client_phone: String,
    pub client_email: Option<String>,
    pub sale_channel: SaleChannel,
    pub unit_price: f64,
    pub total_price: f64,
    pub mode: SaleMode,
}

impl SaleDraft {
    /// Body for the issuance proxy route.
    pub fn to_request(&self) -> Value {
        let mut body = json!({
            "companyId": self.company_id,
            "eventId": self.event_id,
            "ticketId": self.ticket_type_id,
            "quantity": self.quantity,
            "clientPhone": self.client_phone,
            "clientDocument": self.client_document,
            "clientDocumentType": self.client_document_type,
            "clientName": self.client_name,
            "clientBirthDate": self.client_birth_date,
            "saleType": self.sale_channel.as_str(),
            "unitPrice": self.unit_price,
            "totalPrice": self.total_price,
        });
        if let (Some(email), Some(map)) = (&self.client_email, body.as_object_mut()) {
            map.insert("clientEmail".to_string(), Value::from(email.clone()));
        }
        body
    }
}
