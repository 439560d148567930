//! Lead facts extracted mid-call by the remote agent's tool invocations.
//!
//! The merge rule is additive: a tool call only ever sets or replaces fields
//! it names. Absent fields leave earlier values untouched, so partial updates
//! accumulate across the call instead of clobbering each other.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Tool name the remote agent invokes to record lead details.
pub const UPDATE_LEAD_TOOL: &str = "updateLeadInfo";

/// Tool name the remote agent invokes when it intends to hang up.
pub const END_CALL_TOOL: &str = "endCall";

/// Snapshot of everything learned about the caller so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadSnapshot {
    pub full_name: Option<String>,
    pub mobile: Option<String>,
    pub location: Option<String>,
    pub diamond_shape: Option<String>,
    pub price_range: Option<String>,
    pub carat_size: Option<String>,
    pub summary: Option<String>,
}

/// One tool-call payload. Every field is optional; only the fields present
/// in the call get merged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeadUpdate {
    pub full_name: Option<String>,
    pub mobile: Option<String>,
    pub location: Option<String>,
    pub diamond_shape: Option<String>,
    pub price_range: Option<String>,
    pub carat_size: Option<String>,
    pub summary: Option<String>,
}

impl LeadSnapshot {
    /// Additive merge: present fields replace, absent fields are left alone.
    pub fn merge(&mut self, update: LeadUpdate) {
        if let Some(v) = update.full_name {
            self.full_name = Some(v);
        }
        if let Some(v) = update.mobile {
            self.mobile = Some(v);
        }
        if let Some(v) = update.location {
            self.location = Some(v);
        }
        if let Some(v) = update.diamond_shape {
            self.diamond_shape = Some(v);
        }
        if let Some(v) = update.price_range {
            self.price_range = Some(v);
        }
        if let Some(v) = update.carat_size {
            self.carat_size = Some(v);
        }
        if let Some(v) = update.summary {
            self.summary = Some(v);
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == LeadSnapshot::default()
    }
}

/// Function declarations advertised to the remote agent in the session setup.
pub fn tool_declarations() -> Value {
    json!([
        {
            "name": UPDATE_LEAD_TOOL,
            "description": "Updates the user lead information during the call.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "fullName": { "type": "STRING", "description": "User full name" },
                    "mobile": { "type": "STRING", "description": "User mobile number" },
                    "location": { "type": "STRING", "description": "User location/city" },
                    "diamondShape": { "type": "STRING", "description": "Preferred diamond shape e.g. Round, Pear" },
                    "priceRange": { "type": "STRING", "description": "Budget/Price range" },
                    "caratSize": { "type": "STRING", "description": "Carat size preference" },
                    "summary": { "type": "STRING", "description": "Short summary of the consultation" }
                }
            }
        },
        {
            "name": END_CALL_TOOL,
            "description": "Ends the call after the closing script has been delivered.",
            "parameters": { "type": "OBJECT", "properties": {} }
        }
    ])
}
