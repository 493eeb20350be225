//! CRM creation payload: the lead fields plus the Auvo context they came from.

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::upstream::{ApiData, ApiResult, Customer, Task, User};
use crate::UpstreamId;

/// Lead fields keyed by the CRM's form field names (`cf_*` are custom fields).
///
/// Address fields are optional so that "never filled" and "filled but empty"
/// stay distinguishable for required-field validation. Form fields without a
/// typed slot (extra `cf_*` fields added by an operator) live in `extra` and
/// are sent as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadFields {
    pub leadstatus: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_user_id: Option<String>,
    pub company: String,
    pub phone: String,
    pub email: String,
    pub leadsource: String,
    pub description: String,
    pub lastname: String,
    #[serde(rename = "cf_765")]
    pub complement: String,
    #[serde(rename = "cf_995", skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(rename = "cf_763", skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(rename = "cf_767", skip_serializing_if = "Option::is_none")]
    pub neighborhood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(rename = "cf_993", skip_serializing_if = "Option::is_none")]
    pub real_city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(rename = "cf_977", skip_serializing_if = "Option::is_none")]
    pub state_code: Option<String>,
    #[serde(rename = "code", skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LeadFields {
    /// Value of a field by its CRM name; `None` when the field was never set.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "leadstatus" => Some(self.leadstatus.as_str()),
            "assigned_user_id" => self.assigned_user_id.as_deref(),
            "company" => Some(self.company.as_str()),
            "phone" => Some(self.phone.as_str()),
            "email" => Some(self.email.as_str()),
            "leadsource" => Some(self.leadsource.as_str()),
            "description" => Some(self.description.as_str()),
            "lastname" => Some(self.lastname.as_str()),
            "cf_765" => Some(self.complement.as_str()),
            "cf_995" => self.street.as_deref(),
            "cf_763" => self.number.as_deref(),
            "cf_767" => self.neighborhood.as_deref(),
            "city" => self.city.as_deref(),
            "cf_993" => self.real_city.as_deref(),
            "state" => self.state.as_deref(),
            "cf_977" => self.state_code.as_deref(),
            "code" => self.postal_code.as_deref(),
            "country" => self.country.as_deref(),
            other => self.extra.get(other).and_then(Value::as_str),
        }
    }
}

/// Auvo context carried next to the lead fields. The CRM form automation reads
/// the task owner from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadContext {
    #[serde(rename = "AlreadyExists", default)]
    pub already_exists: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub status: u16,
    pub data: ApiData<User>,
    #[serde(rename = "Lead")]
    pub lead: Customer,
    #[serde(rename = "Task")]
    pub task: Task,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PayloadContext {
    pub fn new(customer: Customer, task: Task, user: User) -> Self {
        Self {
            already_exists: false,
            success: true,
            status: 200,
            data: ApiData {
                result: ApiResult::single(user),
            },
            lead: customer,
            task,
            extra: Map::new(),
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.data.result.entity_list.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadPayload {
    pub vtiger: LeadFields,
    pub others: PayloadContext,
}

impl LeadPayload {
    pub fn upstream_id(&self) -> Option<UpstreamId> {
        (self.others.lead.id > 0).then_some(UpstreamId(self.others.lead.id))
    }

    /// Reads a stored payload in either of the shapes the request log holds:
    /// a one-element array (sync and webhook rows) or a bare object.
    pub fn from_stored(raw: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        match value {
            Value::Array(items) => match items.into_iter().next() {
                Some(first) => serde_json::from_value(first),
                None => Err(serde_json::Error::custom("stored payload array is empty")),
            },
            other => serde_json::from_value(other),
        }
    }

    /// Serialized form written by the sync path: a one-element array.
    pub fn to_stored(&self) -> serde_json::Result<String> {
        serde_json::to_string(&[self])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LeadPayload {
        let customer = Customer {
            id: 4411,
            description: "Lead - Padaria Sol".into(),
            ..Default::default()
        };
        let task = Task {
            task_id: 9,
            user_from_name: "Carlos Souza".into(),
            ..Default::default()
        };
        let user = User {
            user_id: 213670,
            name: "Carlos Souza".into(),
            job_position: "Consultor".into(),
            ..Default::default()
        };
        LeadPayload {
            vtiger: LeadFields {
                company: "PADARIA SOL".into(),
                street: Some("Rua A".into()),
                ..Default::default()
            },
            others: PayloadContext::new(customer, task, user),
        }
    }

    #[test]
    fn stored_payload_reads_array_and_object_forms() {
        let payload = sample();
        let stored = payload.to_stored().unwrap();
        assert!(stored.starts_with('['));
        assert_eq!(LeadPayload::from_stored(&stored).unwrap(), payload);

        let bare = serde_json::to_string(&payload).unwrap();
        assert_eq!(LeadPayload::from_stored(&bare).unwrap(), payload);
        assert!(LeadPayload::from_stored("[]").is_err());
    }

    #[test]
    fn untyped_form_fields_survive_a_reload() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["vtiger"]["cf_9999"] = Value::from("Indicação");

        let payload = LeadPayload::from_value(value).unwrap();
        assert_eq!(payload.vtiger.field("cf_9999"), Some("Indicação"));
        assert_eq!(payload.vtiger.company, "PADARIA SOL");

        let sent = serde_json::to_value(&payload).unwrap();
        assert_eq!(sent["vtiger"]["cf_9999"], "Indicação");
        assert_eq!(sent["vtiger"]["cf_995"], "Rua A");
    }

    #[test]
    fn wrongly_typed_known_field_is_rejected() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["vtiger"]["company"] = Value::Null;
        assert!(LeadPayload::from_value(value).is_err());
    }

    #[test]
    fn lead_fields_use_crm_field_names() {
        let value = serde_json::to_value(&sample().vtiger).unwrap();
        assert_eq!(value["cf_995"], "Rua A");
        assert!(value.get("cf_763").is_none());
        assert_eq!(sample().vtiger.field("cf_995"), Some("Rua A"));
        assert_eq!(sample().vtiger.field("cf_763"), None);
    }

    #[test]
    fn upstream_id_comes_from_the_lead_context() {
        assert_eq!(sample().upstream_id(), Some(UpstreamId(4411)));
        assert_eq!(sample().others.user().unwrap().user_id, 213670);
    }
}
