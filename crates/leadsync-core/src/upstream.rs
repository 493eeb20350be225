//! Auvo entities and the uniform response envelope the client hands back.

use serde::{Deserialize, Deserializer, Serialize};

/// Auvo sends `null` for plenty of documented string/number fields.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiPaging {
    pub order: i64,
    pub page_size: i64,
    pub page: i64,
    pub total_items: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiLink {
    pub href: String,
    pub rel: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResult<T> {
    #[serde(default, deserialize_with = "null_default")]
    pub entity_list: Vec<T>,
    #[serde(default, deserialize_with = "null_default")]
    pub paged_search_return_data: ApiPaging,
    #[serde(default, deserialize_with = "null_default")]
    pub links: Vec<ApiLink>,
}

impl<T> Default for ApiResult<T> {
    fn default() -> Self {
        Self {
            entity_list: Vec::new(),
            paged_search_return_data: ApiPaging::default(),
            links: Vec::new(),
        }
    }
}

impl<T> ApiResult<T> {
    pub fn empty(page: i64, page_size: i64) -> Self {
        Self {
            entity_list: Vec::new(),
            paged_search_return_data: ApiPaging {
                order: 0,
                page_size,
                page,
                total_items: 0,
            },
            links: Vec::new(),
        }
    }

    pub fn single(entity: T) -> Self {
        Self {
            entity_list: vec![entity],
            paged_search_return_data: ApiPaging {
                order: 0,
                page_size: 10,
                page: 1,
                total_items: 1,
            },
            links: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiData<T> {
    pub result: ApiResult<T>,
}

/// `success: false` with an empty list means the fetch failed, as opposed to
/// `success: true` with an empty list, which means "no results".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub status: u16,
    pub data: ApiData<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(status: u16, result: ApiResult<T>) -> Self {
        Self {
            success: true,
            status,
            data: ApiData { result },
        }
    }

    pub fn failed(status: u16, page: i64, page_size: i64) -> Self {
        Self {
            success: false,
            status,
            data: ApiData {
                result: ApiResult::empty(page, page_size),
            },
        }
    }

    pub fn entities(&self) -> &[T] {
        &self.data.result.entity_list
    }

    pub fn into_entities(self) -> Vec<T> {
        self.data.result.entity_list
    }

    /// First entity of a successful response.
    pub fn into_first(self) -> Option<T> {
        if !self.success {
            return None;
        }
        self.into_entities().into_iter().next()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Contact {
    pub id: i64,
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub job_position: String,
    #[serde(deserialize_with = "null_default")]
    pub email: String,
    #[serde(deserialize_with = "null_default")]
    pub phone: String,
}

/// Auvo customer; becomes the CRM lead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Customer {
    pub id: i64,
    #[serde(deserialize_with = "null_default")]
    pub description: String,
    #[serde(deserialize_with = "null_default")]
    pub cpf_cnpj: String,
    #[serde(deserialize_with = "null_default")]
    pub external_id: String,
    #[serde(deserialize_with = "null_default")]
    pub phone_number: Vec<String>,
    #[serde(deserialize_with = "null_default")]
    pub email: Vec<String>,
    #[serde(deserialize_with = "null_default")]
    pub manager: String,
    #[serde(deserialize_with = "null_default")]
    pub note: String,
    #[serde(deserialize_with = "null_default")]
    pub address: String,
    // Auvo's spelling.
    #[serde(rename = "adressComplement", deserialize_with = "null_default")]
    pub address_complement: String,
    #[serde(deserialize_with = "null_default")]
    pub latitude: f64,
    #[serde(deserialize_with = "null_default")]
    pub longitude: f64,
    #[serde(deserialize_with = "null_default")]
    pub segment_id: i64,
    #[serde(deserialize_with = "null_default")]
    pub active: bool,
    #[serde(deserialize_with = "null_default")]
    pub date_last_update: String,
    #[serde(deserialize_with = "null_default")]
    pub creation_date: String,
    #[serde(deserialize_with = "null_default")]
    pub contacts: Vec<Contact>,
}

impl Customer {
    /// `YYYY-MM-DD` prefix of `creation_date`, which Auvo sends either as
    /// `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD HH:MM:SS`.
    pub fn creation_day(&self) -> &str {
        let date = self.creation_date.split('T').next().unwrap_or_default();
        date.split(' ').next().unwrap_or_default()
    }

    pub fn primary_contact(&self) -> Option<&Contact> {
        self.contacts.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Task {
    #[serde(rename = "taskID")]
    pub task_id: i64,
    #[serde(deserialize_with = "null_default")]
    pub external_id: String,
    #[serde(deserialize_with = "null_default")]
    pub id_user_from: i64,
    #[serde(deserialize_with = "null_default")]
    pub user_from_name: String,
    #[serde(deserialize_with = "null_default")]
    pub id_user_to: i64,
    #[serde(deserialize_with = "null_default")]
    pub user_to_name: String,
    #[serde(deserialize_with = "null_default")]
    pub customer_id: i64,
    #[serde(deserialize_with = "null_default")]
    pub customer_description: String,
    #[serde(deserialize_with = "null_default")]
    pub task_type_description: String,
    #[serde(deserialize_with = "null_default")]
    pub creation_date: String,
    #[serde(deserialize_with = "null_default")]
    pub task_date: String,
    #[serde(deserialize_with = "null_default")]
    pub latitude: f64,
    #[serde(deserialize_with = "null_default")]
    pub longitude: f64,
    #[serde(deserialize_with = "null_default")]
    pub address: String,
    #[serde(deserialize_with = "null_default")]
    pub orientation: String,
    #[serde(deserialize_with = "null_default")]
    pub finished: bool,
    #[serde(deserialize_with = "null_default")]
    pub task_status: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "userID")]
    pub user_id: i64,
    #[serde(deserialize_with = "null_default")]
    pub external_id: String,
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub login: String,
    #[serde(deserialize_with = "null_default")]
    pub email: String,
    #[serde(deserialize_with = "null_default")]
    pub smart_phone_number: String,
    #[serde(deserialize_with = "null_default")]
    pub culture: String,
    #[serde(deserialize_with = "null_default")]
    pub job_position: String,
    #[serde(deserialize_with = "null_default")]
    pub address: String,
    #[serde(deserialize_with = "null_default")]
    pub registration_date: String,
}
