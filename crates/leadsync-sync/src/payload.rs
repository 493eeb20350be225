//! Builds the CRM payload from an Auvo customer, its task and the task owner.

use std::sync::Arc;

use leadsync_adapters::{
    are_coordinates_valid, FreeTextAddressParser, GeocodedAddress, Geocoder, DEFAULT_COUNTRY,
};
use leadsync_core::{Contact, Customer, LeadFields, LeadPayload, PayloadContext, Task, User};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::UserAllowlist;

pub const LEAD_STATUS: &str = "Cadastrado";
pub const LEAD_SOURCE: &str = "Prospeccao Consultor";
pub const MISSING_JOB_MARKER: &str = "não preenchido";

/// CRM fields the form requires, with their labels in the CRM UI.
pub const REQUIRED_FIELDS: [(&str, &str); 14] = [
    ("leadstatus", "Status do Lead"),
    ("company", "Empresa"),
    ("leadsource", "Fonte do Lead"),
    ("description", "Descrição"),
    ("lastname", "Sobrenome"),
    ("cf_995", "Logradouro"),
    ("cf_763", "Número"),
    ("cf_767", "Bairro"),
    ("city", "Cidade"),
    ("cf_993", "Cidade Real"),
    ("state", "Estado"),
    ("cf_977", "UF"),
    ("code", "CEP"),
    ("country", "País"),
];

/// Required fields that were never set, or set but blank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldReport {
    pub missing: Vec<&'static str>,
    pub empty: Vec<&'static str>,
}

impl FieldReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.empty.is_empty()
    }

    fn labels(fields: &[&'static str]) -> Vec<&'static str> {
        fields
            .iter()
            .filter_map(|f| REQUIRED_FIELDS.iter().find(|(name, _)| name == f))
            .map(|(_, label)| *label)
            .collect()
    }
}

/// Advisory check; an incomplete payload is still submitted.
pub fn validate_fields(fields: &LeadFields) -> FieldReport {
    let mut report = FieldReport::default();
    for (name, _) in REQUIRED_FIELDS {
        match fields.field(name) {
            None => report.missing.push(name),
            Some(value) if value.trim().is_empty() => report.empty.push(name),
            Some(_) => {}
        }
    }
    report
}

/// `Name (Job)` when the contact has a job title, else `Name não preenchido`.
pub fn lastname_for(contact: Option<&Contact>) -> String {
    let name = contact.map(|c| c.name.trim()).unwrap_or_default();
    let job = contact.map(|c| c.job_position.trim()).unwrap_or_default();
    let lastname = if job.is_empty() {
        format!("{name} {MISSING_JOB_MARKER}")
    } else {
        format!("{name} ({job})")
    };
    lastname.trim().to_string()
}

pub struct PayloadBuilder {
    address_parser: FreeTextAddressParser,
    lead_separator_prefix: Regex,
    lead_word_prefix: Regex,
    whitespace: Regex,
    geocoder: Option<Arc<dyn Geocoder>>,
    geocoding: UserAllowlist,
}

impl PayloadBuilder {
    /// `geocoder` is `None` when no geocoding key is configured; geocoding is
    /// then skipped for everyone.
    pub fn new(
        geocoder: Option<Arc<dyn Geocoder>>,
        geocoding: UserAllowlist,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            address_parser: FreeTextAddressParser::new()?,
            lead_separator_prefix: Regex::new(r"(?i)^lead\s*[-/]\s*")?,
            lead_word_prefix: Regex::new(r"(?i)^lead\s+")?,
            whitespace: Regex::new(r"\s+")?,
            geocoder,
            geocoding,
        })
    }

    /// Strips `Lead - `, `Lead/`, `LEAD ` style prefixes, upper-cases and
    /// collapses whitespace.
    pub fn normalize_company_name(&self, raw: &str) -> String {
        let name = raw.trim();
        let name = self.lead_separator_prefix.replace(name, "");
        let name = self.lead_word_prefix.replace(&name, "");
        let upper = name.to_uppercase();
        self.whitespace.replace_all(&upper, " ").trim().to_string()
    }

    pub async fn build(&self, customer: Customer, task: Task, user: User) -> LeadPayload {
        let contact = customer.primary_contact();
        let mut fields = LeadFields {
            leadstatus: LEAD_STATUS.to_string(),
            company: self.normalize_company_name(&customer.description),
            phone: contact.map(|c| c.phone.clone()).unwrap_or_default(),
            email: contact.map(|c| c.email.clone()).unwrap_or_default(),
            leadsource: LEAD_SOURCE.to_string(),
            description: format!("Importado da Auvo id{}\n {}", customer.id, task.orientation),
            lastname: lastname_for(contact),
            complement: customer.address_complement.clone(),
            ..Default::default()
        };
        debug!(
            original = %customer.description,
            company = %fields.company,
            "company name normalized"
        );

        let geocoded = self.geocode(&customer, user.user_id).await;
        match geocoded {
            Some(address) => self.apply_geocoded(&mut fields, address, &customer.address),
            None if !customer.address.trim().is_empty() => {
                self.apply_free_text(&mut fields, &customer.address)
            }
            None => {}
        }
        if fields.country.as_deref().map_or(true, |c| c.trim().is_empty()) {
            fields.country = Some(DEFAULT_COUNTRY.to_string());
        }

        let report = validate_fields(&fields);
        if !report.is_complete() {
            warn!(
                upstream_id = customer.id,
                missing = ?FieldReport::labels(&report.missing),
                empty = ?FieldReport::labels(&report.empty),
                "payload has missing or empty required fields"
            );
        }

        LeadPayload {
            vtiger: fields,
            others: PayloadContext::new(customer, task, user),
        }
    }

    async fn geocode(&self, customer: &Customer, user_id: i64) -> Option<GeocodedAddress> {
        let geocoder = self.geocoder.as_ref()?;
        if !self.geocoding.allows(user_id) {
            info!(user_id, "geocoding not enabled for user, using auvo address");
            return None;
        }
        if !are_coordinates_valid(customer.latitude, customer.longitude) {
            info!(upstream_id = customer.id, "invalid coordinates, using auvo address");
            return None;
        }
        match geocoder
            .reverse_geocode(customer.latitude, customer.longitude)
            .await
        {
            Ok(address) => Some(address),
            Err(err) => {
                warn!(
                    upstream_id = customer.id,
                    error = %err,
                    "geocoding failed, using auvo address"
                );
                None
            }
        }
    }

    fn apply_geocoded(&self, fields: &mut LeadFields, address: GeocodedAddress, raw_address: &str) {
        let text = |value: Option<String>| value.unwrap_or_default();
        let city_fallback = address
            .city
            .clone()
            .or_else(|| address.real_city.clone())
            .unwrap_or_default();

        let neighborhood = match address.neighborhood.filter(|n| !n.trim().is_empty()) {
            Some(from_geocoding) => from_geocoding,
            None => self
                .address_parser
                .extract_neighborhood(raw_address)
                .unwrap_or_else(|| city_fallback.clone()),
        };

        fields.street = Some(text(address.street));
        fields.number = Some(text(address.number));
        fields.neighborhood = Some(neighborhood);
        fields.city = Some(text(address.city));
        fields.real_city = Some(text(address.real_city));
        fields.state = Some(text(address.state));
        fields.state_code = Some(text(address.state_code));
        fields.postal_code = Some(text(address.postal_code));
        fields.country = Some(
            address
                .country
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_COUNTRY.to_string()),
        );
    }

    fn apply_free_text(&self, fields: &mut LeadFields, raw_address: &str) {
        let parts = self.address_parser.parse(raw_address);
        debug!(raw = raw_address, ?parts, "parsed auvo address");
        fields.street = Some(parts.street);
        fields.number = Some(parts.number);
        fields.neighborhood = Some(parts.neighborhood);
        fields.city = Some(parts.city.clone());
        fields.real_city = Some(parts.city);
        fields.state = Some(parts.state);
        fields.state_code = Some(parts.state_code);
        fields.postal_code = Some(parts.postal_code);
        fields.country = Some(parts.country);
    }
}
