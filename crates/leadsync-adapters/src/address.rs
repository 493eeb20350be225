//! Free-text address parsing for Auvo's single-line addresses.
//!
//! This is a lossy, best-effort fallback for when reverse geocoding is not
//! applied or fails. It splits on commas and guesses fields by position and
//! shape, so addresses with unusual segment counts can be misread.
//!
//! Typical inputs:
//! - `Rod. Fernão Dias, 381 - ZONA RURAL, São Sebastião da Bela Vista - MG, 37567-000, Brasil`
//! - `Rua das Flores, 123, Centro, Cidade - UF, CEP, Brasil`
//! - `Local, Bairro, Cidade - UF, Brasil`

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_COUNTRY: &str = "Brasil";

const STATES: [(&str, &str); 27] = [
    ("AC", "Acre"),
    ("AL", "Alagoas"),
    ("AP", "Amapá"),
    ("AM", "Amazonas"),
    ("BA", "Bahia"),
    ("CE", "Ceará"),
    ("DF", "Distrito Federal"),
    ("ES", "Espírito Santo"),
    ("GO", "Goiás"),
    ("MA", "Maranhão"),
    ("MT", "Mato Grosso"),
    ("MS", "Mato Grosso do Sul"),
    ("MG", "Minas Gerais"),
    ("PA", "Pará"),
    ("PB", "Paraíba"),
    ("PR", "Paraná"),
    ("PE", "Pernambuco"),
    ("PI", "Piauí"),
    ("RJ", "Rio de Janeiro"),
    ("RN", "Rio Grande do Norte"),
    ("RS", "Rio Grande do Sul"),
    ("RO", "Rondônia"),
    ("RR", "Roraima"),
    ("SC", "Santa Catarina"),
    ("SP", "São Paulo"),
    ("SE", "Sergipe"),
    ("TO", "Tocantins"),
];

/// Full state name for a two-letter federative unit code.
pub fn state_name(uf: &str) -> Option<&'static str> {
    let uf = uf.trim().to_ascii_uppercase();
    STATES
        .iter()
        .find(|(code, _)| *code == uf)
        .map(|(_, name)| *name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressParts {
    pub street: String,
    pub number: String,
    pub neighborhood: String,
    pub city: String,
    pub state: String,
    pub state_code: String,
    pub postal_code: String,
    pub country: String,
}

impl Default for AddressParts {
    fn default() -> Self {
        Self {
            street: String::new(),
            number: String::new(),
            neighborhood: String::new(),
            city: String::new(),
            state: String::new(),
            state_code: String::new(),
            postal_code: String::new(),
            country: DEFAULT_COUNTRY.to_string(),
        }
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone)]
pub struct FreeTextAddressParser {
    postal_code: Regex,
    country: Regex,
    city_uf: Regex,
    street_number: Regex,
    number_neighborhood: Regex,
    street_prefix: Regex,
}

impl FreeTextAddressParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            postal_code: Regex::new(r"(\d{5}-?\d{3})")?,
            country: Regex::new(r"(?i)^(brasil|brazil)$")?,
            city_uf: Regex::new(r"^(.+?)\s*-\s*([A-Z]{2})$")?,
            street_number: Regex::new(r"^(.+?)\s+(\d+)(?:\s*-\s*(.+))?$")?,
            number_neighborhood: Regex::new(r"^(\d+)\s*-\s*(.+)$")?,
            street_prefix: Regex::new(
                r"(?i)^(Rua|Av\.|Avenida|Rod\.|Rodovia|Estrada|Travessa|Alameda)",
            )?,
        })
    }

    pub fn parse(&self, raw: &str) -> AddressParts {
        let mut out = AddressParts::default();
        let parts: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        for (i, part) in parts.iter().copied().enumerate() {
            if let Some(caps) = self.postal_code.captures(part) {
                out.postal_code = caps[1].to_string();
                continue;
            }
            if self.country.is_match(part) {
                out.country = DEFAULT_COUNTRY.to_string();
                continue;
            }
            if let Some(caps) = self.city_uf.captures(part) {
                out.city = caps[1].trim().to_string();
                out.state_code = caps[2].to_string();
                out.state = state_name(&caps[2]).unwrap_or_default().to_string();
                continue;
            }

            match i {
                0 => match self.street_number.captures(part) {
                    Some(caps) => {
                        out.street = caps[1].trim().to_string();
                        out.number = caps[2].to_string();
                        if let Some(neighborhood) = caps.get(3) {
                            out.neighborhood = neighborhood.as_str().trim().to_string();
                        }
                    }
                    None => out.street = part.to_string(),
                },
                1 => {
                    if is_digits(part) {
                        out.number = part.to_string();
                    } else if let Some(caps) = self.number_neighborhood.captures(part) {
                        out.number = caps[1].to_string();
                        out.neighborhood = caps[2].trim().to_string();
                    } else if out.neighborhood.is_empty() && !part.contains(" - ") {
                        out.neighborhood = part.to_string();
                    }
                }
                _ => {
                    if out.neighborhood.is_empty() && !part.contains(" - ") && !is_digits(part) {
                        out.neighborhood = part.to_uppercase();
                    }
                }
            }
        }
        out
    }

    /// Neighborhood guess used when geocoding returned none: the second
    /// segment unless it is a `City - UF` pair, else the first segment when it
    /// does not look like a street line.
    pub fn extract_neighborhood(&self, raw: &str) -> Option<String> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        if parts.len() >= 3 && !parts[1].is_empty() && !parts[1].contains(" - ") {
            return Some(parts[1].to_string());
        }
        if parts.len() >= 2 {
            let first = parts[0];
            let has_digit = first.chars().any(|c| c.is_ascii_digit());
            if !first.is_empty() && !has_digit && !self.street_prefix.is_match(first) {
                return Some(first.to_string());
            }
        }
        None
    }
}
