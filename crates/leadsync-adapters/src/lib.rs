//! Outbound collaborators: the Auvo API, reverse geocoding, the CRM Lead
//! Creator and failure notification sinks, plus free-text address parsing.

pub mod address;
pub mod auvo;
pub mod crm;
pub mod geocoding;
pub mod http;
pub mod notify;

pub use address::{state_name, AddressParts, FreeTextAddressParser, DEFAULT_COUNTRY};
pub use auvo::{
    AuvoClient, AuvoConfig, CustomerFilter, UpstreamApi, UpstreamError, CUSTOMER_PAGE_SIZE,
    DEFAULT_AUVO_API_URL, DEFAULT_PAGE_SIZE,
};
pub use crm::{AutomationError, HttpLeadCreator, LeadCreator};
pub use geocoding::{
    are_coordinates_valid, parse_google_address, GeocodeResponse, GeocodedAddress, Geocoder,
    GeocodingError, GoogleGeocoder,
};
pub use http::{BackoffPolicy, HttpClientConfig};
pub use notify::{FailureNotice, Notifier, NotifyError, TracingNotifier, WebhookNotifier};

pub const CRATE_NAME: &str = "leadsync-adapters";
