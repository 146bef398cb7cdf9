pub mod models;
pub mod validation;

pub use models::{payload_digest, InvoiceLine, InvoiceRequest};
