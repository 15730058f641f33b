//! Per-event registration roster with invoice payment status.
use chrono::{DateTime, FixedOffset};
use std::fmt;
use tracing::{debug, warn};

use crate::client::MembershipApi;
use crate::error::SyncResult;
use crate::model::{EventRegistration, RegistrationFilter};

#[derive(Debug, Clone, PartialEq)]
pub struct RosterLine {
    pub registration_id: i64,
    pub contact_id: Option<i64>,
    pub contact_name: String,
    pub registration_type: String,
    pub fee: Option<f64>,
    pub registered_at: Option<DateTime<FixedOffset>>,
    pub invoice_number: Option<String>,
    /// From the invoice when there is one, else from the registration itself.
    pub paid: Option<bool>,
}

impl RosterLine {
    fn from_registration(reg: &EventRegistration) -> Self {
        Self {
            registration_id: reg.id,
            contact_id: reg.contact.as_ref().map(|c| c.id),
            contact_name: reg
                .contact
                .as_ref()
                .and_then(|c| c.name.clone())
                .unwrap_or_default(),
            registration_type: reg
                .registration_type
                .as_ref()
                .and_then(|t| t.name.clone())
                .unwrap_or_default(),
            fee: reg.registration_fee,
            registered_at: reg.registration_date,
            invoice_number: None,
            paid: reg.is_paid,
        }
    }
}

impl fmt::Display for RosterLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paid = match self.paid {
            Some(true) => "paid",
            Some(false) => "unpaid",
            None => "unknown",
        };
        write!(
            f,
            "{}\t{}\t{} ${:.2}\t{}\tinvoice {}\t{}",
            self.registration_id,
            self.contact_name,
            self.registration_type,
            self.fee.unwrap_or(0.0),
            self.registered_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.invoice_number.as_deref().unwrap_or("-"),
            paid
        )
    }
}

/// List an event's registrations in registration order, resolving each invoice.
///
/// A failed invoice lookup leaves the line with the registration's own paid flag.
/// Fatal errors abort.
pub async fn event_roster<A: MembershipApi + ?Sized>(
    api: &A,
    event_id: i64,
) -> SyncResult<Vec<RosterLine>> {
    let mut registrations = api
        .list_event_registrations(RegistrationFilter::Event(event_id))
        .await?;
    registrations.sort_by_key(|r| r.registration_date);
    debug!(event_id, count = registrations.len(), "event registrations listed");

    let mut lines = Vec::with_capacity(registrations.len());
    for reg in &registrations {
        let mut line = RosterLine::from_registration(reg);
        if let Some(invoice) = &reg.invoice {
            match api.get_invoice(invoice.id).await {
                Ok(inv) => {
                    line.invoice_number = inv.document_number;
                    if inv.is_paid.is_some() {
                        line.paid = inv.is_paid;
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(invoice_id = invoice.id, error = %err, "invoice lookup failed");
                }
            }
        }
        lines.push(line);
    }
    Ok(lines)
}
