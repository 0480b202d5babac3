//! Reconciliation of provider-side invoices with the purchase ledger.
//!
//! A [`Reconciler`] run asks one provider about every reclaimable purchase,
//! completes the paid ones and fails the cancelled ones. [`spawn_periodic`]
//! drives runs on a fixed interval until cancelled.

mod scheduler;

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, instrument, warn};

pub use self::scheduler::{PollSettings, spawn_periodic};
use crate::{
    audit::{AuditEvent, AuditEventType, audit_log},
    error::{Result, ShopError},
    payment::{
        CompletionOutcome, InvoiceMetadata, InvoiceState, InvoiceStatus, PaymentProvider,
        PaymentService, not_pollable,
    },
    purchase::{Provider, Purchase},
};

/// Counters of one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Reclaimable purchases found in the ledger.
    pub pending: usize,
    /// Invoices the provider reported paid.
    pub confirmed: usize,
    /// Purchases completed by this run.
    pub completed: usize,
    /// Paid purchases some other completer already handled.
    pub already_processed: usize,
    /// Purchases failed because their invoice was cancelled or expired.
    pub cancelled: usize,
    /// Items skipped because of an error.
    pub errors: usize,
}

impl ReconcileReport {
    /// Returns `true` when the run changed nothing and saw no errors.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.completed == 0 && self.cancelled == 0 && self.errors == 0
    }
}

/// Runs reconciliation passes for pollable providers.
#[derive(Debug, Clone)]
pub struct Reconciler {
    service: PaymentService,
}

impl Reconciler {
    /// Creates a reconciler completing purchases through `service`.
    #[must_use]
    pub const fn new(service: PaymentService) -> Self {
        Self { service }
    }

    /// One pass over the reclaimable purchases of `provider`.
    ///
    /// Item-level failures are counted in [`ReconcileReport::errors`] and do
    /// not stop the pass.
    ///
    /// # Errors
    ///
    /// - [`ShopError::ProviderUnavailable`] when the provider cannot be polled
    ///   or is not configured
    /// - the ledger query failure or a failed batch status query
    #[instrument(skip(self), fields(provider = %provider))]
    pub async fn run_once(&self, provider: Provider) -> Result<ReconcileReport> {
        if !provider.is_pollable() {
            return Err(not_pollable(provider));
        }
        let client = self.service.provider(provider)?;
        let pending = self
            .service
            .store()
            .reclaimable_by_provider(provider, self.service.stale_before())
            .await?;

        let mut report = ReconcileReport { pending: pending.len(), ..ReconcileReport::default() };
        if pending.is_empty() {
            return Ok(report);
        }

        let by_correlation: HashMap<&str, &Purchase> = pending
            .iter()
            .filter_map(|p| p.correlation_id.as_deref().map(|id| (id, p)))
            .collect();
        let ids: Vec<String> = by_correlation.keys().map(|id| (*id).to_owned()).collect();

        let statuses = self.fetch_statuses(client.as_ref(), &ids, &mut report).await?;
        for status in statuses {
            let Some(purchase) = by_correlation.get(status.correlation_id.as_str()).copied() else {
                debug!(
                    correlation_id = %status.correlation_id,
                    "status for unknown invoice ignored"
                );
                continue;
            };
            match status.state {
                InvoiceState::Pending => {}
                InvoiceState::Paid => {
                    report.confirmed += 1;
                    self.complete_paid(purchase, &status, &mut report).await;
                }
                InvoiceState::Cancelled => self.cancel(purchase, &mut report).await,
            }
        }
        Ok(report)
    }

    async fn fetch_statuses(
        &self,
        client: &dyn PaymentProvider,
        ids: &[String],
        report: &mut ReconcileReport,
    ) -> Result<Vec<InvoiceStatus>> {
        if client.supports_batch() {
            return client.invoice_statuses(ids).await;
        }
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            match client.invoice_status(id).await {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    warn!(correlation_id = %id, error = %e, "invoice status query failed");
                    report.errors += 1;
                }
            }
        }
        Ok(statuses)
    }

    async fn complete_paid(
        &self,
        purchase: &Purchase,
        status: &InvoiceStatus,
        report: &mut ReconcileReport,
    ) {
        if let Err(e) = verify_metadata(purchase, status) {
            warn!(purchase_id = purchase.id, error = %e, "paid invoice skipped");
            report.errors += 1;
            return;
        }
        match self.service.process_purchase_by_id(purchase.id).await {
            Ok(CompletionOutcome::Completed) => report.completed += 1,
            Ok(CompletionOutcome::AlreadyProcessed) => report.already_processed += 1,
            Err(e) => {
                warn!(purchase_id = purchase.id, error = %e, "completion failed");
                report.errors += 1;
            }
        }
    }

    async fn cancel(&self, purchase: &Purchase, report: &mut ReconcileReport) {
        match self.service.store().fail(purchase.id).await {
            Ok(true) => {
                report.cancelled += 1;
                audit_log(&AuditEvent::for_purchase(AuditEventType::PurchaseCancelled, purchase));
            }
            Ok(false) => {
                debug!(purchase_id = purchase.id, "cancelled invoice for non-pending purchase");
            }
            Err(e) => {
                warn!(purchase_id = purchase.id, error = %e, "failed to mark purchase failed");
                report.errors += 1;
            }
        }
    }
}

/// Checks that a paid invoice really belongs to `purchase`.
fn verify_metadata(purchase: &Purchase, status: &InvoiceStatus) -> Result<()> {
    let payload = status.payload.as_deref().ok_or_else(|| {
        ShopError::InvalidInput(format!("invoice {} carries no metadata", status.correlation_id))
    })?;
    let metadata = InvoiceMetadata::decode(payload)?;
    if metadata.purchase_id != purchase.id {
        return Err(ShopError::InvalidInput(format!(
            "invoice {} names purchase {}, ledger has {}",
            status.correlation_id, metadata.purchase_id, purchase.id
        )));
    }
    Ok(())
}
