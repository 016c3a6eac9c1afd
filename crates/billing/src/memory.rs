//! In-memory store implementations
//!
//! Used by tests and local runs without Postgres. They mirror the database
//! constraints that the webhook path depends on: a unique event id, and one
//! document per payment event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivitySink};
use crate::documents::{
    document_number, DocumentStore, DonationReceipt, InvoiceDraft, ReceiptDraft, ServiceInvoice,
    INVOICE_PREFIX, RECEIPT_PREFIX,
};
use crate::error::{BillingError, BillingResult};
use crate::idempotency::{
    DocumentStatus, NewPaymentEvent, PaymentEvent, PaymentEventStore, RecordOutcome,
};
use crate::orders::{NewOrder, OrderLedger, OrderRecord};
use crate::reporting::{ErrorReport, ErrorReporter, ReportContext};

/// Payment events keyed by provider event id
#[derive(Default)]
pub struct InMemoryPaymentEventStore {
    events: Mutex<HashMap<String, PaymentEvent>>,
    unavailable: AtomicBool,
}

impl InMemoryPaymentEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the database were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn count(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn all(&self) -> Vec<PaymentEvent> {
        self.events.lock().await.values().cloned().collect()
    }

    /// Shift an event's recorded time, for reconciliation tests
    pub async fn backdate(&self, provider_event_id: &str, by: time::Duration) {
        if let Some(event) = self.events.lock().await.get_mut(provider_event_id) {
            event.processed_at -= by;
        }
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Database("payment_events unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentEventStore for InMemoryPaymentEventStore {
    async fn record_if_new(&self, event: &NewPaymentEvent) -> BillingResult<RecordOutcome> {
        self.check_available()?;
        let mut events = self.events.lock().await;

        if let Some(existing) = events.get(&event.provider_event_id) {
            return Ok(RecordOutcome::AlreadyKnown(existing.clone()));
        }

        let now = OffsetDateTime::now_utc();
        let row = PaymentEvent {
            id: Uuid::new_v4(),
            provider_event_id: event.provider_event_id.clone(),
            event_type: event.event_type.clone(),
            payment_id: event.payment_id.clone(),
            order_id: event.order_id.clone(),
            amount: event.amount,
            currency: event.currency.clone(),
            status: event.status.clone(),
            notes: event.notes.clone(),
            document_status: DocumentStatus::Pending,
            status_detail: None,
            processed_at: now,
            updated_at: now,
        };
        events.insert(event.provider_event_id.clone(), row.clone());
        Ok(RecordOutcome::Inserted(row))
    }

    async fn find_by_event_id(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<PaymentEvent>> {
        self.check_available()?;
        Ok(self.events.lock().await.get(provider_event_id).cloned())
    }

    async fn mark_document_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        detail: Option<&str>,
    ) -> BillingResult<()> {
        self.check_available()?;
        let mut events = self.events.lock().await;
        let event = events
            .values_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| BillingError::NotFound(format!("payment event {}", id)))?;
        event.document_status = status;
        event.status_detail = detail.map(str::to_string);
        event.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn list_pending(
        &self,
        recorded_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PaymentEvent>> {
        self.check_available()?;
        let mut pending: Vec<PaymentEvent> = self
            .events
            .lock()
            .await
            .values()
            .filter(|e| e.document_status == DocumentStatus::Pending)
            .filter(|e| e.processed_at < recorded_before)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.processed_at);
        pending.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(pending)
    }
}

/// Invoices and receipts keyed by payment event id
#[derive(Default)]
pub struct InMemoryDocumentStore {
    invoices: Mutex<HashMap<Uuid, ServiceInvoice>>,
    receipts: Mutex<HashMap<Uuid, DonationReceipt>>,
    sequence: AtomicI64,
    failures_remaining: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` inserts with a database error
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub async fn invoice_count(&self) -> usize {
        self.invoices.lock().await.len()
    }

    pub async fn receipt_count(&self) -> usize {
        self.receipts.lock().await.len()
    }

    pub async fn invoices(&self) -> Vec<ServiceInvoice> {
        self.invoices.lock().await.values().cloned().collect()
    }

    pub async fn receipts(&self) -> Vec<DonationReceipt> {
        self.receipts.lock().await.values().cloned().collect()
    }

    fn maybe_fail(&self) -> BillingResult<()> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BillingError::Database("document store unavailable".into()));
        }
        Ok(())
    }

    fn next_number(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        document_number(prefix, OffsetDateTime::now_utc().year(), n)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert_invoice(&self, draft: &InvoiceDraft) -> BillingResult<ServiceInvoice> {
        self.maybe_fail()?;
        let mut invoices = self.invoices.lock().await;
        let number = self.next_number(INVOICE_PREFIX);
        let invoice = invoices
            .entry(draft.payment_event_id)
            .or_insert_with(|| ServiceInvoice {
                id: Uuid::new_v4(),
                payment_event_id: draft.payment_event_id,
                invoice_number: number,
                user_id: draft.payer.user_id.clone(),
                payer_name: draft.payer.name.clone(),
                payer_email: draft.payer.email.clone(),
                plan_tier: draft.plan.tier.clone(),
                plan_name: draft.plan.name.clone(),
                plan_duration_days: draft.plan.duration_days,
                amount: draft.amount.minor,
                currency: draft.amount.currency.clone(),
                issued_at: OffsetDateTime::now_utc(),
            });
        Ok(invoice.clone())
    }

    async fn insert_receipt(&self, draft: &ReceiptDraft) -> BillingResult<DonationReceipt> {
        self.maybe_fail()?;
        let mut receipts = self.receipts.lock().await;
        let number = self.next_number(RECEIPT_PREFIX);
        let receipt = receipts
            .entry(draft.payment_event_id)
            .or_insert_with(|| DonationReceipt {
                id: Uuid::new_v4(),
                payment_event_id: draft.payment_event_id,
                receipt_number: number,
                donor_name: draft.donor.name.clone(),
                donor_email: draft.donor.email.clone(),
                is_anonymous: draft.is_anonymous,
                amount: draft.amount.minor,
                currency: draft.amount.currency.clone(),
                issued_at: OffsetDateTime::now_utc(),
            });
        Ok(receipt.clone())
    }

    async fn find_invoice(&self, payment_event_id: Uuid) -> BillingResult<Option<ServiceInvoice>> {
        Ok(self.invoices.lock().await.get(&payment_event_id).cloned())
    }

    async fn find_receipt(
        &self,
        payment_event_id: Uuid,
    ) -> BillingResult<Option<DonationReceipt>> {
        Ok(self.receipts.lock().await.get(&payment_event_id).cloned())
    }
}

/// Orders keyed by order id
#[derive(Default)]
pub struct InMemoryOrderLedger {
    orders: Mutex<HashMap<String, OrderRecord>>,
}

impl InMemoryOrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an order's expected amount, as an operator correcting it would
    pub async fn correct_amount(&self, order_id: &str, amount: i64) {
        if let Some(order) = self.orders.lock().await.get_mut(order_id) {
            order.amount = amount;
        }
    }
}

#[async_trait]
impl OrderLedger for InMemoryOrderLedger {
    async fn find_order(&self, order_id: &str) -> BillingResult<Option<OrderRecord>> {
        Ok(self.orders.lock().await.get(order_id).cloned())
    }

    async fn record_order(&self, order: &NewOrder) -> BillingResult<()> {
        self.orders
            .lock()
            .await
            .entry(order.order_id.clone())
            .or_insert_with(|| OrderRecord {
                order_id: order.order_id.clone(),
                purpose: order.purpose.as_str().to_string(),
                amount: order.amount,
                currency: order.currency.clone(),
                created_at: OffsetDateTime::now_utc(),
            });
        Ok(())
    }
}

/// Activity entries in append order
#[derive(Default)]
pub struct InMemoryActivitySink {
    entries: Mutex<Vec<ActivityEntry>>,
    unavailable: AtomicBool,
}

impl InMemoryActivitySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl ActivitySink for InMemoryActivitySink {
    async fn write(&self, entry: &ActivityEntry) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Database("activity_log unavailable".into()));
        }
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}

/// Reporter that keeps every capture for assertions
#[derive(Default)]
pub struct RecordingReporter {
    reports: StdMutex<Vec<ErrorReport>>,
    breadcrumbs: StdMutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn breadcrumbs(&self) -> Vec<String> {
        self.breadcrumbs
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }
}

impl ErrorReporter for RecordingReporter {
    fn breadcrumb(&self, message: &str, _ctx: &ReportContext) {
        if let Ok(mut b) = self.breadcrumbs.lock() {
            b.push(message.to_string());
        }
    }

    fn capture(&self, error: &BillingError, ctx: &ReportContext) {
        if let Ok(mut r) = self.reports.lock() {
            r.push(ErrorReport::from_error(error, ctx));
        }
    }
}
