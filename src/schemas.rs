use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

fn default_currency_usd() -> String {
    "USD".to_string()
}
fn default_timezone_utc() -> String {
    "UTC".to_string()
}
fn default_viewer_role() -> String {
    "viewer".to_string()
}
fn default_false() -> bool {
    false
}
fn default_true() -> bool {
    true
}
fn default_property_status() -> String {
    "active".to_string()
}
fn default_lease_status() -> String {
    "draft".to_string()
}
fn default_cadence_monthly() -> String {
    "monthly".to_string()
}
fn default_billing_day() -> i16 {
    1
}
fn default_method_bank_transfer() -> String {
    "bank_transfer".to_string()
}
fn default_category_other() -> String {
    "other".to_string()
}
fn default_limit_100() -> i64 {
    100
}
fn default_limit_200() -> i64 {
    200
}
fn default_limit_500() -> i64 {
    500
}
fn default_quantity() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Portfolios
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePortfolioInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub legal_name: Option<String>,
    #[serde(default = "default_currency_usd")]
    pub default_currency: String,
    #[serde(default = "default_timezone_utc")]
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdatePortfolioInput {
    pub name: Option<String>,
    pub legal_name: Option<String>,
    pub default_currency: Option<String>,
    pub timezone: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct CreatePortfolioMemberInput {
    pub user_id: String,
    #[serde(default = "default_viewer_role")]
    pub role: String,
    #[serde(default = "default_false")]
    pub is_primary: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdatePortfolioMemberInput {
    pub role: Option<String>,
    pub is_primary: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ListPortfoliosQuery {
    pub portfolio_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PortfolioPath {
    pub portfolio_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PortfolioMemberPath {
    pub portfolio_id: String,
    pub member_user_id: String,
}

// ---------------------------------------------------------------------------
// Properties / units / tenants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePropertyInput {
    pub portfolio_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub code: Option<String>,
    #[serde(default = "default_property_status")]
    pub status: String,
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdatePropertyInput {
    pub name: Option<String>,
    pub code: Option<String>,
    pub status: Option<String>,
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PropertiesQuery {
    pub portfolio_id: String,
    pub status: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PropertyPath {
    pub property_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateUnitInput {
    pub portfolio_id: String,
    pub property_id: String,
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub bedrooms: Option<i16>,
    pub bathrooms: Option<f64>,
    pub floor_area_sqm: Option<f64>,
    pub market_rent: Option<f64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateUnitInput {
    pub code: Option<String>,
    pub name: Option<String>,
    pub bedrooms: Option<i16>,
    pub bathrooms: Option<f64>,
    pub floor_area_sqm: Option<f64>,
    pub market_rent: Option<f64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UnitsQuery {
    pub portfolio_id: String,
    pub property_id: Option<String>,
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UnitPath {
    pub unit_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateTenantInput {
    pub portfolio_id: String,
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(email)]
    pub email: Option<String>,
    pub phone_e164: Option<String>,
    pub document_type: Option<String>,
    pub document_number: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateTenantInput {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone_e164: Option<String>,
    pub document_type: Option<String>,
    pub document_number: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct TenantsQuery {
    pub portfolio_id: String,
    pub search: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct TenantPath {
    pub tenant_id: String,
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateLeaseChargeInline {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub amount: f64,
    #[serde(default = "default_cadence_monthly")]
    pub cadence: String,
    pub starts_on: Option<String>,
    pub ends_on: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateLeaseInput {
    pub portfolio_id: String,
    pub property_id: String,
    pub unit_id: String,
    #[serde(default = "default_lease_status")]
    pub status: String,
    pub starts_on: String,
    pub ends_on: Option<String>,
    pub rent_amount: f64,
    pub deposit_amount: Option<f64>,
    #[serde(default = "default_currency_usd")]
    pub currency: String,
    #[serde(default = "default_billing_day")]
    pub billing_day: i16,
    pub notes: Option<String>,
    #[serde(default)]
    pub tenant_ids: Vec<String>,
    pub primary_tenant_id: Option<String>,
    #[serde(default)]
    pub charges: Vec<CreateLeaseChargeInline>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateLeaseInput {
    pub status: Option<String>,
    pub starts_on: Option<String>,
    pub ends_on: Option<String>,
    pub rent_amount: Option<f64>,
    pub deposit_amount: Option<f64>,
    pub billing_day: Option<i16>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LeasesQuery {
    pub portfolio_id: String,
    pub status: Option<String>,
    pub property_id: Option<String>,
    pub unit_id: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LeasePath {
    pub lease_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LeaseTenantPath {
    pub lease_id: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AttachLeaseTenantInput {
    pub tenant_id: String,
    #[serde(default = "default_false")]
    pub is_primary: bool,
}

// ---------------------------------------------------------------------------
// Lease charges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateLeaseChargeInput {
    pub portfolio_id: String,
    pub lease_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub amount: f64,
    #[serde(default = "default_cadence_monthly")]
    pub cadence: String,
    pub starts_on: Option<String>,
    pub ends_on: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateLeaseChargeInput {
    pub name: Option<String>,
    pub amount: Option<f64>,
    pub cadence: Option<String>,
    pub starts_on: Option<String>,
    pub ends_on: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LeaseChargesQuery {
    pub portfolio_id: String,
    pub lease_id: Option<String>,
    pub cadence: Option<String>,
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_500")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LeaseChargePath {
    pub charge_id: String,
}

// ---------------------------------------------------------------------------
// Invoices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateInvoiceItemInline {
    #[validate(length(min = 1, max = 512))]
    pub description: String,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
    pub unit_amount: f64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateInvoiceInput {
    pub portfolio_id: String,
    pub lease_id: String,
    /// YYYY-MM billing key; also drives the period bounds.
    pub billing_month: String,
    pub due_date: Option<String>,
    pub tax_amount: Option<f64>,
    pub notes: Option<String>,
    #[validate(length(min = 1))]
    pub items: Vec<CreateInvoiceItemInline>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateInvoiceInput {
    pub due_date: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct InvoicesQuery {
    pub portfolio_id: String,
    pub lease_id: Option<String>,
    pub status: Option<String>,
    pub billing_month: Option<String>,
    pub due_from: Option<String>,
    pub due_to: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct InvoicePath {
    pub invoice_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RunInvoiceGenerationInput {
    pub portfolio_id: Option<String>,
    /// YYYY-MM; defaults to the current calendar month.
    pub billing_month: Option<String>,
}

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentApplicationInline {
    pub invoice_id: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePaymentInput {
    pub portfolio_id: String,
    pub lease_id: String,
    pub tenant_id: Option<String>,
    pub amount: f64,
    #[serde(default = "default_currency_usd")]
    pub currency: String,
    #[serde(default = "default_method_bank_transfer")]
    pub method: String,
    pub received_on: Option<String>,
    #[validate(length(max = 255))]
    pub reference: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub applications: Vec<PaymentApplicationInline>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ApplyPaymentInput {
    pub invoice_id: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UnapplyPaymentInput {
    pub invoice_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentsQuery {
    pub portfolio_id: String,
    pub lease_id: Option<String>,
    pub tenant_id: Option<String>,
    pub method: Option<String>,
    pub unapplied_only: Option<bool>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentPath {
    pub payment_id: String,
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateDocumentInput {
    pub portfolio_id: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    #[validate(length(min = 1, max = 512))]
    pub file_name: String,
    #[validate(length(min = 1, max = 2048))]
    pub file_url: String,
    pub file_size_bytes: Option<i64>,
    pub mime_type: Option<String>,
    #[serde(default = "default_category_other")]
    pub category: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct DocumentsQuery {
    pub portfolio_id: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub category: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct DocumentPath {
    pub document_id: String,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct NotificationsQuery {
    pub unread_only: Option<bool>,
    pub portfolio_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct NotificationPath {
    pub notification_id: String,
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateFeedbackInput {
    pub portfolio_id: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub category: String,
    #[validate(length(min = 1, max = 4000))]
    pub message: String,
    #[validate(range(min = 1, max = 5))]
    pub rating: Option<i16>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateFeedbackInput {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct FeedbackQuery {
    pub portfolio_id: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct FeedbackPath {
    pub feedback_id: String,
}

// ---------------------------------------------------------------------------
// Audit logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AuditLogsQuery {
    pub portfolio_id: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_user_id: Option<String>,
    pub action: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AuditLogPath {
    pub audit_log_id: String,
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input};
    use super::{CreateFeedbackInput, CreatePortfolioInput};

    #[test]
    fn clamps_limits() {
        assert_eq!(clamp_limit_in_range(0, 1, 500), 1);
        assert_eq!(clamp_limit_in_range(250, 1, 500), 250);
        assert_eq!(clamp_limit_in_range(9999, 1, 500), 500);
    }

    #[test]
    fn remove_nulls_drops_only_nulls() {
        let mut map = Map::new();
        map.insert("keep".to_string(), json!("x"));
        map.insert("zero".to_string(), json!(0));
        map.insert("drop".to_string(), Value::Null);
        let cleaned = remove_nulls(map);
        assert_eq!(cleaned.len(), 2);
        assert!(cleaned.contains_key("keep"));
        assert!(cleaned.contains_key("zero"));
    }

    #[test]
    fn serializes_input_to_map() {
        let input = CreatePortfolioInput {
            name: "Riverside".to_string(),
            legal_name: None,
            default_currency: "USD".to_string(),
            timezone: "UTC".to_string(),
        };
        let map = serialize_to_map(&input);
        assert_eq!(map.get("name"), Some(&json!("Riverside")));
        assert_eq!(map.get("legal_name"), Some(&Value::Null));
    }

    #[test]
    fn feedback_rating_bounds() {
        let ok = CreateFeedbackInput {
            portfolio_id: None,
            category: "bug".to_string(),
            message: "something broke".to_string(),
            rating: Some(5),
        };
        assert!(validate_input(&ok).is_ok());

        let bad = CreateFeedbackInput {
            rating: Some(9),
            ..ok
        };
        assert!(validate_input(&bad).is_err());
    }
}
