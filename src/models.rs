use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// Always 64-bit store-assigned ids
pub type Id = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "listing_status", rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    Draft,
    Active,
    Sold,
    Expired,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "listing_condition", rename_all = "snake_case")]
pub enum Condition {
    New,
    LikeNew,
    Excellent,
    #[default]
    Good,
    Fair,
    Poor,
}

impl std::str::FromStr for Condition {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Condition::New),
            "like_new" => Ok(Condition::LikeNew),
            "excellent" => Ok(Condition::Excellent),
            "good" => Ok(Condition::Good),
            "fair" => Ok(Condition::Fair),
            "poor" => Ok(Condition::Poor),
            other => Err(format!("unknown condition '{other}'")),
        }
    }
}

/// A point supplied by or returned to clients. Stored flattened on `Listing`
/// so the row maps straight onto the table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Listing {
    pub id: Id,
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub currency: String,
    pub category_id: Id,
    pub condition: Condition,
    pub seller_id: Id,
    pub status: ListingStatus,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub city: String,
    pub state: String,
    pub country: String,
    pub is_active: bool,
    pub is_featured: bool,
    pub is_negotiable: bool,
    pub views_count: i64,
    pub favorites_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Listing {
    /// Location when both coordinates are present.
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint { latitude, longitude }),
            _ => None,
        }
    }

    /// Whether the listing is surfaced by any discovery query.
    pub fn is_discoverable(&self) -> bool {
        self.status == ListingStatus::Active && self.is_active
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewListing {
    pub title: String,
    pub description: String,
    pub price: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub category_id: Id,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub status: ListingStatus,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default = "default_true")]
    pub is_negotiable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateListing {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub currency: Option<String>,
    pub category_id: Option<Id>,
    pub condition: Option<Condition>,
    pub status: Option<ListingStatus>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub is_featured: Option<bool>,
    pub is_negotiable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Category {
    pub id: Id,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub parent_id: Option<Id>,
    pub is_active: bool,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewCategory {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent_id: Option<Id>,
    #[serde(default)]
    pub sort_order: i32,
}

/// One level of the category tree: a root with its direct children.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CategoryNode {
    #[serde(flatten)]
    pub category: Category,
    pub children: Vec<Category>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct ListingFavorite {
    pub id: Id,
    pub user_id: Id,
    pub listing_id: Id,
    pub created_at: DateTime<Utc>,
}

/// A favorite joined with the listing it points at, as returned to clients.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserFavorite {
    pub id: Id,
    pub listing: Listing,
    pub created_at: DateTime<Utc>,
}

/// Append-only view log row. Never updated or deleted; trending and
/// analytics aggregates are computed from it.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct ListingViewRecord {
    pub id: Id,
    pub listing_id: Id,
    pub user_id: Option<Id>,
    pub ip_address: Option<String>,
    pub user_agent: String,
    pub viewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewListingView {
    pub user_id: Option<Id>,
    pub ip_address: Option<String>,
    pub user_agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "report_type", rename_all = "snake_case")]
pub enum ReportType {
    Inappropriate,
    Spam,
    Fake,
    Scam,
    Duplicate,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "report_status", rename_all = "snake_case")]
pub enum ReportStatus {
    #[default]
    Pending,
    Reviewed,
    Resolved,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct ListingReport {
    pub id: Id,
    pub listing_id: Id,
    pub reporter_id: Id,
    pub report_type: ReportType,
    pub description: String,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewListingReport {
    pub report_type: ReportType,
    pub description: String,
}

/// Paginated search/list response body.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ListingPage {
    pub results: Vec<Listing>,
    pub total_count: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FavoriteToggle {
    pub is_favorited: bool,
    pub favorites_count: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ListingStats {
    pub total_views: i64,
    pub total_favorites: i64,
    pub avg_price_in_category: Decimal,
    pub similar_listings_count: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DailyViews {
    pub day: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IpViews {
    pub ip_address: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserAgentViews {
    pub user_agent: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ListingAnalytics {
    pub daily_views: Vec<DailyViews>,
    pub top_ips: Vec<IpViews>,
    pub top_user_agents: Vec<UserAgentViews>,
    pub total_views_period: u64,
    pub unique_visitors: u64,
}
