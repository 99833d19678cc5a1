//! Discovery query core: the typed filter set, parameter parsing with
//! field-level validation, geo math, the ranking comparator and pagination.
//!
//! Everything here is pure. The in-memory repository applies these functions
//! directly; the Postgres repository mirrors them as SQL.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use crate::error::FieldError;
use crate::models::{Condition, GeoPoint, Id, Listing};

pub const DEFAULT_RADIUS_KM: f64 = 50.0;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_TRENDING_DAYS: i64 = 7;
pub const DEFAULT_TRENDING_LIMIT: usize = 10;
pub const DEFAULT_ANALYTICS_DAYS: i64 = 30;

/// Kilometres per native distance unit (planar degrees). An approximation,
/// not geodesic; kept as the literal divisor the service has always used.
pub const KM_PER_NATIVE_UNIT: f64 = 100.0;

/// Fraction of the source price defining the "similar" price band.
pub fn similar_price_band(price: Decimal) -> (Decimal, Decimal) {
    let band = price * Decimal::new(3, 1); // 30%
    (price - band, price + band)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFilter {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
}

impl GeoFilter {
    /// Radius in the store's native unit (planar degrees).
    pub fn radius_native(&self) -> f64 {
        self.radius_km / KM_PER_NATIVE_UNIT
    }

    /// Planar distance in native units between the reference point and `p`.
    pub fn distance_to(&self, p: GeoPoint) -> f64 {
        let dlat = p.latitude - self.latitude;
        let dlon = p.longitude - self.longitude;
        (dlat * dlat + dlon * dlon).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Price,
    CreatedAt,
    ViewsCount,
    FavoritesCount,
}

impl SortField {
    /// Column name used by the SQL backend. Whitelisted by construction.
    pub fn column(self) -> &'static str {
        match self {
            SortField::Price => "price",
            SortField::CreatedAt => "created_at",
            SortField::ViewsCount => "views_count",
            SortField::FavoritesCount => "favorites_count",
        }
    }
}

impl FromStr for SortField {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "price" => Ok(SortField::Price),
            "created_at" => Ok(SortField::CreatedAt),
            "views_count" => Ok(SortField::ViewsCount),
            "favorites_count" => Ok(SortField::FavoritesCount),
            other => Err(format!("unknown sort field '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    Asc,
    Desc,
}

impl FromStr for SortDir {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortDir::Asc),
            "desc" => Ok(SortDir::Desc),
            other => Err(format!("unknown sort direction '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub dir: SortDir,
}

impl Default for SortKey {
    fn default() -> Self {
        SortKey { field: SortField::CreatedAt, dir: SortDir::Desc }
    }
}

/// Every filter the discovery surface recognizes. All optional, all
/// conjunctive; an absent field imposes no constraint.
#[derive(Debug, Clone, Default)]
pub struct ListingFilters {
    pub query: Option<String>,
    pub category_id: Option<Id>,
    pub category_slug: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub condition: Option<Condition>,
    pub seller_id: Option<Id>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub is_featured: Option<bool>,
    pub is_negotiable: Option<bool>,
    pub geo: Option<GeoFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Page { page: 1, page_size: DEFAULT_PAGE_SIZE }
    }
}

impl Page {
    /// Zero-based slice bounds: start=(page-1)*page_size, end=start+page_size.
    pub fn bounds(&self) -> (usize, usize) {
        let start = (self.page as usize - 1) * self.page_size as usize;
        (start, start + self.page_size as usize)
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        (total + self.page_size as u64 - 1) / self.page_size as u64
    }

    /// Slice a fully ranked result set. Out-of-range pages yield an empty
    /// slice, not an error.
    pub fn slice<T>(&self, items: &[T]) -> Vec<T>
    where
        T: Clone,
    {
        let (start, end) = self.bounds();
        if start >= items.len() {
            return Vec::new();
        }
        items[start..end.min(items.len())].to_vec()
    }
}

/// A complete discovery request: filters, an optional explicit sort, a page.
///
/// `sort` stays optional because geo ranking treats an *explicitly* supplied
/// sort as its tie-breaker and otherwise falls back to created_at desc.
#[derive(Debug, Clone, Default)]
pub struct ListingQuery {
    pub filters: ListingFilters,
    pub sort: Option<SortKey>,
    pub page: Page,
}

impl ListingQuery {
    pub fn effective_sort(&self) -> SortKey {
        self.sort.unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Predicate evaluation (in-memory backend)
// ---------------------------------------------------------------------------

fn icontains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// True when `listing` passes every filter. The active-listing base set is
/// part of the contract: non-discoverable listings never match.
///
/// `category_slug` must be resolved to `category_id` by the caller before
/// evaluation (the slug lives in another table).
pub fn matches(listing: &Listing, f: &ListingFilters) -> bool {
    if !listing.is_discoverable() {
        return false;
    }
    if let Some(q) = &f.query {
        let hit = icontains(&listing.title, q)
            || icontains(&listing.description, q)
            || icontains(&listing.city, q)
            || icontains(&listing.state, q)
            || icontains(&listing.country, q);
        if !hit {
            return false;
        }
    }
    if let Some(cat) = f.category_id {
        if listing.category_id != cat {
            return false;
        }
    }
    if let Some(min) = f.min_price {
        if listing.price < min {
            return false;
        }
    }
    if let Some(max) = f.max_price {
        if listing.price > max {
            return false;
        }
    }
    if let Some(cond) = f.condition {
        if listing.condition != cond {
            return false;
        }
    }
    if let Some(seller) = f.seller_id {
        if listing.seller_id != seller {
            return false;
        }
    }
    if let Some(city) = &f.city {
        if !icontains(&listing.city, city) {
            return false;
        }
    }
    if let Some(state) = &f.state {
        if !icontains(&listing.state, state) {
            return false;
        }
    }
    if let Some(country) = &f.country {
        if !icontains(&listing.country, country) {
            return false;
        }
    }
    if let Some(after) = f.created_after {
        if listing.created_at < after {
            return false;
        }
    }
    if let Some(before) = f.created_before {
        if listing.created_at > before {
            return false;
        }
    }
    if let Some(featured) = f.is_featured {
        if listing.is_featured != featured {
            return false;
        }
    }
    if let Some(negotiable) = f.is_negotiable {
        if listing.is_negotiable != negotiable {
            return false;
        }
    }
    if let Some(geo) = &f.geo {
        match listing.location() {
            Some(p) => {
                if geo.distance_to(p) > geo.radius_native() {
                    return false;
                }
            }
            None => return false,
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

fn compare_field(a: &Listing, b: &Listing, key: SortKey) -> Ordering {
    let ord = match key.field {
        SortField::Price => a.price.cmp(&b.price),
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::ViewsCount => a.views_count.cmp(&b.views_count),
        SortField::FavoritesCount => a.favorites_count.cmp(&b.favorites_count),
    };
    match key.dir {
        SortDir::Asc => ord,
        SortDir::Desc => ord.reverse(),
    }
}

/// Total order over the filtered set. Distance ascending when a geo filter is
/// present (explicit sort, else created_at desc, as the tie-break); otherwise
/// the explicit/default sort. Final tie on id ascending so pagination is
/// reproducible.
pub fn compare(a: &Listing, b: &Listing, q: &ListingQuery) -> Ordering {
    if let Some(geo) = &q.filters.geo {
        if let (Some(pa), Some(pb)) = (a.location(), b.location()) {
            let ord = geo
                .distance_to(pa)
                .partial_cmp(&geo.distance_to(pb))
                .unwrap_or(Ordering::Equal);
            if ord != Ordering::Equal {
                return ord;
            }
        }
    }
    let ord = compare_field(a, b, q.effective_sort());
    if ord != Ordering::Equal {
        return ord;
    }
    a.id.cmp(&b.id)
}

// ---------------------------------------------------------------------------
// Parameter parsing
// ---------------------------------------------------------------------------

/// Parse one optional field, recording a field-level error on failure instead
/// of silently defaulting.
pub fn parse_opt<T>(field: &str, raw: &Option<String>, errs: &mut Vec<FieldError>) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = raw.as_deref()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            errs.push(FieldError::new(field, format!("invalid value '{raw}': {e}")));
            None
        }
    }
}

fn parse_bool(field: &str, raw: &Option<String>, errs: &mut Vec<FieldError>) -> Option<bool> {
    let raw = raw.as_deref()?;
    match raw {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        other => {
            errs.push(FieldError::new(field, format!("invalid boolean '{other}'")));
            None
        }
    }
}

fn parse_datetime(
    field: &str,
    raw: &Option<String>,
    errs: &mut Vec<FieldError>,
) -> Option<DateTime<Utc>> {
    let raw = raw.as_deref()?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            errs.push(FieldError::new(field, format!("invalid timestamp '{raw}': {e}")));
            None
        }
    }
}

fn build_geo(
    latitude: Option<f64>,
    longitude: Option<f64>,
    radius: Option<f64>,
    errs: &mut Vec<FieldError>,
) -> Option<GeoFilter> {
    match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => {
            let radius_km = radius.unwrap_or(DEFAULT_RADIUS_KM);
            if radius_km <= 0.0 {
                errs.push(FieldError::new("radius", "must be greater than zero"));
                return None;
            }
            Some(GeoFilter { latitude, longitude, radius_km })
        }
        (Some(_), None) => {
            errs.push(FieldError::new("longitude", "required when latitude is supplied"));
            None
        }
        (None, Some(_)) => {
            errs.push(FieldError::new("latitude", "required when longitude is supplied"));
            None
        }
        (None, None) => {
            if radius.is_some() {
                errs.push(FieldError::new("radius", "requires latitude and longitude"));
            }
            None
        }
    }
}

fn build_page(page: Option<u32>, page_size: Option<u32>, errs: &mut Vec<FieldError>) -> Page {
    let mut out = Page::default();
    if let Some(p) = page {
        if p < 1 {
            errs.push(FieldError::new("page", "must be at least 1"));
        } else {
            out.page = p;
        }
    }
    if let Some(ps) = page_size {
        if ps < 1 {
            errs.push(FieldError::new("page_size", "must be at least 1"));
        } else {
            out.page_size = ps;
        }
    }
    out
}

fn build_sort(
    field: Option<SortField>,
    dir: Option<SortDir>,
) -> Option<SortKey> {
    match (field, dir) {
        (None, None) => None,
        (f, d) => Some(SortKey {
            field: f.unwrap_or(SortField::CreatedAt),
            dir: d.unwrap_or(SortDir::Desc),
        }),
    }
}

/// Raw GET query parameters for `/listings`. Everything arrives as a string
/// and is parsed field by field so a 400 can name the offending parameter.
#[derive(Debug, Clone, Default, Deserialize, ToSchema, IntoParams)]
pub struct ListingQueryParams {
    pub search: Option<String>,
    pub category: Option<String>,
    pub category_slug: Option<String>,
    pub min_price: Option<String>,
    pub max_price: Option<String>,
    pub condition: Option<String>,
    pub seller: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub is_featured: Option<String>,
    pub is_negotiable: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub radius: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub page: Option<String>,
    pub page_size: Option<String>,
}

impl ListingQueryParams {
    pub fn into_query(self) -> Result<ListingQuery, Vec<FieldError>> {
        let mut errs = Vec::new();

        let latitude = parse_opt::<f64>("latitude", &self.latitude, &mut errs);
        let longitude = parse_opt::<f64>("longitude", &self.longitude, &mut errs);
        let radius = parse_opt::<f64>("radius", &self.radius, &mut errs);

        let filters = ListingFilters {
            query: self.search,
            category_id: parse_opt("category", &self.category, &mut errs),
            category_slug: self.category_slug,
            min_price: parse_opt("min_price", &self.min_price, &mut errs),
            max_price: parse_opt("max_price", &self.max_price, &mut errs),
            condition: parse_opt("condition", &self.condition, &mut errs),
            seller_id: parse_opt("seller", &self.seller, &mut errs),
            city: self.city,
            state: self.state,
            country: self.country,
            created_after: parse_datetime("created_after", &self.created_after, &mut errs),
            created_before: parse_datetime("created_before", &self.created_before, &mut errs),
            is_featured: parse_bool("is_featured", &self.is_featured, &mut errs),
            is_negotiable: parse_bool("is_negotiable", &self.is_negotiable, &mut errs),
            geo: build_geo(latitude, longitude, radius, &mut errs),
        };

        let sort = build_sort(
            parse_opt("sort_by", &self.sort_by, &mut errs),
            parse_opt("sort_order", &self.sort_order, &mut errs),
        );
        let page = build_page(
            parse_opt("page", &self.page, &mut errs),
            parse_opt("page_size", &self.page_size, &mut errs),
            &mut errs,
        );

        if errs.is_empty() {
            Ok(ListingQuery { filters, sort, page })
        } else {
            Err(errs)
        }
    }
}

/// JSON body for `POST /listings/search`. Types are enforced by serde; range
/// and pairing rules are checked here.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub category: Option<Id>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub condition: Option<Condition>,
    pub seller: Option<Id>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius: Option<f64>,
    pub sort_by: Option<SortField>,
    pub sort_order: Option<SortDir>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl SearchRequest {
    pub fn into_query(self) -> Result<ListingQuery, Vec<FieldError>> {
        let mut errs = Vec::new();
        let filters = ListingFilters {
            query: self.query,
            category_id: self.category,
            category_slug: None,
            min_price: self.min_price,
            max_price: self.max_price,
            condition: self.condition,
            seller_id: self.seller,
            city: self.city,
            state: self.state,
            country: self.country,
            created_after: None,
            created_before: None,
            is_featured: None,
            is_negotiable: None,
            geo: build_geo(self.latitude, self.longitude, self.radius, &mut errs),
        };
        let sort = build_sort(self.sort_by, self.sort_order);
        let page = build_page(self.page, self.page_size, &mut errs);
        if errs.is_empty() {
            Ok(ListingQuery { filters, sort, page })
        } else {
            Err(errs)
        }
    }
}
