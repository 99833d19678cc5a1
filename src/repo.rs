use async_trait::async_trait;

use crate::models::*;
use crate::query::ListingQuery;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait ListingRepo: Send + Sync {
    async fn create_listing(&self, seller_id: Id, new: NewListing) -> RepoResult<Listing>;
    async fn get_listing(&self, id: Id) -> RepoResult<Listing>;
    async fn update_listing(&self, id: Id, upd: UpdateListing) -> RepoResult<Listing>;
    /// Soft delete: is_active=false, status=suspended.
    async fn deactivate_listing(&self, id: Id) -> RepoResult<()>;
    /// Filtered, ranked, paginated page plus the unpaginated total.
    async fn search_listings(&self, query: &ListingQuery) -> RepoResult<(Vec<Listing>, u64)>;
    async fn listings_by_seller(
        &self,
        seller_id: Id,
        only_active: bool,
        exclude: Option<Id>,
        limit: Option<usize>,
    ) -> RepoResult<Vec<Listing>>;
    async fn trending_listings(&self, days: i64, limit: usize) -> RepoResult<Vec<Listing>>;
    async fn featured_listings(&self, limit: usize) -> RepoResult<Vec<Listing>>;
    async fn similar_listings(&self, source: &Listing, limit: usize) -> RepoResult<Vec<Listing>>;
    /// Personalized picks; substitutes the trending set wholesale when the
    /// personalized query cannot fill `limit` rows.
    async fn recommended_listings(&self, user_id: Option<Id>, limit: usize) -> RepoResult<Vec<Listing>>;
    /// Appends a view-log row and bumps views_count atomically; returns the
    /// listing after the increment.
    async fn record_view(&self, listing_id: Id, view: NewListingView) -> RepoResult<Listing>;
    async fn listing_stats(&self, source: &Listing) -> RepoResult<ListingStats>;
    async fn listing_analytics(&self, listing_id: Id, days: i64) -> RepoResult<ListingAnalytics>;
}

#[async_trait]
pub trait FavoriteRepo: Send + Sync {
    async fn toggle_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<FavoriteToggle>;
    async fn favorites_for_user(&self, user_id: Id) -> RepoResult<Vec<UserFavorite>>;
}

#[async_trait]
pub trait CategoryRepo: Send + Sync {
    async fn list_categories(&self) -> RepoResult<Vec<Category>>;
    async fn category_tree(&self) -> RepoResult<Vec<CategoryNode>>;
    async fn get_category_by_slug(&self, slug: &str) -> RepoResult<Category>;
    async fn category_children(&self, slug: &str) -> RepoResult<Vec<Category>>;
    async fn create_category(&self, new: NewCategory) -> RepoResult<Category>;
}

#[async_trait]
pub trait ReportRepo: Send + Sync {
    async fn create_report(
        &self,
        listing_id: Id,
        reporter_id: Id,
        new: NewListingReport,
    ) -> RepoResult<ListingReport>;
}

pub trait Repo: ListingRepo + FavoriteRepo + CategoryRepo + ReportRepo {}

impl<T> Repo for T where T: ListingRepo + FavoriteRepo + CategoryRepo + ReportRepo {}

/// Expiry invariant: the moment a listing becomes active with no expiry set,
/// it expires 30 days out.
fn apply_expiry(listing: &mut Listing) {
    if listing.status == ListingStatus::Active && listing.expires_at.is_none() {
        listing.expires_at = Some(listing.updated_at + chrono::Duration::days(30));
    }
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use crate::query::{self, similar_price_band, ListingFilters};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        listings: HashMap<Id, Listing>,
        categories: HashMap<Id, Category>,
        favorites: HashMap<Id, ListingFavorite>,
        views: Vec<ListingViewRecord>, // append-only
        reports: HashMap<Id, ListingReport>,
        next_id: Id,
    }

    impl State {
        fn next_id(&mut self) -> Id {
            self.next_id += 1;
            self.next_id
        }

        fn live_favorites_count(&self, listing_id: Id) -> i64 {
            self.favorites.values().filter(|f| f.listing_id == listing_id).count() as i64
        }
    }

    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn snapshot_path() -> PathBuf {
            match std::env::var("BAZAAR_DATA_DIR") {
                Ok(dir) => {
                    let mut p = PathBuf::from(dir);
                    p.push("state.json");
                    p
                }
                Err(_) => PathBuf::from(SNAPSHOT_PATH),
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        tracing::info!("loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        tracing::warn!("failed to parse snapshot '{}': {e}; starting empty", path.display());
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    tracing::error!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        /// Slug filters live in the category table, so resolve them to an id
        /// before predicate evaluation. `None` means the filter can never
        /// match (unknown slug, or slug and id point at different rows).
        fn resolve_filters(s: &State, filters: &ListingFilters) -> Option<ListingFilters> {
            let mut f = filters.clone();
            if let Some(slug) = f.category_slug.take() {
                let cat = s.categories.values().find(|c| c.slug == slug && c.is_active)?;
                match f.category_id {
                    Some(id) if id != cat.id => return None,
                    _ => f.category_id = Some(cat.id),
                }
            }
            Some(f)
        }

        fn newest_first(v: &mut [Listing]) {
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ListingRepo for InMemRepo {
        async fn create_listing(&self, seller_id: Id, new: NewListing) -> RepoResult<Listing> {
            let mut s = self.state.write().unwrap();
            if !s.categories.contains_key(&new.category_id) {
                return Err(RepoError::NotFound);
            }
            let now = Utc::now();
            let id = s.next_id();
            let mut listing = Listing {
                id,
                title: new.title,
                description: new.description,
                price: new.price,
                currency: new.currency,
                category_id: new.category_id,
                condition: new.condition,
                seller_id,
                status: new.status,
                latitude: new.latitude,
                longitude: new.longitude,
                city: new.city,
                state: new.state,
                country: new.country,
                is_active: true,
                is_featured: new.is_featured,
                is_negotiable: new.is_negotiable,
                views_count: 0,
                favorites_count: 0,
                created_at: now,
                updated_at: now,
                expires_at: None,
            };
            apply_expiry(&mut listing);
            s.listings.insert(id, listing.clone());
            drop(s);
            self.persist();
            Ok(listing)
        }

        async fn get_listing(&self, id: Id) -> RepoResult<Listing> {
            let s = self.state.read().unwrap();
            s.listings.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn update_listing(&self, id: Id, upd: UpdateListing) -> RepoResult<Listing> {
            let mut s = self.state.write().unwrap();
            if let Some(cat) = upd.category_id {
                if !s.categories.contains_key(&cat) {
                    return Err(RepoError::NotFound);
                }
            }
            let listing = s.listings.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(title) = upd.title { listing.title = title; }
            if let Some(description) = upd.description { listing.description = description; }
            if let Some(price) = upd.price { listing.price = price; }
            if let Some(currency) = upd.currency { listing.currency = currency; }
            if let Some(category_id) = upd.category_id { listing.category_id = category_id; }
            if let Some(condition) = upd.condition { listing.condition = condition; }
            if let Some(status) = upd.status { listing.status = status; }
            if let Some(latitude) = upd.latitude { listing.latitude = Some(latitude); }
            if let Some(longitude) = upd.longitude { listing.longitude = Some(longitude); }
            if let Some(city) = upd.city { listing.city = city; }
            if let Some(state) = upd.state { listing.state = state; }
            if let Some(country) = upd.country { listing.country = country; }
            if let Some(is_featured) = upd.is_featured { listing.is_featured = is_featured; }
            if let Some(is_negotiable) = upd.is_negotiable { listing.is_negotiable = is_negotiable; }
            listing.updated_at = Utc::now();
            apply_expiry(listing);
            let updated = listing.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn deactivate_listing(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let listing = s.listings.get_mut(&id).ok_or(RepoError::NotFound)?;
            listing.is_active = false;
            listing.status = ListingStatus::Suspended;
            listing.updated_at = Utc::now();
            drop(s);
            self.persist();
            Ok(())
        }

        async fn search_listings(&self, q: &ListingQuery) -> RepoResult<(Vec<Listing>, u64)> {
            let s = self.state.read().unwrap();
            let filters = match Self::resolve_filters(&s, &q.filters) {
                Some(f) => f,
                None => return Ok((Vec::new(), 0)),
            };
            let mut hits: Vec<Listing> = s
                .listings
                .values()
                .filter(|l| query::matches(l, &filters))
                .cloned()
                .collect();
            hits.sort_by(|a, b| query::compare(a, b, q));
            let total = hits.len() as u64;
            Ok((q.page.slice(&hits), total))
        }

        async fn listings_by_seller(
            &self,
            seller_id: Id,
            only_active: bool,
            exclude: Option<Id>,
            limit: Option<usize>,
        ) -> RepoResult<Vec<Listing>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<Listing> = s
                .listings
                .values()
                .filter(|l| l.seller_id == seller_id)
                .filter(|l| !only_active || l.is_discoverable())
                .filter(|l| Some(l.id) != exclude)
                .cloned()
                .collect();
            Self::newest_first(&mut v);
            if let Some(limit) = limit {
                v.truncate(limit);
            }
            Ok(v)
        }

        async fn trending_listings(&self, days: i64, limit: usize) -> RepoResult<Vec<Listing>> {
            let cutoff = Utc::now() - chrono::Duration::days(days);
            let s = self.state.read().unwrap();
            let mut scored: Vec<(Listing, i64, i64)> = s
                .listings
                .values()
                .filter(|l| l.is_discoverable() && l.created_at >= cutoff)
                .map(|l| {
                    let recent_views = s
                        .views
                        .iter()
                        .filter(|v| v.listing_id == l.id && v.viewed_at >= cutoff)
                        .count() as i64;
                    let recent_favorites = s
                        .favorites
                        .values()
                        .filter(|f| f.listing_id == l.id && f.created_at >= cutoff)
                        .count() as i64;
                    (l.clone(), recent_views, recent_favorites)
                })
                .collect();
            scored.sort_by(|a, b| {
                b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.id.cmp(&b.0.id))
            });
            scored.truncate(limit);
            Ok(scored.into_iter().map(|(l, _, _)| l).collect())
        }

        async fn featured_listings(&self, limit: usize) -> RepoResult<Vec<Listing>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<Listing> = s
                .listings
                .values()
                .filter(|l| l.is_discoverable() && l.is_featured)
                .cloned()
                .collect();
            Self::newest_first(&mut v);
            v.truncate(limit);
            Ok(v)
        }

        async fn similar_listings(&self, source: &Listing, limit: usize) -> RepoResult<Vec<Listing>> {
            let (lo, hi) = similar_price_band(source.price);
            let s = self.state.read().unwrap();
            let mut v: Vec<Listing> = s
                .listings
                .values()
                .filter(|l| {
                    l.is_discoverable()
                        && l.id != source.id
                        && l.category_id == source.category_id
                        && l.price >= lo
                        && l.price <= hi
                })
                .cloned()
                .collect();
            Self::newest_first(&mut v);
            v.truncate(limit);
            Ok(v)
        }

        async fn recommended_listings(
            &self,
            user_id: Option<Id>,
            limit: usize,
        ) -> RepoResult<Vec<Listing>> {
            let Some(user_id) = user_id else {
                return self.trending_listings(query::DEFAULT_TRENDING_DAYS, limit).await;
            };

            let picks = {
                let s = self.state.read().unwrap();
                let mut favorited: HashSet<Id> = HashSet::new();
                let mut per_category: HashMap<Id, i64> = HashMap::new();
                for fav in s.favorites.values().filter(|f| f.user_id == user_id) {
                    favorited.insert(fav.listing_id);
                    if let Some(listing) = s.listings.get(&fav.listing_id) {
                        *per_category.entry(listing.category_id).or_default() += 1;
                    }
                }
                if per_category.is_empty() {
                    None
                } else {
                    let mut top: Vec<(Id, i64)> = per_category.into_iter().collect();
                    top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                    let categories: HashSet<Id> = top.iter().take(3).map(|(id, _)| *id).collect();

                    let mut v: Vec<Listing> = s
                        .listings
                        .values()
                        .filter(|l| {
                            l.is_discoverable()
                                && categories.contains(&l.category_id)
                                && !favorited.contains(&l.id)
                        })
                        .cloned()
                        .collect();
                    Self::newest_first(&mut v);
                    v.truncate(limit);
                    Some(v)
                }
            };

            // Full substitution, never a partial backfill.
            match picks {
                Some(v) if v.len() >= limit => Ok(v),
                _ => self.trending_listings(query::DEFAULT_TRENDING_DAYS, limit).await,
            }
        }

        async fn record_view(&self, listing_id: Id, view: NewListingView) -> RepoResult<Listing> {
            let mut s = self.state.write().unwrap();
            let listing = s.listings.get_mut(&listing_id).ok_or(RepoError::NotFound)?;
            listing.views_count += 1;
            let updated = listing.clone();
            let id = s.next_id();
            s.views.push(ListingViewRecord {
                id,
                listing_id,
                user_id: view.user_id,
                ip_address: view.ip_address,
                user_agent: view.user_agent,
                viewed_at: Utc::now(),
            });
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn listing_stats(&self, source: &Listing) -> RepoResult<ListingStats> {
            use rust_decimal::Decimal;
            let s = self.state.read().unwrap();
            let in_category: Vec<&Listing> = s
                .listings
                .values()
                .filter(|l| l.is_discoverable() && l.category_id == source.category_id)
                .collect();
            let avg_price_in_category = if in_category.is_empty() {
                Decimal::ZERO
            } else {
                let sum: Decimal = in_category.iter().map(|l| l.price).sum();
                sum / Decimal::from(in_category.len() as i64)
            };
            let (lo, hi) = similar_price_band(source.price);
            let similar_listings_count = in_category
                .iter()
                .filter(|l| l.id != source.id && l.price >= lo && l.price <= hi)
                .count() as u64;
            Ok(ListingStats {
                total_views: source.views_count,
                total_favorites: source.favorites_count,
                avg_price_in_category,
                similar_listings_count,
            })
        }

        async fn listing_analytics(&self, listing_id: Id, days: i64) -> RepoResult<ListingAnalytics> {
            let cutoff = Utc::now() - chrono::Duration::days(days);
            let s = self.state.read().unwrap();
            if !s.listings.contains_key(&listing_id) {
                return Err(RepoError::NotFound);
            }
            let window: Vec<&ListingViewRecord> = s
                .views
                .iter()
                .filter(|v| v.listing_id == listing_id && v.viewed_at >= cutoff)
                .collect();

            let mut per_day: BTreeMap<chrono::NaiveDate, i64> = BTreeMap::new();
            let mut per_ip: HashMap<String, i64> = HashMap::new();
            let mut per_agent: HashMap<String, i64> = HashMap::new();
            for v in &window {
                *per_day.entry(v.viewed_at.date_naive()).or_default() += 1;
                if let Some(ip) = &v.ip_address {
                    *per_ip.entry(ip.clone()).or_default() += 1;
                }
                *per_agent.entry(v.user_agent.clone()).or_default() += 1;
            }

            fn top_n(counts: HashMap<String, i64>, n: usize) -> Vec<(String, i64)> {
                let mut v: Vec<(String, i64)> = counts.into_iter().collect();
                v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                v.truncate(n);
                v
            }

            let unique_visitors = per_ip.len() as u64;
            Ok(ListingAnalytics {
                daily_views: per_day
                    .into_iter()
                    .map(|(day, count)| DailyViews { day, count })
                    .collect(),
                top_ips: top_n(per_ip, 10)
                    .into_iter()
                    .map(|(ip_address, count)| IpViews { ip_address, count })
                    .collect(),
                top_user_agents: top_n(per_agent, 5)
                    .into_iter()
                    .map(|(user_agent, count)| UserAgentViews { user_agent, count })
                    .collect(),
                total_views_period: window.len() as u64,
                unique_visitors,
            })
        }
    }

    #[async_trait]
    impl FavoriteRepo for InMemRepo {
        async fn toggle_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<FavoriteToggle> {
            let mut s = self.state.write().unwrap();
            let discoverable = s
                .listings
                .get(&listing_id)
                .map(|l| l.is_discoverable())
                .unwrap_or(false);
            if !discoverable {
                return Err(RepoError::NotFound);
            }

            let existing = s
                .favorites
                .iter()
                .find(|(_, f)| f.user_id == user_id && f.listing_id == listing_id)
                .map(|(id, _)| *id);
            let is_favorited = match existing {
                Some(fav_id) => {
                    s.favorites.remove(&fav_id);
                    false
                }
                None => {
                    let id = s.next_id();
                    s.favorites.insert(
                        id,
                        ListingFavorite { id, user_id, listing_id, created_at: Utc::now() },
                    );
                    true
                }
            };

            // counter stays equal to the live favorite count
            let favorites_count = s.live_favorites_count(listing_id);
            if let Some(listing) = s.listings.get_mut(&listing_id) {
                listing.favorites_count = favorites_count;
            }
            drop(s);
            self.persist();
            Ok(FavoriteToggle { is_favorited, favorites_count })
        }

        async fn favorites_for_user(&self, user_id: Id) -> RepoResult<Vec<UserFavorite>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<UserFavorite> = s
                .favorites
                .values()
                .filter(|f| f.user_id == user_id)
                .filter_map(|f| {
                    s.listings.get(&f.listing_id).map(|l| UserFavorite {
                        id: f.id,
                        listing: l.clone(),
                        created_at: f.created_at,
                    })
                })
                .collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            Ok(v)
        }
    }

    #[async_trait]
    impl CategoryRepo for InMemRepo {
        async fn list_categories(&self) -> RepoResult<Vec<Category>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<Category> = s.categories.values().filter(|c| c.is_active).cloned().collect();
            v.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.name.cmp(&b.name)));
            Ok(v)
        }

        async fn category_tree(&self) -> RepoResult<Vec<CategoryNode>> {
            let all = self.list_categories().await?;
            let roots = all.iter().filter(|c| c.parent_id.is_none());
            Ok(roots
                .map(|root| CategoryNode {
                    category: root.clone(),
                    children: all
                        .iter()
                        .filter(|c| c.parent_id == Some(root.id))
                        .cloned()
                        .collect(),
                })
                .collect())
        }

        async fn get_category_by_slug(&self, slug: &str) -> RepoResult<Category> {
            let s = self.state.read().unwrap();
            s.categories
                .values()
                .find(|c| c.slug == slug && c.is_active)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn category_children(&self, slug: &str) -> RepoResult<Vec<Category>> {
            let parent = self.get_category_by_slug(slug).await?;
            let s = self.state.read().unwrap();
            let mut v: Vec<Category> = s
                .categories
                .values()
                .filter(|c| c.is_active && c.parent_id == Some(parent.id))
                .cloned()
                .collect();
            v.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.name.cmp(&b.name)));
            Ok(v)
        }

        async fn create_category(&self, new: NewCategory) -> RepoResult<Category> {
            let mut s = self.state.write().unwrap();
            if s.categories.values().any(|c| c.slug == new.slug || c.name == new.name) {
                return Err(RepoError::Conflict);
            }
            if let Some(parent) = new.parent_id {
                if !s.categories.contains_key(&parent) {
                    return Err(RepoError::NotFound);
                }
            }
            let id = s.next_id();
            let category = Category {
                id,
                name: new.name,
                slug: new.slug,
                description: new.description,
                parent_id: new.parent_id,
                is_active: true,
                sort_order: new.sort_order,
                created_at: Utc::now(),
            };
            s.categories.insert(id, category.clone());
            drop(s);
            self.persist();
            Ok(category)
        }
    }

    #[async_trait]
    impl ReportRepo for InMemRepo {
        async fn create_report(
            &self,
            listing_id: Id,
            reporter_id: Id,
            new: NewListingReport,
        ) -> RepoResult<ListingReport> {
            let mut s = self.state.write().unwrap();
            if !s.listings.contains_key(&listing_id) {
                return Err(RepoError::NotFound);
            }
            let id = s.next_id();
            let report = ListingReport {
                id,
                listing_id,
                reporter_id,
                report_type: new.report_type,
                description: new.description,
                status: ReportStatus::Pending,
                created_at: Utc::now(),
            };
            s.reports.insert(id, report.clone());
            drop(s);
            self.persist();
            Ok(report)
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use crate::query::{self, similar_price_band, GeoFilter, ListingFilters, SortDir, SortKey};
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;
    use sqlx::{FromRow, Pool, Postgres, QueryBuilder, Row};

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }
    }

    fn db_err(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => RepoError::Conflict,
            other => RepoError::Internal(other.to_string()),
        }
    }

    /// Planar distance expression mirroring `GeoFilter::distance_to`.
    fn push_distance(qb: &mut QueryBuilder<Postgres>, geo: &GeoFilter) {
        qb.push("sqrt(power(l.latitude - ")
            .push_bind(geo.latitude)
            .push(", 2) + power(l.longitude - ")
            .push_bind(geo.longitude)
            .push(", 2))");
    }

    /// WHERE clause for the active-listing base set plus every supplied
    /// filter; the SQL twin of `query::matches`.
    fn push_filters(qb: &mut QueryBuilder<Postgres>, f: &ListingFilters) {
        qb.push(" WHERE l.status = 'active' AND l.is_active = TRUE");
        if let Some(q) = &f.query {
            let pattern = format!("%{}%", q);
            qb.push(" AND (l.title ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR l.description ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR l.city ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR l.state ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR l.country ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(category_id) = f.category_id {
            qb.push(" AND l.category_id = ").push_bind(category_id);
        }
        if let Some(min_price) = f.min_price {
            qb.push(" AND l.price >= ").push_bind(min_price);
        }
        if let Some(max_price) = f.max_price {
            qb.push(" AND l.price <= ").push_bind(max_price);
        }
        if let Some(condition) = f.condition {
            qb.push(" AND l.condition = ").push_bind(condition);
        }
        if let Some(seller_id) = f.seller_id {
            qb.push(" AND l.seller_id = ").push_bind(seller_id);
        }
        if let Some(city) = &f.city {
            qb.push(" AND l.city ILIKE ").push_bind(format!("%{}%", city));
        }
        if let Some(state) = &f.state {
            qb.push(" AND l.state ILIKE ").push_bind(format!("%{}%", state));
        }
        if let Some(country) = &f.country {
            qb.push(" AND l.country ILIKE ").push_bind(format!("%{}%", country));
        }
        if let Some(after) = f.created_after {
            qb.push(" AND l.created_at >= ").push_bind(after);
        }
        if let Some(before) = f.created_before {
            qb.push(" AND l.created_at <= ").push_bind(before);
        }
        if let Some(is_featured) = f.is_featured {
            qb.push(" AND l.is_featured = ").push_bind(is_featured);
        }
        if let Some(is_negotiable) = f.is_negotiable {
            qb.push(" AND l.is_negotiable = ").push_bind(is_negotiable);
        }
        if let Some(geo) = &f.geo {
            qb.push(" AND l.latitude IS NOT NULL AND l.longitude IS NOT NULL AND ");
            push_distance(qb, geo);
            qb.push(" <= ").push_bind(geo.radius_native());
        }
    }

    fn push_order(qb: &mut QueryBuilder<Postgres>, geo: Option<&GeoFilter>, sort: SortKey) {
        qb.push(" ORDER BY ");
        if let Some(geo) = geo {
            push_distance(qb, geo);
            qb.push(" ASC, ");
        }
        let dir = match sort.dir {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        };
        qb.push(format!("l.{} {}, l.id ASC", sort.field.column(), dir));
    }

    #[async_trait]
    impl ListingRepo for PgRepo {
        async fn create_listing(&self, seller_id: Id, new: NewListing) -> RepoResult<Listing> {
            sqlx::query("SELECT 1 FROM categories WHERE id = $1")
                .bind(new.category_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .ok_or(RepoError::NotFound)?;

            let expires_at = if new.status == ListingStatus::Active {
                Some(Utc::now() + chrono::Duration::days(30))
            } else {
                None
            };
            let listing = sqlx::query_as::<_, Listing>(
                r#"
                INSERT INTO listings
                    (title, description, price, currency, category_id, condition, seller_id,
                     status, latitude, longitude, city, state, country, is_featured,
                     is_negotiable, expires_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
                RETURNING *
                "#,
            )
            .bind(&new.title)
            .bind(&new.description)
            .bind(new.price)
            .bind(&new.currency)
            .bind(new.category_id)
            .bind(new.condition)
            .bind(seller_id)
            .bind(new.status)
            .bind(new.latitude)
            .bind(new.longitude)
            .bind(&new.city)
            .bind(&new.state)
            .bind(&new.country)
            .bind(new.is_featured)
            .bind(new.is_negotiable)
            .bind(expires_at)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(listing)
        }

        async fn get_listing(&self, id: Id) -> RepoResult<Listing> {
            sqlx::query_as::<_, Listing>("SELECT * FROM listings WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .ok_or(RepoError::NotFound)
        }

        async fn update_listing(&self, id: Id, upd: UpdateListing) -> RepoResult<Listing> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let mut listing = sqlx::query_as::<_, Listing>(
                "SELECT * FROM listings WHERE id = $1 FOR UPDATE",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?;

            if let Some(cat) = upd.category_id {
                sqlx::query("SELECT 1 FROM categories WHERE id = $1")
                    .bind(cat)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .ok_or(RepoError::NotFound)?;
            }

            if let Some(title) = upd.title { listing.title = title; }
            if let Some(description) = upd.description { listing.description = description; }
            if let Some(price) = upd.price { listing.price = price; }
            if let Some(currency) = upd.currency { listing.currency = currency; }
            if let Some(category_id) = upd.category_id { listing.category_id = category_id; }
            if let Some(condition) = upd.condition { listing.condition = condition; }
            if let Some(status) = upd.status { listing.status = status; }
            if let Some(latitude) = upd.latitude { listing.latitude = Some(latitude); }
            if let Some(longitude) = upd.longitude { listing.longitude = Some(longitude); }
            if let Some(city) = upd.city { listing.city = city; }
            if let Some(state) = upd.state { listing.state = state; }
            if let Some(country) = upd.country { listing.country = country; }
            if let Some(is_featured) = upd.is_featured { listing.is_featured = is_featured; }
            if let Some(is_negotiable) = upd.is_negotiable { listing.is_negotiable = is_negotiable; }
            listing.updated_at = Utc::now();
            apply_expiry(&mut listing);

            let listing = sqlx::query_as::<_, Listing>(
                r#"
                UPDATE listings SET
                    title=$2, description=$3, price=$4, currency=$5, category_id=$6,
                    condition=$7, status=$8, latitude=$9, longitude=$10, city=$11,
                    state=$12, country=$13, is_featured=$14, is_negotiable=$15,
                    updated_at=$16, expires_at=$17
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(listing.id)
            .bind(&listing.title)
            .bind(&listing.description)
            .bind(listing.price)
            .bind(&listing.currency)
            .bind(listing.category_id)
            .bind(listing.condition)
            .bind(listing.status)
            .bind(listing.latitude)
            .bind(listing.longitude)
            .bind(&listing.city)
            .bind(&listing.state)
            .bind(&listing.country)
            .bind(listing.is_featured)
            .bind(listing.is_negotiable)
            .bind(listing.updated_at)
            .bind(listing.expires_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            Ok(listing)
        }

        async fn deactivate_listing(&self, id: Id) -> RepoResult<()> {
            let res = sqlx::query(
                "UPDATE listings SET is_active = FALSE, status = 'suspended', updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }

        async fn search_listings(&self, q: &ListingQuery) -> RepoResult<(Vec<Listing>, u64)> {
            let mut filters = q.filters.clone();
            if let Some(slug) = filters.category_slug.take() {
                let cat: Option<(Id,)> = sqlx::query_as(
                    "SELECT id FROM categories WHERE slug = $1 AND is_active = TRUE",
                )
                .bind(&slug)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
                match cat {
                    Some((id,)) if filters.category_id.map_or(true, |c| c == id) => {
                        filters.category_id = Some(id)
                    }
                    _ => return Ok((Vec::new(), 0)),
                }
            }

            let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM listings l");
            push_filters(&mut count_qb, &filters);
            let total: i64 = count_qb
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;

            let mut qb = QueryBuilder::new("SELECT l.* FROM listings l");
            push_filters(&mut qb, &filters);
            push_order(&mut qb, filters.geo.as_ref(), q.effective_sort());
            let (start, _) = q.page.bounds();
            qb.push(" LIMIT ")
                .push_bind(q.page.page_size as i64)
                .push(" OFFSET ")
                .push_bind(start as i64);
            let rows = qb
                .build_query_as::<Listing>()
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
            Ok((rows, total as u64))
        }

        async fn listings_by_seller(
            &self,
            seller_id: Id,
            only_active: bool,
            exclude: Option<Id>,
            limit: Option<usize>,
        ) -> RepoResult<Vec<Listing>> {
            let mut qb = QueryBuilder::new("SELECT l.* FROM listings l WHERE l.seller_id = ");
            qb.push_bind(seller_id);
            if only_active {
                qb.push(" AND l.status = 'active' AND l.is_active = TRUE");
            }
            if let Some(exclude) = exclude {
                qb.push(" AND l.id <> ").push_bind(exclude);
            }
            qb.push(" ORDER BY l.created_at DESC, l.id ASC");
            if let Some(limit) = limit {
                qb.push(" LIMIT ").push_bind(limit as i64);
            }
            qb.build_query_as::<Listing>()
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)
        }

        async fn trending_listings(&self, days: i64, limit: usize) -> RepoResult<Vec<Listing>> {
            let cutoff = Utc::now() - chrono::Duration::days(days);
            sqlx::query_as::<_, Listing>(
                r#"
                SELECT l.*,
                    (SELECT COUNT(*) FROM listing_views v
                      WHERE v.listing_id = l.id AND v.viewed_at >= $1) AS recent_views,
                    (SELECT COUNT(*) FROM listing_favorites f
                      WHERE f.listing_id = l.id AND f.created_at >= $1) AS recent_favorites
                FROM listings l
                WHERE l.status = 'active' AND l.is_active = TRUE AND l.created_at >= $1
                ORDER BY recent_views DESC, recent_favorites DESC, l.id ASC
                LIMIT $2
                "#,
            )
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
        }

        async fn featured_listings(&self, limit: usize) -> RepoResult<Vec<Listing>> {
            sqlx::query_as::<_, Listing>(
                r#"
                SELECT l.* FROM listings l
                WHERE l.status = 'active' AND l.is_active = TRUE AND l.is_featured = TRUE
                ORDER BY l.created_at DESC, l.id ASC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
        }

        async fn similar_listings(&self, source: &Listing, limit: usize) -> RepoResult<Vec<Listing>> {
            let (lo, hi) = similar_price_band(source.price);
            sqlx::query_as::<_, Listing>(
                r#"
                SELECT l.* FROM listings l
                WHERE l.status = 'active' AND l.is_active = TRUE
                  AND l.category_id = $1 AND l.id <> $2
                  AND l.price BETWEEN $3 AND $4
                ORDER BY l.created_at DESC, l.id ASC
                LIMIT $5
                "#,
            )
            .bind(source.category_id)
            .bind(source.id)
            .bind(lo)
            .bind(hi)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
        }

        async fn recommended_listings(
            &self,
            user_id: Option<Id>,
            limit: usize,
        ) -> RepoResult<Vec<Listing>> {
            let Some(user_id) = user_id else {
                return self.trending_listings(query::DEFAULT_TRENDING_DAYS, limit).await;
            };
            let top: Vec<(Id, i64)> = sqlx::query_as(
                r#"
                SELECT l.category_id, COUNT(*) AS c
                FROM listing_favorites f
                JOIN listings l ON l.id = f.listing_id
                WHERE f.user_id = $1
                GROUP BY l.category_id
                ORDER BY c DESC, l.category_id ASC
                LIMIT 3
                "#,
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            if !top.is_empty() {
                let categories: Vec<Id> = top.into_iter().map(|(id, _)| id).collect();
                let picks = sqlx::query_as::<_, Listing>(
                    r#"
                    SELECT l.* FROM listings l
                    WHERE l.status = 'active' AND l.is_active = TRUE
                      AND l.category_id = ANY($1)
                      AND NOT EXISTS (SELECT 1 FROM listing_favorites f
                                       WHERE f.user_id = $2 AND f.listing_id = l.id)
                    ORDER BY l.created_at DESC, l.id ASC
                    LIMIT $3
                    "#,
                )
                .bind(&categories)
                .bind(user_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
                if picks.len() >= limit {
                    return Ok(picks);
                }
            }
            // full substitution, never a partial backfill
            self.trending_listings(query::DEFAULT_TRENDING_DAYS, limit).await
        }

        async fn record_view(&self, listing_id: Id, view: NewListingView) -> RepoResult<Listing> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            // store-level increment, immune to lost updates
            let listing = sqlx::query_as::<_, Listing>(
                "UPDATE listings SET views_count = views_count + 1 WHERE id = $1 RETURNING *",
            )
            .bind(listing_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?;
            sqlx::query(
                "INSERT INTO listing_views (listing_id, user_id, ip_address, user_agent) VALUES ($1,$2,$3,$4)",
            )
            .bind(listing_id)
            .bind(view.user_id)
            .bind(view.ip_address)
            .bind(view.user_agent)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            Ok(listing)
        }

        async fn listing_stats(&self, source: &Listing) -> RepoResult<ListingStats> {
            let avg_price_in_category: Decimal = sqlx::query_scalar(
                r#"
                SELECT COALESCE(AVG(price), 0) FROM listings
                WHERE category_id = $1 AND status = 'active' AND is_active = TRUE
                "#,
            )
            .bind(source.category_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

            let (lo, hi) = similar_price_band(source.price);
            let similar: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM listings
                WHERE category_id = $1 AND id <> $2 AND price BETWEEN $3 AND $4
                  AND status = 'active' AND is_active = TRUE
                "#,
            )
            .bind(source.category_id)
            .bind(source.id)
            .bind(lo)
            .bind(hi)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

            Ok(ListingStats {
                total_views: source.views_count,
                total_favorites: source.favorites_count,
                avg_price_in_category,
                similar_listings_count: similar as u64,
            })
        }

        async fn listing_analytics(&self, listing_id: Id, days: i64) -> RepoResult<ListingAnalytics> {
            let cutoff = Utc::now() - chrono::Duration::days(days);

            let daily: Vec<(NaiveDate, i64)> = sqlx::query_as(
                r#"
                SELECT date(viewed_at) AS day, COUNT(*) AS c
                FROM listing_views
                WHERE listing_id = $1 AND viewed_at >= $2
                GROUP BY day ORDER BY day ASC
                "#,
            )
            .bind(listing_id)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            let ips: Vec<(String, i64)> = sqlx::query_as(
                r#"
                SELECT ip_address, COUNT(*) AS c
                FROM listing_views
                WHERE listing_id = $1 AND viewed_at >= $2 AND ip_address IS NOT NULL
                GROUP BY ip_address ORDER BY c DESC, ip_address ASC
                LIMIT 10
                "#,
            )
            .bind(listing_id)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            let agents: Vec<(String, i64)> = sqlx::query_as(
                r#"
                SELECT user_agent, COUNT(*) AS c
                FROM listing_views
                WHERE listing_id = $1 AND viewed_at >= $2
                GROUP BY user_agent ORDER BY c DESC, user_agent ASC
                LIMIT 5
                "#,
            )
            .bind(listing_id)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            let (total, unique): (i64, i64) = sqlx::query_as(
                r#"
                SELECT COUNT(*), COUNT(DISTINCT ip_address)
                FROM listing_views
                WHERE listing_id = $1 AND viewed_at >= $2
                "#,
            )
            .bind(listing_id)
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

            Ok(ListingAnalytics {
                daily_views: daily.into_iter().map(|(day, count)| DailyViews { day, count }).collect(),
                top_ips: ips
                    .into_iter()
                    .map(|(ip_address, count)| IpViews { ip_address, count })
                    .collect(),
                top_user_agents: agents
                    .into_iter()
                    .map(|(user_agent, count)| UserAgentViews { user_agent, count })
                    .collect(),
                total_views_period: total as u64,
                unique_visitors: unique as u64,
            })
        }
    }

    #[async_trait]
    impl FavoriteRepo for PgRepo {
        async fn toggle_favorite(&self, user_id: Id, listing_id: Id) -> RepoResult<FavoriteToggle> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::query(
                "SELECT 1 FROM listings WHERE id = $1 AND status = 'active' AND is_active = TRUE FOR UPDATE",
            )
            .bind(listing_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?;

            let removed = sqlx::query(
                "DELETE FROM listing_favorites WHERE user_id = $1 AND listing_id = $2",
            )
            .bind(user_id)
            .bind(listing_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            let is_favorited = if removed.rows_affected() == 0 {
                sqlx::query("INSERT INTO listing_favorites (user_id, listing_id) VALUES ($1,$2)")
                    .bind(user_id)
                    .bind(listing_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                true
            } else {
                false
            };

            let favorites_count: i64 = sqlx::query_scalar(
                r#"
                UPDATE listings
                SET favorites_count = (SELECT COUNT(*) FROM listing_favorites WHERE listing_id = $1)
                WHERE id = $1
                RETURNING favorites_count
                "#,
            )
            .bind(listing_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            Ok(FavoriteToggle { is_favorited, favorites_count })
        }

        async fn favorites_for_user(&self, user_id: Id) -> RepoResult<Vec<UserFavorite>> {
            let rows = sqlx::query(
                r#"
                SELECT l.*, f.id AS favorite_id, f.created_at AS favorited_at
                FROM listing_favorites f
                JOIN listings l ON l.id = f.listing_id
                WHERE f.user_id = $1
                ORDER BY f.created_at DESC, f.id ASC
                "#,
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            rows.into_iter()
                .map(|row| {
                    let listing = Listing::from_row(&row).map_err(db_err)?;
                    Ok(UserFavorite {
                        id: row.try_get("favorite_id").map_err(db_err)?,
                        listing,
                        created_at: row.try_get("favorited_at").map_err(db_err)?,
                    })
                })
                .collect()
        }
    }

    #[async_trait]
    impl CategoryRepo for PgRepo {
        async fn list_categories(&self) -> RepoResult<Vec<Category>> {
            sqlx::query_as::<_, Category>(
                "SELECT * FROM categories WHERE is_active = TRUE ORDER BY sort_order ASC, name ASC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
        }

        async fn category_tree(&self) -> RepoResult<Vec<CategoryNode>> {
            let all = self.list_categories().await?;
            let roots = all.iter().filter(|c| c.parent_id.is_none());
            Ok(roots
                .map(|root| CategoryNode {
                    category: root.clone(),
                    children: all
                        .iter()
                        .filter(|c| c.parent_id == Some(root.id))
                        .cloned()
                        .collect(),
                })
                .collect())
        }

        async fn get_category_by_slug(&self, slug: &str) -> RepoResult<Category> {
            sqlx::query_as::<_, Category>(
                "SELECT * FROM categories WHERE slug = $1 AND is_active = TRUE",
            )
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)
        }

        async fn category_children(&self, slug: &str) -> RepoResult<Vec<Category>> {
            let parent = self.get_category_by_slug(slug).await?;
            sqlx::query_as::<_, Category>(
                r#"
                SELECT * FROM categories
                WHERE parent_id = $1 AND is_active = TRUE
                ORDER BY sort_order ASC, name ASC
                "#,
            )
            .bind(parent.id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
        }

        async fn create_category(&self, new: NewCategory) -> RepoResult<Category> {
            if let Some(parent) = new.parent_id {
                sqlx::query("SELECT 1 FROM categories WHERE id = $1")
                    .bind(parent)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_err)?
                    .ok_or(RepoError::NotFound)?;
            }
            sqlx::query_as::<_, Category>(
                r#"
                INSERT INTO categories (name, slug, description, parent_id, sort_order)
                VALUES ($1,$2,$3,$4,$5)
                RETURNING *
                "#,
            )
            .bind(&new.name)
            .bind(&new.slug)
            .bind(&new.description)
            .bind(new.parent_id)
            .bind(new.sort_order)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
        }
    }

    #[async_trait]
    impl ReportRepo for PgRepo {
        async fn create_report(
            &self,
            listing_id: Id,
            reporter_id: Id,
            new: NewListingReport,
        ) -> RepoResult<ListingReport> {
            sqlx::query("SELECT 1 FROM listings WHERE id = $1")
                .bind(listing_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .ok_or(RepoError::NotFound)?;
            sqlx::query_as::<_, ListingReport>(
                r#"
                INSERT INTO listing_reports (listing_id, reporter_id, report_type, description)
                VALUES ($1,$2,$3,$4)
                RETURNING *
                "#,
            )
            .bind(listing_id)
            .bind(reporter_id)
            .bind(new.report_type)
            .bind(&new.description)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
        }
    }
}
