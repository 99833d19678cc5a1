use std::sync::Arc;

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{create_jwt, Auth, Role};
use crate::error::{ApiError, FieldError};
use crate::models::*;
use crate::query::{
    self, GeoFilter, ListingFilters, ListingQuery, ListingQueryParams, Page, SearchRequest,
};
use crate::rate_limit::RateLimiterFacade;
use crate::repo::Repo;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub limits: RateLimiterFacade,
}

/// Client address for rate limiting and the view log: first element of
/// X-Forwarded-For when present, otherwise the peer address.
fn client_ip(req: &HttpRequest) -> Option<String> {
    if let Some(fwd) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = fwd.to_str() {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return Some(first.to_string());
                }
            }
        }
    }
    req.peer_addr().map(|a| a.ip().to_string())
}

fn user_agent(req: &HttpRequest) -> String {
    req.headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn caller_id(auth: &Auth) -> Result<Id, ApiError> {
    auth.0.user_id().ok_or(ApiError::Forbidden)
}

fn ensure_owner_or_admin(auth: &Auth, listing: &Listing) -> Result<(), ApiError> {
    let caller = caller_id(auth)?;
    if listing.seller_id != caller && !auth.0.has_role(Role::Admin) {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

fn page_body(results: Vec<Listing>, total: u64, page: Page) -> ListingPage {
    ListingPage {
        total_pages: page.total_pages(total),
        total_count: total,
        page: page.page,
        page_size: page.page_size,
        results,
    }
}

// ---------------------------------------------------------------------------
// Listings: discovery
// ---------------------------------------------------------------------------

/// Filtered, ranked, paginated listing search.
#[utoipa::path(
    get,
    path = "/api/v1/listings",
    params(ListingQueryParams),
    responses(
        (status = 200, description = "One page of matching listings", body = ListingPage),
        (status = 400, description = "Invalid filter parameters"),
    ),
    tag = "listings"
)]
pub async fn list_listings(
    state: web::Data<AppState>,
    params: web::Query<ListingQueryParams>,
) -> Result<HttpResponse, ApiError> {
    let q = params.into_inner().into_query().map_err(ApiError::Validation)?;
    let (results, total) = state.repo.search_listings(&q).await?;
    Ok(HttpResponse::Ok().json(page_body(results, total, q.page)))
}

/// Same search surface as GET /listings, but as a typed JSON body.
#[utoipa::path(
    post,
    path = "/api/v1/listings/search",
    request_body = SearchRequest,
    responses(
        (status = 200, body = ListingPage),
        (status = 400, description = "Invalid search body"),
    ),
    tag = "listings"
)]
pub async fn search_listings(
    state: web::Data<AppState>,
    body: web::Json<SearchRequest>,
) -> Result<HttpResponse, ApiError> {
    let q = body.into_inner().into_query().map_err(ApiError::Validation)?;
    let (results, total) = state.repo.search_listings(&q).await?;
    Ok(HttpResponse::Ok().json(page_body(results, total, q.page)))
}

#[derive(Debug, Default, Deserialize)]
pub struct WindowParams {
    pub days: Option<String>,
    pub limit: Option<String>,
}

/// Recently created active listings ranked by views then favorites inside
/// the window.
#[utoipa::path(
    get,
    path = "/api/v1/listings/trending",
    responses((status = 200, body = [Listing])),
    tag = "listings"
)]
pub async fn trending(
    state: web::Data<AppState>,
    params: web::Query<WindowParams>,
) -> Result<HttpResponse, ApiError> {
    let mut errs = Vec::new();
    let days = query::parse_opt("days", &params.days, &mut errs)
        .unwrap_or(query::DEFAULT_TRENDING_DAYS);
    let limit = query::parse_opt("limit", &params.limit, &mut errs)
        .unwrap_or(query::DEFAULT_TRENDING_LIMIT);
    if !errs.is_empty() {
        return Err(ApiError::Validation(errs));
    }
    let listings = state.repo.trending_listings(days, limit).await?;
    Ok(HttpResponse::Ok().json(listings))
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<String>,
}

fn parse_limit(params: &LimitParams, default: usize) -> Result<usize, ApiError> {
    let mut errs = Vec::new();
    let limit = query::parse_opt("limit", &params.limit, &mut errs).unwrap_or(default);
    if !errs.is_empty() {
        return Err(ApiError::Validation(errs));
    }
    Ok(limit)
}

#[utoipa::path(
    get,
    path = "/api/v1/listings/featured",
    responses((status = 200, body = [Listing])),
    tag = "listings"
)]
pub async fn featured(
    state: web::Data<AppState>,
    params: web::Query<LimitParams>,
) -> Result<HttpResponse, ApiError> {
    let limit = parse_limit(&params, 10)?;
    let listings = state.repo.featured_listings(limit).await?;
    Ok(HttpResponse::Ok().json(listings))
}

#[derive(Debug, Default, Deserialize)]
pub struct NearbyParams {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub radius: Option<String>,
    pub limit: Option<String>,
}

/// Active listings within a radius of a point, nearest first.
#[utoipa::path(
    get,
    path = "/api/v1/listings/nearby",
    responses(
        (status = 200, body = [Listing]),
        (status = 400, description = "Missing or invalid coordinates"),
    ),
    tag = "listings"
)]
pub async fn nearby(
    state: web::Data<AppState>,
    params: web::Query<NearbyParams>,
) -> Result<HttpResponse, ApiError> {
    let mut errs = Vec::new();
    let latitude: Option<f64> = query::parse_opt("latitude", &params.latitude, &mut errs);
    let longitude: Option<f64> = query::parse_opt("longitude", &params.longitude, &mut errs);
    let radius_km = query::parse_opt("radius", &params.radius, &mut errs)
        .unwrap_or(query::DEFAULT_RADIUS_KM);
    let limit: u32 = query::parse_opt("limit", &params.limit, &mut errs)
        .unwrap_or(query::DEFAULT_PAGE_SIZE);
    if params.latitude.is_none() {
        errs.push(FieldError::new("latitude", "required"));
    }
    if params.longitude.is_none() {
        errs.push(FieldError::new("longitude", "required"));
    }
    if radius_km <= 0.0 {
        errs.push(FieldError::new("radius", "must be greater than zero"));
    }
    let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
        return Err(ApiError::Validation(errs));
    };
    if !errs.is_empty() {
        return Err(ApiError::Validation(errs));
    }

    let q = ListingQuery {
        filters: ListingFilters {
            geo: Some(GeoFilter { latitude, longitude, radius_km }),
            ..Default::default()
        },
        sort: None,
        page: Page { page: 1, page_size: limit },
    };
    let (results, _) = state.repo.search_listings(&q).await?;
    Ok(HttpResponse::Ok().json(results))
}

/// Picks drawn from the caller's three most-favorited categories; falls back
/// to trending for anonymous callers or thin favorite histories.
#[utoipa::path(
    get,
    path = "/api/v1/listings/recommendations",
    responses((status = 200, body = [Listing])),
    tag = "listings"
)]
pub async fn recommendations(
    state: web::Data<AppState>,
    params: web::Query<LimitParams>,
    auth: Option<Auth>,
) -> Result<HttpResponse, ApiError> {
    let limit = parse_limit(&params, 10)?;
    let user_id = auth.as_ref().and_then(|a| a.0.user_id());
    let listings = state.repo.recommended_listings(user_id, limit).await?;
    Ok(HttpResponse::Ok().json(listings))
}

#[utoipa::path(
    get,
    path = "/api/v1/listings/favorites",
    responses((status = 200, body = [UserFavorite]), (status = 401)),
    security(("bearer_auth" = [])),
    tag = "listings"
)]
pub async fn my_favorites(
    state: web::Data<AppState>,
    auth: Auth,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&auth)?;
    let favorites = state.repo.favorites_for_user(user_id).await?;
    Ok(HttpResponse::Ok().json(favorites))
}

/// The caller's own listings, drafts and suspended ones included.
#[utoipa::path(
    get,
    path = "/api/v1/listings/mine",
    responses((status = 200, body = [Listing]), (status = 401)),
    security(("bearer_auth" = [])),
    tag = "listings"
)]
pub async fn my_listings(
    state: web::Data<AppState>,
    auth: Auth,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&auth)?;
    let listings = state.repo.listings_by_seller(user_id, false, None, None).await?;
    Ok(HttpResponse::Ok().json(listings))
}

#[derive(Debug, Default, Deserialize)]
pub struct SellerParams {
    pub exclude: Option<String>,
    pub limit: Option<String>,
}

/// A seller's active listings, optionally excluding one (used by listing
/// detail pages to show "more from this seller").
#[utoipa::path(
    get,
    path = "/api/v1/listings/seller/{seller_id}",
    responses((status = 200, body = [Listing])),
    tag = "listings"
)]
pub async fn seller_listings(
    state: web::Data<AppState>,
    path: web::Path<Id>,
    params: web::Query<SellerParams>,
) -> Result<HttpResponse, ApiError> {
    let mut errs = Vec::new();
    let exclude: Option<Id> = query::parse_opt("exclude", &params.exclude, &mut errs);
    let limit = query::parse_opt("limit", &params.limit, &mut errs).unwrap_or(10);
    if !errs.is_empty() {
        return Err(ApiError::Validation(errs));
    }
    let listings = state
        .repo
        .listings_by_seller(path.into_inner(), true, exclude, Some(limit))
        .await?;
    Ok(HttpResponse::Ok().json(listings))
}

// ---------------------------------------------------------------------------
// Listings: CRUD
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/listings",
    request_body = NewListing,
    responses(
        (status = 201, body = Listing),
        (status = 401),
        (status = 404, description = "Unknown category"),
        (status = 429, description = "Listing creation rate exceeded"),
    ),
    security(("bearer_auth" = [])),
    tag = "listings"
)]
pub async fn create_listing(
    state: web::Data<AppState>,
    req: HttpRequest,
    auth: Auth,
    body: web::Json<NewListing>,
) -> Result<HttpResponse, ApiError> {
    let seller_id = caller_id(&auth)?;
    let ip = client_ip(&req).unwrap_or_else(|| "unknown".to_string());
    if !state.limits.allow_listing(&ip) {
        return Err(ApiError::RateLimited);
    }
    let listing = state.repo.create_listing(seller_id, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(listing))
}

/// Listing detail. Every hit appends a view-log row and bumps the counter;
/// the body reflects the count after this view.
#[utoipa::path(
    get,
    path = "/api/v1/listings/{id}",
    responses((status = 200, body = Listing), (status = 404)),
    tag = "listings"
)]
pub async fn get_listing(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Id>,
    auth: Option<Auth>,
) -> Result<HttpResponse, ApiError> {
    let view = NewListingView {
        user_id: auth.as_ref().and_then(|a| a.0.user_id()),
        ip_address: client_ip(&req),
        user_agent: user_agent(&req),
    };
    let listing = state.repo.record_view(path.into_inner(), view).await?;
    Ok(HttpResponse::Ok().json(listing))
}

#[utoipa::path(
    patch,
    path = "/api/v1/listings/{id}",
    request_body = UpdateListing,
    responses(
        (status = 200, body = Listing),
        (status = 401),
        (status = 403, description = "Not the seller"),
        (status = 404),
    ),
    security(("bearer_auth" = [])),
    tag = "listings"
)]
pub async fn update_listing(
    state: web::Data<AppState>,
    path: web::Path<Id>,
    auth: Auth,
    body: web::Json<UpdateListing>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let listing = state.repo.get_listing(id).await?;
    ensure_owner_or_admin(&auth, &listing)?;
    let updated = state.repo.update_listing(id, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(updated))
}

/// Soft delete. The row survives for the seller's own views and audit.
#[utoipa::path(
    delete,
    path = "/api/v1/listings/{id}",
    responses((status = 204), (status = 401), (status = 403), (status = 404)),
    security(("bearer_auth" = [])),
    tag = "listings"
)]
pub async fn delete_listing(
    state: web::Data<AppState>,
    path: web::Path<Id>,
    auth: Auth,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let listing = state.repo.get_listing(id).await?;
    ensure_owner_or_admin(&auth, &listing)?;
    state.repo.deactivate_listing(id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------------------------------------------------------------------
// Listings: per-listing actions
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/listings/{id}/favorite",
    responses(
        (status = 200, body = FavoriteToggle),
        (status = 401),
        (status = 404, description = "Listing missing or not active"),
        (status = 429),
    ),
    security(("bearer_auth" = [])),
    tag = "listings"
)]
pub async fn toggle_favorite(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Id>,
    auth: Auth,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&auth)?;
    let ip = client_ip(&req).unwrap_or_else(|| "unknown".to_string());
    if !state.limits.allow_favorite(&ip) {
        return Err(ApiError::RateLimited);
    }
    let toggle = state.repo.toggle_favorite(user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(toggle))
}

#[utoipa::path(
    post,
    path = "/api/v1/listings/{id}/report",
    request_body = NewListingReport,
    responses((status = 201, body = ListingReport), (status = 401), (status = 404), (status = 429)),
    security(("bearer_auth" = [])),
    tag = "listings"
)]
pub async fn report_listing(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<Id>,
    auth: Auth,
    body: web::Json<NewListingReport>,
) -> Result<HttpResponse, ApiError> {
    let reporter_id = caller_id(&auth)?;
    let ip = client_ip(&req).unwrap_or_else(|| "unknown".to_string());
    if !state.limits.allow_report(&ip) {
        return Err(ApiError::RateLimited);
    }
    let report = state
        .repo
        .create_report(path.into_inner(), reporter_id, body.into_inner())
        .await?;
    Ok(HttpResponse::Created().json(report))
}

/// Active listings in the same category inside a ±30% price band.
#[utoipa::path(
    get,
    path = "/api/v1/listings/{id}/similar",
    responses((status = 200, body = [Listing]), (status = 404)),
    tag = "listings"
)]
pub async fn similar_listings(
    state: web::Data<AppState>,
    path: web::Path<Id>,
    params: web::Query<LimitParams>,
) -> Result<HttpResponse, ApiError> {
    let limit = parse_limit(&params, 5)?;
    let source = state.repo.get_listing(path.into_inner()).await?;
    let listings = state.repo.similar_listings(&source, limit).await?;
    Ok(HttpResponse::Ok().json(listings))
}

#[utoipa::path(
    get,
    path = "/api/v1/listings/{id}/stats",
    responses((status = 200, body = ListingStats), (status = 401), (status = 403), (status = 404)),
    security(("bearer_auth" = [])),
    tag = "listings"
)]
pub async fn listing_stats(
    state: web::Data<AppState>,
    path: web::Path<Id>,
    auth: Auth,
) -> Result<HttpResponse, ApiError> {
    let listing = state.repo.get_listing(path.into_inner()).await?;
    ensure_owner_or_admin(&auth, &listing)?;
    let stats = state.repo.listing_stats(&listing).await?;
    Ok(HttpResponse::Ok().json(stats))
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyticsParams {
    pub days: Option<String>,
}

/// Seller-facing view analytics over a trailing window.
#[utoipa::path(
    get,
    path = "/api/v1/listings/{id}/analytics",
    responses((status = 200, body = ListingAnalytics), (status = 401), (status = 403), (status = 404)),
    security(("bearer_auth" = [])),
    tag = "listings"
)]
pub async fn listing_analytics(
    state: web::Data<AppState>,
    path: web::Path<Id>,
    params: web::Query<AnalyticsParams>,
    auth: Auth,
) -> Result<HttpResponse, ApiError> {
    let mut errs = Vec::new();
    let days = query::parse_opt("days", &params.days, &mut errs)
        .unwrap_or(query::DEFAULT_ANALYTICS_DAYS);
    if !errs.is_empty() {
        return Err(ApiError::Validation(errs));
    }
    let listing = state.repo.get_listing(path.into_inner()).await?;
    ensure_owner_or_admin(&auth, &listing)?;
    let analytics = state.repo.listing_analytics(listing.id, days).await?;
    Ok(HttpResponse::Ok().json(analytics))
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/categories",
    responses((status = 200, body = [Category])),
    tag = "categories"
)]
pub async fn list_categories(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let categories = state.repo.list_categories().await?;
    Ok(HttpResponse::Ok().json(categories))
}

#[utoipa::path(
    get,
    path = "/api/v1/categories/tree",
    responses((status = 200, body = [CategoryNode])),
    tag = "categories"
)]
pub async fn category_tree(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let tree = state.repo.category_tree().await?;
    Ok(HttpResponse::Ok().json(tree))
}

#[utoipa::path(
    get,
    path = "/api/v1/categories/{slug}",
    responses((status = 200, body = Category), (status = 404)),
    tag = "categories"
)]
pub async fn get_category(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let category = state.repo.get_category_by_slug(&path).await?;
    Ok(HttpResponse::Ok().json(category))
}

#[utoipa::path(
    get,
    path = "/api/v1/categories/{slug}/children",
    responses((status = 200, body = [Category]), (status = 404)),
    tag = "categories"
)]
pub async fn category_children(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let children = state.repo.category_children(&path).await?;
    Ok(HttpResponse::Ok().json(children))
}

#[utoipa::path(
    post,
    path = "/api/v1/categories",
    request_body = NewCategory,
    responses(
        (status = 201, body = Category),
        (status = 401),
        (status = 403, description = "Admin only"),
        (status = 409, description = "Name or slug already taken"),
    ),
    security(("bearer_auth" = [])),
    tag = "categories"
)]
pub async fn create_category(
    state: web::Data<AppState>,
    auth: Auth,
    body: web::Json<NewCategory>,
) -> Result<HttpResponse, ApiError> {
    if !auth.0.has_role(Role::Admin) {
        return Err(ApiError::Forbidden);
    }
    let category = state.repo.create_category(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(category))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct MeResponse {
    pub id: Option<Id>,
    pub username: String,
    pub roles: Vec<Role>,
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses((status = 200, body = MeResponse), (status = 401)),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn auth_me(auth: Auth) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(MeResponse {
        id: auth.0.user_id(),
        username: auth.0.username().to_string(),
        roles: auth.0.roles.clone(),
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub token: String,
}

/// Mint a fresh token carrying the same subject and roles.
#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    responses((status = 200, body = TokenResponse), (status = 401)),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn refresh_token(auth: Auth) -> Result<HttpResponse, ApiError> {
    let id = caller_id(&auth)?;
    let token = create_jwt(id, auth.0.username(), auth.0.roles.clone())
        .map_err(|_| ApiError::Internal)?;
    Ok(HttpResponse::Ok().json(TokenResponse { token }))
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            // literal listing paths go before /listings/{id}
            .route("/listings/search", web::post().to(search_listings))
            .route("/listings/trending", web::get().to(trending))
            .route("/listings/featured", web::get().to(featured))
            .route("/listings/nearby", web::get().to(nearby))
            .route("/listings/recommendations", web::get().to(recommendations))
            .route("/listings/favorites", web::get().to(my_favorites))
            .route("/listings/mine", web::get().to(my_listings))
            .route("/listings/seller/{seller_id}", web::get().to(seller_listings))
            .route("/listings", web::get().to(list_listings))
            .route("/listings", web::post().to(create_listing))
            .route("/listings/{id}", web::get().to(get_listing))
            .route("/listings/{id}", web::patch().to(update_listing))
            .route("/listings/{id}", web::delete().to(delete_listing))
            .route("/listings/{id}/favorite", web::post().to(toggle_favorite))
            .route("/listings/{id}/report", web::post().to(report_listing))
            .route("/listings/{id}/similar", web::get().to(similar_listings))
            .route("/listings/{id}/stats", web::get().to(listing_stats))
            .route("/listings/{id}/analytics", web::get().to(listing_analytics))
            .route("/categories", web::get().to(list_categories))
            .route("/categories", web::post().to(create_category))
            .route("/categories/tree", web::get().to(category_tree))
            .route("/categories/{slug}", web::get().to(get_category))
            .route("/categories/{slug}/children", web::get().to(category_children))
            .route("/auth/me", web::get().to(auth_me))
            .route("/auth/refresh", web::post().to(refresh_token)),
    );
}
