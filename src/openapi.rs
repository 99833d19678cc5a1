use crate::error::FieldError;
use crate::models::{
    Category, CategoryNode, DailyViews, FavoriteToggle, IpViews, Listing, ListingAnalytics,
    ListingPage, ListingReport, ListingStats, NewCategory, NewListing, NewListingReport,
    UpdateListing, UserAgentViews, UserFavorite,
};
use crate::query::{ListingQueryParams, SearchRequest, SortDir, SortField};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_listings,
        crate::routes::search_listings,
        crate::routes::trending,
        crate::routes::featured,
        crate::routes::nearby,
        crate::routes::recommendations,
        crate::routes::my_favorites,
        crate::routes::my_listings,
        crate::routes::seller_listings,
        crate::routes::create_listing,
        crate::routes::get_listing,
        crate::routes::update_listing,
        crate::routes::delete_listing,
        crate::routes::toggle_favorite,
        crate::routes::report_listing,
        crate::routes::similar_listings,
        crate::routes::listing_stats,
        crate::routes::listing_analytics,
        crate::routes::list_categories,
        crate::routes::category_tree,
        crate::routes::get_category,
        crate::routes::category_children,
        crate::routes::create_category,
        crate::routes::auth_me,
        crate::routes::refresh_token,
    ),
    components(schemas(
        Listing, NewListing, UpdateListing, ListingPage,
        Category, NewCategory, CategoryNode,
        UserFavorite, FavoriteToggle,
        ListingReport, NewListingReport,
        ListingStats, ListingAnalytics, DailyViews, IpViews, UserAgentViews,
        ListingQueryParams, SearchRequest, SortField, SortDir,
        FieldError,
        crate::routes::MeResponse, crate::routes::TokenResponse,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "listings", description = "Listing discovery and management"),
        (name = "categories", description = "Category catalogue"),
        (name = "auth", description = "Token introspection and refresh"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
