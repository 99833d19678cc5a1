#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use bazaar::auth::{create_jwt, Role};
use bazaar::rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use bazaar::repo::inmem::InMemRepo;
use bazaar::{config, AppState, SecurityHeaders};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

// Helper to ensure JWT secret present & unique temp data dir per test
fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("BAZAAR_DATA_DIR", tmp.path().to_str().unwrap());
}

fn admin_token() -> String {
    create_jwt(1, "admin", vec![Role::Admin]).unwrap()
}

fn seller_token() -> String {
    create_jwt(2, "seller", vec![Role::User]).unwrap()
}

fn buyer_token() -> String {
    create_jwt(3, "buyer", vec![Role::User]).unwrap()
}

fn limits_off() -> RateLimiterFacade {
    RateLimiterFacade::new(InMemoryRateLimiter::new(false), RateLimitConfig::from_env())
}

fn state(limits: RateLimiterFacade) -> AppState {
    AppState { repo: Arc::new(InMemRepo::new()), limits }
}

fn listing_body(category_id: i64, title: &str, price: &str) -> serde_json::Value {
    serde_json::json!({
        "title": title,
        "description": "A listing",
        "price": price,
        "category_id": category_id,
        "status": "active",
        "city": "Lisbon",
        "country": "Portugal"
    })
}

async fn create_category<S>(app: &S, slug: &str) -> i64
where
    S: actix_web::dev::Service<
        actix_http::Request,
        Response = actix_web::dev::ServiceResponse,
        Error = actix_web::Error,
    >,
{
    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .set_json(serde_json::json!({"name": slug, "slug": slug}))
        .to_request();
    let resp = test::call_service(app, req).await;
    assert_eq!(resp.status(), 201);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    v["id"].as_i64().unwrap()
}

#[actix_web::test]
#[serial]
async fn test_listing_lifecycle_routes() {
    setup_env();
    let app = test::init_service(
        App::new()
            .wrap(SecurityHeaders::from_env())
            .app_data(actix_web::web::Data::new(state(limits_off())))
            .configure(config),
    )
    .await;

    // category creation is admin only
    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(("Authorization", format!("Bearer {}", seller_token())))
        .set_json(serde_json::json!({"name": "Bikes", "slug": "bikes"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let cat = create_category(&app, "bikes").await;

    // anonymous creation is rejected
    let req = test::TestRequest::post()
        .uri("/api/v1/listings")
        .set_json(listing_body(cat, "Frame", "100.00"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    // seller creates a listing
    let req = test::TestRequest::post()
        .uri("/api/v1/listings")
        .insert_header(("Authorization", format!("Bearer {}", seller_token())))
        .set_json(listing_body(cat, "Frame", "100.00"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let listing: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let id = listing["id"].as_i64().unwrap();
    assert_eq!(listing["seller_id"].as_i64(), Some(2));
    assert!(listing["expires_at"].is_string());

    // search returns the paginated envelope
    let req = test::TestRequest::get().uri("/api/v1/listings").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let page: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(page["total_count"].as_u64(), Some(1));
    assert_eq!(page["page"].as_u64(), Some(1));
    assert_eq!(page["results"].as_array().unwrap().len(), 1);

    // every detail hit counts a view
    let req = test::TestRequest::get().uri(&format!("/api/v1/listings/{id}")).to_request();
    let resp = test::call_service(&app, req).await;
    let detail: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(detail["views_count"].as_i64(), Some(1));
    let req = test::TestRequest::get().uri(&format!("/api/v1/listings/{id}")).to_request();
    let resp = test::call_service(&app, req).await;
    let detail: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(detail["views_count"].as_i64(), Some(2));

    // only the seller (or an admin) may edit
    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/listings/{id}"))
        .insert_header(("Authorization", format!("Bearer {}", buyer_token())))
        .set_json(serde_json::json!({"title": "Hijacked"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/listings/{id}"))
        .insert_header(("Authorization", format!("Bearer {}", seller_token())))
        .set_json(serde_json::json!({"title": "Carbon frame"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let edited: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(edited["title"].as_str(), Some("Carbon frame"));

    // soft delete, then the listing disappears from search
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/listings/{id}"))
        .insert_header(("Authorization", format!("Bearer {}", seller_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);

    let req = test::TestRequest::get().uri("/api/v1/listings").to_request();
    let resp = test::call_service(&app, req).await;
    let page: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(page["total_count"].as_u64(), Some(0));

    // but the seller still sees it under /mine
    let req = test::TestRequest::get()
        .uri("/api/v1/listings/mine")
        .insert_header(("Authorization", format!("Bearer {}", seller_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let mine: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(mine.as_array().unwrap().len(), 1);
    assert_eq!(mine[0]["status"].as_str(), Some("suspended"));
}

#[actix_web::test]
#[serial]
async fn test_validation_errors_name_fields() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(limits_off())))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/listings?min_price=cheap&page=0")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let fields: Vec<&str> = body["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"min_price"));
    assert!(fields.contains(&"page"));

    // nearby insists on both coordinates
    let req = test::TestRequest::get()
        .uri("/api/v1/listings/nearby?latitude=38.7")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
#[serial]
async fn test_discovery_and_favorites_routes() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(limits_off())))
            .configure(config),
    )
    .await;

    let cat = create_category(&app, "bikes").await;
    let req = test::TestRequest::post()
        .uri("/api/v1/listings")
        .insert_header(("Authorization", format!("Bearer {}", seller_token())))
        .set_json(listing_body(cat, "Frame", "100.00"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let listing: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let id = listing["id"].as_i64().unwrap();

    // structured search body
    let req = test::TestRequest::post()
        .uri("/api/v1/listings/search")
        .set_json(serde_json::json!({"query": "frame", "min_price": "50.00"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let page: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(page["total_count"].as_u64(), Some(1));

    // favorite toggle pair
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/listings/{id}/favorite"))
        .insert_header(("Authorization", format!("Bearer {}", buyer_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let toggle: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(toggle["is_favorited"].as_bool(), Some(true));
    assert_eq!(toggle["favorites_count"].as_i64(), Some(1));

    let req = test::TestRequest::get()
        .uri("/api/v1/listings/favorites")
        .insert_header(("Authorization", format!("Bearer {}", buyer_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let favorites: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(favorites.as_array().unwrap().len(), 1);
    assert_eq!(favorites[0]["listing"]["id"].as_i64(), Some(id));

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/listings/{id}/favorite"))
        .insert_header(("Authorization", format!("Bearer {}", buyer_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let toggle: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(toggle["is_favorited"].as_bool(), Some(false));
    assert_eq!(toggle["favorites_count"].as_i64(), Some(0));

    // trending and recommendations answer for anonymous callers
    let req = test::TestRequest::get().uri("/api/v1/listings/trending").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let trending: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(trending.as_array().unwrap().len(), 1);

    let req = test::TestRequest::get().uri("/api/v1/listings/recommendations").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    // stats are private to the seller
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/listings/{id}/stats"))
        .insert_header(("Authorization", format!("Bearer {}", buyer_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/listings/{id}/stats"))
        .insert_header(("Authorization", format!("Bearer {}", seller_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let stats: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(stats["total_favorites"].as_i64(), Some(0));

    // analytics likewise, admin allowed
    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/listings/{id}/analytics"))
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    // reporting
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/listings/{id}/report"))
        .insert_header(("Authorization", format!("Bearer {}", buyer_token())))
        .set_json(serde_json::json!({"report_type": "spam", "description": "spammy"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
}

#[actix_web::test]
#[serial]
async fn test_category_routes() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(limits_off())))
            .configure(config),
    )
    .await;

    let bikes = create_category(&app, "bikes").await;
    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .set_json(serde_json::json!({"name": "Road", "slug": "road", "parent_id": bikes}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    // duplicate slug
    let req = test::TestRequest::post()
        .uri("/api/v1/categories")
        .insert_header(("Authorization", format!("Bearer {}", admin_token())))
        .set_json(serde_json::json!({"name": "Bikes 2", "slug": "bikes"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::get().uri("/api/v1/categories/tree").to_request();
    let resp = test::call_service(&app, req).await;
    let tree: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(tree.as_array().unwrap().len(), 1);
    assert_eq!(tree[0]["children"].as_array().unwrap().len(), 1);

    let req = test::TestRequest::get().uri("/api/v1/categories/bikes/children").to_request();
    let resp = test::call_service(&app, req).await;
    let children: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(children[0]["slug"].as_str(), Some("road"));

    let req = test::TestRequest::get().uri("/api/v1/categories/boats").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
#[serial]
async fn test_favorite_rate_limit() {
    setup_env();
    let limits = RateLimiterFacade::new(
        InMemoryRateLimiter::new(true),
        RateLimitConfig {
            listing_limit: 100,
            listing_window: Duration::from_secs(3600),
            favorite_limit: 2,
            favorite_window: Duration::from_secs(3600),
            report_limit: 100,
            report_window: Duration::from_secs(3600),
        },
    );
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(limits)))
            .configure(config),
    )
    .await;

    let cat = create_category(&app, "bikes").await;
    let req = test::TestRequest::post()
        .uri("/api/v1/listings")
        .insert_header(("Authorization", format!("Bearer {}", seller_token())))
        .set_json(listing_body(cat, "Frame", "100.00"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let listing: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let id = listing["id"].as_i64().unwrap();

    for _ in 0..2 {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/listings/{id}/favorite"))
            .insert_header(("Authorization", format!("Bearer {}", buyer_token())))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/listings/{id}/favorite"))
        .insert_header(("Authorization", format!("Bearer {}", buyer_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 429);
}

#[actix_web::test]
#[serial]
async fn test_auth_me_and_refresh() {
    setup_env();
    let app = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(state(limits_off())))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/auth/me")
        .insert_header(("Authorization", format!("Bearer {}", seller_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["id"].as_i64(), Some(2));
    assert_eq!(me["username"].as_str(), Some("seller"));

    let req = test::TestRequest::post()
        .uri("/api/v1/auth/refresh")
        .insert_header(("Authorization", format!("Bearer {}", seller_token())))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(body["token"].as_str().is_some());

    let req = test::TestRequest::get().uri("/api/v1/auth/me").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}
