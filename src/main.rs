pub mod admin;
pub mod analytics;
pub mod attendance;
pub mod auth;
pub mod config;
pub mod courses;
pub mod db;
pub mod err;
pub mod models;
pub mod profile;
pub mod retry;
pub mod session;
pub mod stats;
pub mod upload;

use axum::{routing::get, routing::post, response::IntoResponse, Router, Json};

use axum::handler::Handler;
use axum::http::Uri;
use axum::Extension;
use serde::Serialize;
use tower::ServiceBuilder;
use crate::config::CONFIG;
use crate::err::{Error, Fine, Maybe, Nothing};
use crate::session::SessionRegistry;

pub type Payload<T> = Result<Json<Maybe<T>>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V> where V: Serialize {
    Ok(Json(Fine(value)))
}

pub fn breaks<V>(err: Error) -> Payload<V> where V: Serialize {
    Ok(Json(Nothing(err)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let pool = db::connect().await?;
    upload::prepare_upload_dir().await?;
    let registry = SessionRegistry::new();

    let app = Router::new()
        .route("/auth/signup", post(auth::sign_up))
        .route("/auth/signin", post(auth::sign_in))
        .route("/auth/signout", post(auth::sign_out))
        .route("/auth/me", get(auth::current_user))
        .route("/profile/:uid", get(profile::read_profile))
        .route("/profile/picture", post(profile::set_picture))
        .route("/courses", get(courses::list_all))
        .route("/courses/mine", get(courses::list_mine))
        .route("/courses/create", post(courses::create))
        .route("/courses/enroll", post(courses::enroll))
        .route("/courses/:id/students", get(courses::enrolled_students))
        .route("/courses/material", post(courses::attach_material))
        .route("/courses/:id/materials", get(courses::list_materials))
        .route("/sessions/generate", post(session::generate))
        .route("/sessions/stop", post(session::stop))
        .route("/sessions/live/:course_id", get(session::live_roster))
        .route("/attendance/mark", post(attendance::mark))
        .route("/attendance/history", get(attendance::history))
        .route("/attendance/stats", get(attendance::stats))
        .route("/analytics/course/:id", get(analytics::course))
        .route("/analytics/student", get(analytics::student))
        .route("/reports/course/:id", get(analytics::course_report))
        .route("/admin/export", get(analytics::export_attendance))
        .route("/upload", post(upload::upload))
        .route("/files/:name", get(upload::serve))
        .route("/admin/approve", post(admin::approve))
        .route("/admin/reject", post(admin::reject))
        .route("/admin/users", get(admin::list_users))
        .route("/admin/users/create", post(admin::create_user))
        .route("/admin/users/delete", post(admin::delete_user))
        .route("/admin/courses/delete", post(admin::delete_course))
        .route("/admin/stats", get(admin::stats))
        .layer(
            ServiceBuilder::new()
                .layer(Extension(pool))
                .layer(Extension(registry)),
        )
        .fallback(err::handler404.into_service());

    log::info!("Starting EduTrack HTTP Server on http://{}", CONFIG.bind_addr);
    axum::Server::bind(&CONFIG.bind_addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
