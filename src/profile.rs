use axum::extract::{Path, Query};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{authenticate, SessionQuery};
use crate::err::Error;
use crate::models::{Role, UserProfile};
use crate::{breaks, proceeds, Payload};

/// Single read-through lookup. Returns None on miss; synthesizing a
/// fallback is the sign-in path's job, not this layer's.
pub async fn get_profile(pg: &PgPool, uid: Uuid) -> Result<Option<UserProfile>, Error> {
    sqlx::query_as::<_, UserProfile>("SELECT * FROM users WHERE uid = $1 LIMIT 1")
        .bind(uid)
        .fetch_optional(pg)
        .await
        .map_err(Error::from)
}

pub async fn insert_profile(pg: &PgPool, profile: &UserProfile) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO users(uid, email, name, role, approved, created_at, approved_at, picture_url)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(profile.uid)
    .bind(&profile.email)
    .bind(&profile.name)
    .bind(profile.role)
    .bind(profile.approved)
    .bind(profile.created_at)
    .bind(profile.approved_at)
    .bind(&profile.picture_url)
    .execute(pg)
    .await?;
    Ok(())
}

/// Heuristic role detection from the email's local part and domain, used
/// only when no stored profile exists. The result is a *degraded* profile
/// and is tagged as such wherever it surfaces.
pub fn detect_role_from_email(email: &str) -> Role {
    if email.contains("admin@") || email.contains("@admin.") {
        Role::Admin
    } else if email.contains("lecturer@") || email.contains("@lecturer.") || email.contains("@staff.") {
        Role::Lecturer
    } else {
        Role::Student
    }
}

pub fn fallback_profile(uid: Uuid, email: &str) -> UserProfile {
    let role = detect_role_from_email(email);
    let name = email.split('@').next().unwrap_or(email).to_string();
    UserProfile {
        uid,
        email: email.to_string(),
        name,
        role,
        approved: role.auto_approved(),
        created_at: Utc::now(),
        approved_at: None,
        picture_url: None,
    }
}

pub async fn read_profile(
    Path(uid): Path<Uuid>,
    Query(q): Query<SessionQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<UserProfile> {
    let requester = authenticate(&q.ssid, &pg).await?;
    if requester.uid != uid && requester.role != Role::Admin {
        return breaks(Error::unauthorized("You may only view your own profile"));
    }

    match get_profile(&pg, uid).await? {
        Some(profile) => proceeds(profile),
        None => breaks(Error::UserDoesNotExist {
            message: format!("No profile exists for user `{}`", uid),
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetPicture {
    pub ssid: String,
    pub url: String,
}

/// Persists an uploaded picture pointer onto the caller's own profile —
/// the second step of the two-phase upload flow.
pub async fn set_picture(
    Extension(pg): Extension<PgPool>,
    Json(req): Json<SetPicture>,
) -> Payload<UserProfile> {
    let requester = authenticate(&req.ssid, &pg).await?;

    sqlx::query("UPDATE users SET picture_url = $1 WHERE uid = $2")
        .bind(&req.url)
        .bind(requester.uid)
        .execute(&pg)
        .await
        .map_err(Error::from)?;

    match get_profile(&pg, requester.uid).await? {
        Some(profile) => proceeds(profile),
        None => breaks(Error::UserDoesNotExist {
            message: "Profile vanished while updating".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_admin_patterns() {
        assert_eq!(detect_role_from_email("admin@university.edu"), Role::Admin);
        assert_eq!(detect_role_from_email("root@admin.university.edu"), Role::Admin);
    }

    #[test]
    fn detects_lecturer_patterns() {
        assert_eq!(detect_role_from_email("lecturer@cs.edu"), Role::Lecturer);
        assert_eq!(detect_role_from_email("smith@lecturer.cs.edu"), Role::Lecturer);
        assert_eq!(detect_role_from_email("jones@staff.university.edu"), Role::Lecturer);
    }

    #[test]
    fn everything_else_defaults_to_student() {
        assert_eq!(detect_role_from_email("jane@student.edu"), Role::Student);
        assert_eq!(detect_role_from_email("someone@example.com"), Role::Student);
    }

    #[test]
    fn fallback_profile_follows_approval_rules() {
        let uid = Uuid::new_v4();

        let student = fallback_profile(uid, "jane@student.edu");
        assert_eq!(student.role, Role::Student);
        assert!(student.approved);
        assert_eq!(student.name, "jane");

        let lecturer = fallback_profile(uid, "smith@staff.university.edu");
        assert_eq!(lecturer.role, Role::Lecturer);
        assert!(!lecturer.approved);
    }
}
