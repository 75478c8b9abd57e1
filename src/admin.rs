use axum::extract::Query;
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{authenticate, hash_password, SessionQuery};
use crate::err::Error;
use crate::models::{Role, UserProfile};
use crate::profile::insert_profile;
use crate::session::SessionRegistry;
use crate::{breaks, proceeds, Payload};

async fn require_admin(ssid: &str, pg: &PgPool) -> Result<UserProfile, Error> {
    let caller = authenticate(ssid, pg).await?;
    caller.ensure_role(Role::Admin)?;
    Ok(caller)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproveUser {
    pub ssid: String,
    pub user_id: Uuid,
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalChanged {
    pub user_id: Uuid,
    pub approved: bool,
}

pub async fn approve(
    Extension(pg): Extension<PgPool>,
    Json(req): Json<ApproveUser>,
) -> Payload<ApprovalChanged> {
    require_admin(&req.ssid, &pg).await?;

    let approved_at = req.approved.then(Utc::now);
    let affected = sqlx::query(
        "UPDATE users SET approved = $1, approved_at = $2 WHERE uid = $3",
    )
    .bind(req.approved)
    .bind(approved_at)
    .bind(req.user_id)
    .execute(&pg)
    .await
    .map_err(Error::from)?;

    if affected.rows_affected() < 1 {
        return breaks(Error::UserDoesNotExist {
            message: "No such user to approve".to_string(),
        });
    }

    log::info!(
        "User {} approval set to {} by an administrator",
        req.user_id,
        req.approved
    );
    proceeds(ApprovalChanged {
        user_id: req.user_id,
        approved: req.approved,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejectUser {
    pub ssid: String,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRejected {
    pub user_id: Uuid,
}

/// Rejection is a hard delete of the account: credential, profile and any
/// open sessions go together, so the email can be registered again.
pub async fn reject(
    Extension(pg): Extension<PgPool>,
    Json(req): Json<RejectUser>,
) -> Payload<UserRejected> {
    require_admin(&req.ssid, &pg).await?;

    sqlx::query("DELETE FROM user_sessions WHERE belongs_to = $1")
        .bind(req.user_id)
        .execute(&pg)
        .await
        .map_err(Error::from)?;
    let profile = sqlx::query("DELETE FROM users WHERE uid = $1")
        .bind(req.user_id)
        .execute(&pg)
        .await
        .map_err(Error::from)?;
    let credential = sqlx::query("DELETE FROM credentials WHERE uid = $1")
        .bind(req.user_id)
        .execute(&pg)
        .await
        .map_err(Error::from)?;

    if profile.rows_affected() < 1 && credential.rows_affected() < 1 {
        return breaks(Error::UserDoesNotExist {
            message: "No such user to reject".to_string(),
        });
    }

    log::info!("User {} rejected and removed", req.user_id);
    proceeds(UserRejected {
        user_id: req.user_id,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminCreateUser {
    pub ssid: String,
    pub email: String,
    pub password: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminCreatedUser {
    pub user_id: Uuid,
    pub role: Role,
}

/// Admin-created accounts skip the approval queue entirely, lecturers
/// included.
pub async fn create_user(
    Extension(pg): Extension<PgPool>,
    Json(req): Json<AdminCreateUser>,
) -> Payload<AdminCreatedUser> {
    require_admin(&req.ssid, &pg).await?;

    if req.email.is_empty() || !req.email.contains('@') {
        return breaks(Error::invalid("A valid email address is required"));
    }
    if req.name.is_empty() {
        return breaks(Error::invalid("A display name is required"));
    }
    if req.password.len() < 6 {
        return breaks(Error::MissingCredentials {
            message: "Password must be at least 6 characters".to_string(),
        });
    }

    let taken = sqlx::query("SELECT 1 FROM credentials WHERE email = $1 LIMIT 1")
        .bind(&req.email)
        .fetch_optional(&pg)
        .await
        .map_err(Error::from)?;
    if taken.is_some() {
        return breaks(Error::UserAlreadyExists {
            message: "An account with this email already exists".to_string(),
        });
    }

    let uid = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query("INSERT INTO credentials VALUES ($1, $2, $3, $4)")
        .bind(uid)
        .bind(&req.email)
        .bind(hash_password(&req.password)?)
        .bind(now)
        .execute(&pg)
        .await
        .map_err(Error::from)?;

    let profile = UserProfile {
        uid,
        email: req.email,
        name: req.name,
        role: req.role,
        approved: true,
        created_at: now,
        approved_at: Some(now),
        picture_url: None,
    };
    insert_profile(&pg, &profile).await.map_err(Error::from)?;

    log::info!(
        "Administrator created {} account {} ({})",
        profile.role.as_str(),
        uid,
        profile.email
    );
    proceeds(AdminCreatedUser {
        user_id: uid,
        role: profile.role,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct UserList {
    pub count: usize,
    pub users: Vec<UserProfile>,
}

pub async fn list_users(
    Query(q): Query<SessionQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<UserList> {
    require_admin(&q.ssid, &pg).await?;

    let users = sqlx::query_as::<_, UserProfile>(
        "SELECT * FROM users ORDER BY created_at DESC",
    )
    .fetch_all(&pg)
    .await
    .map_err(Error::from)?;

    proceeds(UserList {
        count: users.len(),
        users,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub students: i64,
    pub lecturers: i64,
    pub admins: i64,
    pub pending_approval: i64,
    pub courses: i64,
    pub enrollments: i64,
    pub attendance_records: i64,
}

async fn count(pg: &PgPool, sql: &str) -> Result<i64, Error> {
    let (n,) = sqlx::query_as::<_, (i64,)>(sql)
        .fetch_one(pg)
        .await
        .map_err(Error::from)?;
    Ok(n)
}

pub async fn stats(
    Query(q): Query<SessionQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<SystemStats> {
    require_admin(&q.ssid, &pg).await?;

    proceeds(SystemStats {
        students: count(&pg, "SELECT COUNT(*) FROM users WHERE role = 'student'").await?,
        lecturers: count(&pg, "SELECT COUNT(*) FROM users WHERE role = 'lecturer'").await?,
        admins: count(&pg, "SELECT COUNT(*) FROM users WHERE role = 'admin'").await?,
        pending_approval: count(
            &pg,
            "SELECT COUNT(*) FROM users WHERE role = 'lecturer' AND NOT approved",
        )
        .await?,
        courses: count(&pg, "SELECT COUNT(*) FROM courses").await?,
        enrollments: count(&pg, "SELECT COUNT(*) FROM enrollments").await?,
        attendance_records: count(&pg, "SELECT COUNT(*) FROM attendance").await?,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteUser {
    pub ssid: String,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserDeleted {
    pub user_id: Uuid,
    pub courses_removed: usize,
}

/// Cascade removal of a user. The writes are sequential and independent;
/// a failure partway leaves earlier deletions in place.
/// Admins cannot remove themselves; the system always keeps the caller.
fn ensure_not_self(caller: Uuid, target: Uuid) -> Result<(), Error> {
    if caller == target {
        return Err(Error::invalid("Cannot delete your own account"));
    }
    Ok(())
}

pub async fn delete_user(
    Extension(pg): Extension<PgPool>,
    Extension(registry): Extension<SessionRegistry>,
    Json(req): Json<DeleteUser>,
) -> Payload<UserDeleted> {
    let caller = require_admin(&req.ssid, &pg).await?;
    ensure_not_self(caller.uid, req.user_id)?;

    let target = sqlx::query_as::<_, UserProfile>("SELECT * FROM users WHERE uid = $1 LIMIT 1")
        .bind(req.user_id)
        .fetch_optional(&pg)
        .await
        .map_err(Error::from)?;
    let target = match target {
        Some(target) => target,
        None => {
            return breaks(Error::UserDoesNotExist {
                message: "No such user to delete".to_string(),
            })
        }
    };

    let mut courses_removed = 0;
    match target.role {
        Role::Student => {
            sqlx::query("DELETE FROM attendance WHERE student_id = $1")
                .bind(target.uid)
                .execute(&pg)
                .await
                .map_err(Error::from)?;
            sqlx::query("DELETE FROM enrollments WHERE student_id = $1")
                .bind(target.uid)
                .execute(&pg)
                .await
                .map_err(Error::from)?;
        }
        Role::Lecturer => {
            let owned = sqlx::query_as::<_, (Uuid,)>(
                "SELECT id FROM courses WHERE lecturer_id = $1",
            )
            .bind(target.uid)
            .fetch_all(&pg)
            .await
            .map_err(Error::from)?;

            for (course_id,) in owned {
                remove_course(&pg, &registry, course_id).await?;
                courses_removed += 1;
            }
        }
        Role::Admin => {}
    }

    sqlx::query("DELETE FROM user_sessions WHERE belongs_to = $1")
        .bind(target.uid)
        .execute(&pg)
        .await
        .map_err(Error::from)?;
    sqlx::query("DELETE FROM users WHERE uid = $1")
        .bind(target.uid)
        .execute(&pg)
        .await
        .map_err(Error::from)?;
    sqlx::query("DELETE FROM credentials WHERE uid = $1")
        .bind(target.uid)
        .execute(&pg)
        .await
        .map_err(Error::from)?;

    log::info!(
        "Deleted {} account {} ({} courses removed)",
        target.role.as_str(),
        target.uid,
        courses_removed
    );
    proceeds(UserDeleted {
        user_id: target.uid,
        courses_removed,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteCourse {
    pub ssid: String,
    pub course_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseDeleted {
    pub course_id: Uuid,
}

pub async fn delete_course(
    Extension(pg): Extension<PgPool>,
    Extension(registry): Extension<SessionRegistry>,
    Json(req): Json<DeleteCourse>,
) -> Payload<CourseDeleted> {
    require_admin(&req.ssid, &pg).await?;

    let exists = sqlx::query("SELECT 1 FROM courses WHERE id = $1 LIMIT 1")
        .bind(req.course_id)
        .fetch_optional(&pg)
        .await
        .map_err(Error::from)?;
    if exists.is_none() {
        return breaks(Error::NotFound {
            message: "No such course to delete".to_string(),
        });
    }

    remove_course(&pg, &registry, req.course_id).await?;
    log::info!("Deleted course {}", req.course_id);
    proceeds(CourseDeleted {
        course_id: req.course_id,
    })
}

/// Shared cascade: stops any live session, then clears materials,
/// enrollments, attendance and the course row itself.
async fn remove_course(
    pg: &PgPool,
    registry: &SessionRegistry,
    course_id: Uuid,
) -> Result<(), Error> {
    registry.deactivate(course_id);

    for table in ["course_materials", "enrollments", "attendance"] {
        sqlx::query(&format!("DELETE FROM {} WHERE course_id = $1", table))
            .bind(course_id)
            .execute(pg)
            .await
            .map_err(Error::from)?;
    }
    sqlx::query("DELETE FROM courses WHERE id = $1")
        .bind(course_id)
        .execute(pg)
        .await
        .map_err(Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn an_admin_cannot_delete_themselves() {
        let admin = Uuid::new_v4();
        assert!(matches!(
            ensure_not_self(admin, admin),
            Err(Error::InvalidPayload { .. })
        ));
        assert!(ensure_not_self(admin, Uuid::new_v4()).is_ok());
    }
}
