use axum::extract::Query;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::CONFIG;
use crate::err::Error;
use crate::models::{Credential, Role, UserProfile, UserSession};
use crate::profile::{fallback_profile, get_profile, insert_profile};
use crate::retry::{with_retry, RetryPolicy};
use crate::{breaks, proceeds, Payload};

/// `ssid` carried in the query string of authenticated GET endpoints.
/// POST endpoints carry it in the body instead.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionQuery {
    pub ssid: String,
}

/// Resolves a session id to its profile, deleting expired sessions on
/// sight. The caller applies role checks on the returned profile.
pub async fn authenticate(ssid: &str, pg: &PgPool) -> Result<UserProfile, Error> {
    if ssid.is_empty() {
        return Err(Error::InvalidSession {
            message: "No session id was provided".to_string(),
        });
    }

    let session = sqlx::query_as::<_, UserSession>(
        "SELECT * FROM user_sessions WHERE ssid = $1 LIMIT 1",
    )
    .bind(ssid)
    .fetch_optional(pg)
    .await
    .map_err(Error::from)?;

    let session = session.ok_or(Error::InvalidSession {
        message: "Unknown session id".to_string(),
    })?;

    if Utc::now() > session.expires_at {
        sqlx::query("DELETE FROM user_sessions WHERE ssid = $1")
            .bind(ssid)
            .execute(pg)
            .await
            .map_err(Error::from)?;
        return Err(Error::SessionExpired {
            message: "Your session has expired, please sign in again".to_string(),
        });
    }

    get_profile(pg, session.belongs_to)
        .await?
        .ok_or(Error::UserDoesNotExist {
            message: "No profile exists for this session".to_string(),
        })
}

pub fn hash_password(password: &str) -> Result<String, Error> {
    Ok(Pbkdf2
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, Error> {
    let parsed = PasswordHash::new(hash)?;
    Ok(Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok())
}

/// Issues (or reuses) a session id: 32 random bytes through SHA-256,
/// hex-encoded, with the configured TTL.
async fn issue_session(uid: Uuid, pg: &PgPool) -> Result<UserSession, Error> {
    let existing = sqlx::query_as::<_, UserSession>(
        "SELECT * FROM user_sessions WHERE belongs_to = $1 LIMIT 1",
    )
    .bind(uid)
    .fetch_optional(pg)
    .await
    .map_err(Error::from)?;

    if let Some(existing) = existing {
        if Utc::now() < existing.expires_at {
            return Ok(existing);
        }
        sqlx::query("DELETE FROM user_sessions WHERE ssid = $1")
            .bind(&existing.ssid)
            .execute(pg)
            .await
            .map_err(Error::from)?;
    }

    let ssid_bytes: [u8; 32] = thread_rng().gen();
    let mut hasher: Sha256 = Digest::new();
    hasher.update(ssid_bytes);
    let ssid = hex::encode(hasher.finalize());

    let expires_at = Utc::now() + Duration::days(CONFIG.session_ttl_days);
    sqlx::query("INSERT INTO user_sessions VALUES($1, $2, $3)")
        .bind(&ssid)
        .bind(expires_at)
        .bind(uid)
        .execute(pg)
        .await
        .map_err(Error::from)?;

    Ok(UserSession {
        ssid,
        expires_at,
        belongs_to: uid,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignUp {
    pub email: String,
    pub password: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedUser {
    pub user_id: Uuid,
    pub role: Role,
    pub approved: bool,
}

pub async fn sign_up(
    Extension(pg): Extension<PgPool>,
    Json(signup): Json<SignUp>,
) -> Payload<CreatedUser> {
    if signup.email.is_empty() || !signup.email.contains('@') {
        return breaks(Error::invalid("A valid email address is required"));
    }
    if signup.name.is_empty() {
        return breaks(Error::invalid("A display name is required"));
    }
    if signup.password.len() < 6 {
        return breaks(Error::MissingCredentials {
            message: "Password must be at least 6 characters".to_string(),
        });
    }

    let taken = sqlx::query_as::<_, Credential>(
        "SELECT * FROM credentials WHERE email = $1 LIMIT 1",
    )
    .bind(&signup.email)
    .fetch_optional(&pg)
    .await
    .map_err(Error::from)?;
    if taken.is_some() {
        return breaks(Error::UserAlreadyExists {
            message: "An account with this email already exists. Please sign in instead."
                .to_string(),
        });
    }

    let uid = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query("INSERT INTO credentials VALUES ($1, $2, $3, $4)")
        .bind(uid)
        .bind(&signup.email)
        .bind(hash_password(&signup.password)?)
        .bind(now)
        .execute(&pg)
        .await
        .map_err(Error::from)?;

    let profile = UserProfile {
        uid,
        email: signup.email,
        name: signup.name,
        role: signup.role,
        approved: signup.role.auto_approved(),
        created_at: now,
        approved_at: None,
        picture_url: None,
    };

    // The credential above is already durable. If every profile attempt
    // fails we report the orphaned account explicitly instead of
    // pretending the sign-up went through.
    let written = with_retry(RetryPolicy::profile_writes(), || {
        insert_profile(&pg, &profile)
    })
    .await;
    if let Err(err) = written {
        log::error!("Profile write failed after retries for {}: {}", uid, err);
        return breaks(Error::ProfilePersistFailed {
            user_id: uid,
            message: "Your account was created but its profile could not be saved. Try signing in later.".to_string(),
        });
    }

    log::info!("New {} account {} ({})", profile.role.as_str(), uid, profile.email);
    proceeds(CreatedUser {
        user_id: uid,
        role: profile.role,
        approved: profile.approved,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignIn {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedIn {
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
    /// True when the profile was synthesized from the email heuristic
    /// rather than read from the store.
    pub degraded: bool,
}

pub async fn sign_in(
    Extension(pg): Extension<PgPool>,
    Json(login): Json<SignIn>,
) -> Payload<SignedIn> {
    if login.password.is_empty() {
        return breaks(Error::MissingCredentials {
            message: "`password` parameter was empty".to_string(),
        });
    }

    let credential = sqlx::query_as::<_, Credential>(
        "SELECT * FROM credentials WHERE email = $1 LIMIT 1",
    )
    .bind(&login.email)
    .fetch_optional(&pg)
    .await
    .map_err(Error::from)?;

    let credential = match credential {
        Some(credential) => credential,
        None => {
            return breaks(Error::UserDoesNotExist {
                message: "No account exists for this email address".to_string(),
            })
        }
    };

    if !verify_password(&login.password, &credential.password_hash)? {
        return breaks(Error::AuthenticationFailure {
            message: "Incorrect email or password".to_string(),
        });
    }

    // Orphaned credentials (the sign-up inconsistency window) get a
    // synthesized profile here, tagged as degraded.
    let (profile, degraded) = match get_profile(&pg, credential.uid).await? {
        Some(profile) => (profile, false),
        None => {
            let synthesized = fallback_profile(credential.uid, &credential.email);
            if let Err(err) = insert_profile(&pg, &synthesized).await {
                log::warn!("Could not persist fallback profile for {}: {}", credential.uid, err);
            }
            (synthesized, true)
        }
    };

    profile.ensure_approved()?;

    let session = issue_session(profile.uid, &pg).await?;
    proceeds(SignedIn {
        session_id: session.ssid,
        expires_at: session.expires_at,
        user: profile,
        degraded,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignOut {
    pub ssid: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDropped {
    pub drop_success: bool,
}

pub async fn sign_out(
    Extension(pg): Extension<PgPool>,
    Json(SignOut { ssid }): Json<SignOut>,
) -> Payload<SessionDropped> {
    let affected = sqlx::query("DELETE FROM user_sessions WHERE ssid = $1")
        .bind(&ssid)
        .execute(&pg)
        .await
        .map_err(Error::from)?;

    proceeds(SessionDropped {
        drop_success: affected.rows_affected() >= 1,
    })
}

/// Single-shot current-user lookup, the server-side analogue of
/// subscribe-then-immediately-unsubscribe.
pub async fn current_user(
    Query(q): Query<SessionQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<UserProfile> {
    let profile = authenticate(&q.ssid, &pg).await?;
    proceeds(profile)
}
