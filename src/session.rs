use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use axum::extract::{Path, Query};
use axum::{Extension, Json};
use chrono::{DateTime, Duration, TimeZone, Utc};
use qrcode::render::svg;
use qrcode::QrCode;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{authenticate, SessionQuery};
use crate::courses::owned_course;
use crate::err::Error;
use crate::models::Role;
use crate::{proceeds, Payload};

pub const MIN_DURATION_MINUTES: i64 = 5;
pub const MAX_DURATION_MINUTES: i64 = 180;

/// One Live attendance window. Exists only in the registry; expiry removes
/// it and nothing is persisted.
struct LiveSession {
    token: String,
    lecturer_id: Uuid,
    started_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    timer: Option<JoinHandle<()>>,
}

/// Per-course session state, Idle or Live. All transitions go through
/// `activate`/`deactivate`/`expire`, and every transition out of Live
/// cancels the pending timer, so a re-generate can never be cleared by a
/// stale timer from an earlier session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<Uuid, LiveSession>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveCode {
    pub session_token: String,
    pub course_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    /// Idle -> Live. Duration is re-validated here, server-side; the UI
    /// bound alone is not trusted.
    pub fn activate(
        &self,
        course_id: Uuid,
        lecturer_id: Uuid,
        duration_minutes: i64,
    ) -> Result<LiveCode, Error> {
        if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&duration_minutes) {
            return Err(Error::invalid(format!(
                "Session duration must be between {} and {} minutes",
                MIN_DURATION_MINUTES, MAX_DURATION_MINUTES
            )));
        }

        let now = Utc::now();
        let expires_at = now + Duration::minutes(duration_minutes);
        let token = encode_token(course_id, expires_at, thread_rng().gen());

        let mut sessions = self.inner.lock().expect("session registry poisoned");
        if let Some(live) = sessions.get(&course_id) {
            if now < live.expires_at {
                return Err(Error::SessionActive {
                    message: "An attendance session is already live for this course".to_string(),
                });
            }
        }

        let timer = {
            let registry = self.clone();
            let expected = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(StdDuration::from_secs(duration_minutes as u64 * 60)).await;
                registry.expire(course_id, &expected);
            })
        };

        sessions.insert(
            course_id,
            LiveSession {
                token: token.clone(),
                lecturer_id,
                started_at: now,
                expires_at,
                timer: Some(timer),
            },
        );
        log::info!(
            "Attendance session live for course {} until {}",
            course_id,
            expires_at
        );

        Ok(LiveCode {
            session_token: token,
            course_id,
            started_at: now,
            expires_at,
        })
    }

    /// Live -> Idle on explicit stop. Aborts the pending timer.
    pub fn deactivate(&self, course_id: Uuid) -> bool {
        let mut sessions = self.inner.lock().expect("session registry poisoned");
        match sessions.remove(&course_id) {
            Some(live) => {
                if let Some(timer) = live.timer {
                    timer.abort();
                }
                log::info!("Attendance session stopped for course {}", course_id);
                true
            }
            None => false,
        }
    }

    /// Live -> Idle from the timer. Only clears the session it was armed
    /// for; a session re-generated in the meantime is left alone.
    fn expire(&self, course_id: Uuid, expected_token: &str) {
        let mut sessions = self.inner.lock().expect("session registry poisoned");
        if let Some(live) = sessions.get(&course_id) {
            if live.token == expected_token {
                sessions.remove(&course_id);
                log::info!("Attendance session expired for course {}", course_id);
            }
        }
    }

    /// Authoritative scan-time check: the registry, not the generating
    /// client's timer, decides whether a token is still good.
    pub fn verify(&self, token: &str) -> Result<Uuid, Error> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Uuid, Error> {
        let (course_id, embedded_expiry) = decode_token(token)?;

        if let Some(expiry) = embedded_expiry {
            if now > expiry {
                return Err(Error::SessionExpired {
                    message: "This attendance session has expired".to_string(),
                });
            }
        }

        let sessions = self.inner.lock().expect("session registry poisoned");
        let live = sessions.get(&course_id).ok_or(Error::SessionExpired {
            message: "This attendance session is no longer active".to_string(),
        })?;
        if live.token != token {
            return Err(Error::InvalidQr {
                message: "This code belongs to an earlier session".to_string(),
            });
        }
        if now > live.expires_at {
            return Err(Error::SessionExpired {
                message: "This attendance session has expired".to_string(),
            });
        }
        Ok(course_id)
    }

    pub fn is_live(&self, course_id: Uuid) -> bool {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .contains_key(&course_id)
    }

    pub fn status(&self, course_id: Uuid) -> Option<(Uuid, DateTime<Utc>)> {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .get(&course_id)
            .map(|live| (live.lecturer_id, live.expires_at))
    }
}

/// QR payload: `<course-id>-<expiry-millis>.<nonce>`. The course id is the
/// hyphen-free simple UUID form, so splitting on the first `-` always
/// recovers it regardless of what the suffix contains.
pub fn encode_token(course_id: Uuid, expires_at: DateTime<Utc>, nonce: u32) -> String {
    format!(
        "{}-{}.{:08x}",
        course_id.simple(),
        expires_at.timestamp_millis(),
        nonce
    )
}

pub fn decode_token(token: &str) -> Result<(Uuid, Option<DateTime<Utc>>), Error> {
    let (head, suffix) = token.split_once('-').ok_or_else(|| Error::InvalidQr {
        message: "Unrecognized QR payload".to_string(),
    })?;
    let course_id = Uuid::parse_str(head).map_err(|_| Error::InvalidQr {
        message: "QR payload does not reference a course".to_string(),
    })?;

    let expiry = suffix
        .split('.')
        .next()
        .and_then(|millis| millis.parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single());

    Ok((course_id, expiry))
}

/// Local encode of the payload into a scannable SVG.
pub fn render_svg(token: &str) -> Result<String, Error> {
    let code = QrCode::new(token.as_bytes())?;
    Ok(code
        .render()
        .min_dimensions(240, 240)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateSession {
    pub ssid: String,
    pub course_id: Uuid,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedCode {
    #[serde(flatten)]
    pub code: LiveCode,
    pub qr_svg: String,
}

pub async fn generate(
    Extension(pg): Extension<PgPool>,
    Extension(registry): Extension<SessionRegistry>,
    Json(req): Json<GenerateSession>,
) -> Payload<GeneratedCode> {
    let lecturer = authenticate(&req.ssid, &pg).await?;
    lecturer.ensure_role(Role::Lecturer)?;
    owned_course(&pg, req.course_id, lecturer.uid).await?;

    let code = registry.activate(req.course_id, lecturer.uid, req.duration_minutes)?;
    let qr_svg = render_svg(&code.session_token)?;
    proceeds(GeneratedCode { code, qr_svg })
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopSession {
    pub ssid: String,
    pub course_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStopped {
    pub course_id: Uuid,
    pub stopped: bool,
}

pub async fn stop(
    Extension(pg): Extension<PgPool>,
    Extension(registry): Extension<SessionRegistry>,
    Json(req): Json<StopSession>,
) -> Payload<SessionStopped> {
    let lecturer = authenticate(&req.ssid, &pg).await?;
    lecturer.ensure_role(Role::Lecturer)?;
    owned_course(&pg, req.course_id, lecturer.uid).await?;

    let stopped = registry.deactivate(req.course_id);
    proceeds(SessionStopped {
        course_id: req.course_id,
        stopped,
    })
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RosterEntry {
    pub student_id: Uuid,
    pub student_name: String,
    pub marked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveRoster {
    pub course_id: Uuid,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub checked_in: usize,
    pub roster: Vec<RosterEntry>,
}

/// The lecturer's live view. Poll-based: each call re-fetches today's
/// records for the course, so new check-ins appear within the caller's
/// polling interval.
pub async fn live_roster(
    Path(course_id): Path<Uuid>,
    Query(q): Query<SessionQuery>,
    Extension(pg): Extension<PgPool>,
    Extension(registry): Extension<SessionRegistry>,
) -> Payload<LiveRoster> {
    let lecturer = authenticate(&q.ssid, &pg).await?;
    lecturer.ensure_role(Role::Lecturer)?;
    owned_course(&pg, course_id, lecturer.uid).await?;

    let roster = sqlx::query_as::<_, RosterEntry>(
        "SELECT student_id, student_name, marked_at FROM attendance
         WHERE course_id = $1 AND marked_on = $2
         ORDER BY marked_at DESC",
    )
    .bind(course_id)
    .bind(Utc::now().date_naive())
    .fetch_all(&pg)
    .await
    .map_err(Error::from)?;

    let status = registry.status(course_id);
    proceeds(LiveRoster {
        course_id,
        active: status.is_some(),
        expires_at: status.map(|(_, expires_at)| expires_at),
        checked_in: roster.len(),
        roster,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_course_id() {
        let course = Uuid::new_v4();
        let expires = Utc::now() + Duration::minutes(15);
        let token = encode_token(course, expires, 0xdeadbeef);

        let (decoded, expiry) = decode_token(&token).unwrap();
        assert_eq!(decoded, course);
        assert_eq!(expiry.unwrap().timestamp_millis(), expires.timestamp_millis());
    }

    #[test]
    fn arbitrary_suffix_still_yields_course_id() {
        let course = Uuid::new_v4();
        let token = format!("{}-whatever.comes-after::here", course.simple());
        let (decoded, expiry) = decode_token(&token).unwrap();
        assert_eq!(decoded, course);
        assert!(expiry.is_none());
    }

    #[test]
    fn garbage_payload_is_invalid_qr() {
        assert!(matches!(
            decode_token("not a token"),
            Err(Error::InvalidQr { .. })
        ));
        assert!(matches!(
            decode_token("nodelimiter"),
            Err(Error::InvalidQr { .. })
        ));
    }

    #[tokio::test]
    async fn duration_is_validated_server_side() {
        let registry = SessionRegistry::new();
        let course = Uuid::new_v4();
        let lecturer = Uuid::new_v4();

        assert!(matches!(
            registry.activate(course, lecturer, 4),
            Err(Error::InvalidPayload { .. })
        ));
        assert!(matches!(
            registry.activate(course, lecturer, 181),
            Err(Error::InvalidPayload { .. })
        ));
        assert!(registry.activate(course, lecturer, 5).is_ok());
    }

    #[tokio::test]
    async fn generating_while_live_is_rejected() {
        let registry = SessionRegistry::new();
        let course = Uuid::new_v4();
        let lecturer = Uuid::new_v4();

        registry.activate(course, lecturer, 15).unwrap();
        assert!(matches!(
            registry.activate(course, lecturer, 15),
            Err(Error::SessionActive { .. })
        ));
    }

    #[tokio::test]
    async fn stop_transitions_back_to_idle() {
        let registry = SessionRegistry::new();
        let course = Uuid::new_v4();
        let lecturer = Uuid::new_v4();

        registry.activate(course, lecturer, 15).unwrap();
        assert!(registry.is_live(course));
        assert!(registry.deactivate(course));
        assert!(!registry.is_live(course));
        // stopping twice is a no-op
        assert!(!registry.deactivate(course));
        // and a fresh session can be generated again
        assert!(registry.activate(course, lecturer, 15).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_live_to_idle() {
        let registry = SessionRegistry::new();
        let course = Uuid::new_v4();
        let lecturer = Uuid::new_v4();

        registry.activate(course, lecturer, 15).unwrap();
        assert!(registry.is_live(course));

        tokio::time::sleep(StdDuration::from_secs(15 * 60 + 1)).await;
        tokio::task::yield_now().await;
        assert!(!registry.is_live(course));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_session_timer_does_not_clear_a_new_one() {
        let registry = SessionRegistry::new();
        let course = Uuid::new_v4();
        let lecturer = Uuid::new_v4();

        registry.activate(course, lecturer, 5).unwrap();
        registry.deactivate(course);
        let second = registry.activate(course, lecturer, 180).unwrap();

        // past the first session's would-be expiry
        tokio::time::sleep(StdDuration::from_secs(6 * 60)).await;
        tokio::task::yield_now().await;
        assert!(registry.is_live(course));
        assert_eq!(registry.verify(&second.session_token).unwrap(), course);
    }

    #[tokio::test]
    async fn verify_accepts_live_and_rejects_stale() {
        let registry = SessionRegistry::new();
        let course = Uuid::new_v4();
        let lecturer = Uuid::new_v4();

        let code = registry.activate(course, lecturer, 15).unwrap();
        assert_eq!(registry.verify(&code.session_token).unwrap(), course);

        // a token from before a stop is useless afterwards
        registry.deactivate(course);
        assert!(matches!(
            registry.verify(&code.session_token),
            Err(Error::SessionExpired { .. })
        ));

        // a token from an earlier generation does not match the new session
        let newer = registry.activate(course, lecturer, 15).unwrap();
        assert!(matches!(
            registry.verify(&code.session_token),
            Err(Error::InvalidQr { .. })
        ));
        assert_eq!(registry.verify(&newer.session_token).unwrap(), course);
    }

    #[tokio::test]
    async fn verify_honours_embedded_expiry() {
        let registry = SessionRegistry::new();
        let course = Uuid::new_v4();
        let lecturer = Uuid::new_v4();

        let code = registry.activate(course, lecturer, 15).unwrap();
        let past_expiry = code.expires_at + Duration::seconds(1);
        assert!(matches!(
            registry.verify_at(&code.session_token, past_expiry),
            Err(Error::SessionExpired { .. })
        ));
    }

    #[test]
    fn svg_render_contains_an_image() {
        let course = Uuid::new_v4();
        let token = encode_token(course, Utc::now(), 7);
        let svg = render_svg(&token).unwrap();
        assert!(svg.contains("<svg"));
    }
}
