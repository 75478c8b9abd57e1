use axum::extract::Query;
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{authenticate, SessionQuery};
use crate::courses::find_course;
use crate::err::Error;
use crate::models::{AttendanceRecord, AttendanceStatus, Role};
use crate::session::SessionRegistry;
use crate::stats::{compute_stats, AttendanceStats};
use crate::{breaks, proceeds, Payload};

const DEFAULT_HISTORY_LIMIT: i64 = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct MarkAttendance {
    pub ssid: String,
    pub token: String,
}

/// The scan flow. The registry is the authority on token validity and
/// expiry; the once-per-day rule is a conditional insert against the
/// unique attendance index, so two near-simultaneous scans cannot both
/// land.
pub async fn mark(
    Extension(pg): Extension<PgPool>,
    Extension(registry): Extension<SessionRegistry>,
    Json(req): Json<MarkAttendance>,
) -> Payload<AttendanceRecord> {
    let student = authenticate(&req.ssid, &pg).await?;
    student.ensure_role(Role::Student)?;

    let course_id = registry.verify(&req.token)?;
    let course = match find_course(&pg, course_id).await? {
        Some(course) => course,
        None => {
            return breaks(Error::InvalidQr {
                message: "This code does not reference a known course".to_string(),
            })
        }
    };

    let enrolled = sqlx::query(
        "SELECT 1 FROM enrollments WHERE student_id = $1 AND course_id = $2 LIMIT 1",
    )
    .bind(student.uid)
    .bind(course.id)
    .fetch_optional(&pg)
    .await
    .map_err(Error::from)?;
    if enrolled.is_none() {
        return breaks(Error::NotEnrolled {
            message: format!("You are not enrolled in {}", course.code),
        });
    }

    let now = Utc::now();
    let record = AttendanceRecord {
        id: Uuid::new_v4(),
        student_id: student.uid,
        student_name: student.name.clone(),
        student_email: student.email.clone(),
        course_id: course.id,
        course_name: course.name.clone(),
        course_code: course.code.clone(),
        marked_on: now.date_naive(),
        status: AttendanceStatus::Present,
        marked_at: now,
        session_token: req.token,
    };

    let inserted = sqlx::query(
        "INSERT INTO attendance VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         ON CONFLICT (student_id, course_id, marked_on) DO NOTHING",
    )
    .bind(record.id)
    .bind(record.student_id)
    .bind(&record.student_name)
    .bind(&record.student_email)
    .bind(record.course_id)
    .bind(&record.course_name)
    .bind(&record.course_code)
    .bind(record.marked_on)
    .bind(record.status)
    .bind(record.marked_at)
    .bind(&record.session_token)
    .execute(&pg)
    .await
    .map_err(Error::from)?;

    mark_outcome(inserted.rows_affected(), &course.code)?;

    log::info!(
        "Attendance marked: student {} course {} ({})",
        student.uid,
        course.id,
        course.code
    );
    proceeds(record)
}

/// Interprets the conditional insert: zero rows affected means the unique
/// (student, course, day) index already held a record, so the scan is a
/// same-day duplicate.
fn mark_outcome(rows_affected: u64, course_code: &str) -> Result<(), Error> {
    if rows_affected < 1 {
        return Err(Error::AlreadyMarked {
            message: format!("Attendance already marked today for {}", course_code),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    pub ssid: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceHistory {
    pub records: Vec<AttendanceRecord>,
}

/// The student's own history, newest first.
pub async fn history(
    Query(q): Query<HistoryQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<AttendanceHistory> {
    let student = authenticate(&q.ssid, &pg).await?;
    student.ensure_role(Role::Student)?;

    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 500);
    let records = sqlx::query_as::<_, AttendanceRecord>(
        "SELECT * FROM attendance WHERE student_id = $1 ORDER BY marked_at DESC LIMIT $2",
    )
    .bind(student.uid)
    .bind(limit)
    .fetch_all(&pg)
    .await
    .map_err(Error::from)?;

    proceeds(AttendanceHistory { records })
}

/// Per-course and aggregate percentages, recomputed from the full record
/// set on every call.
pub async fn stats(
    Query(q): Query<SessionQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<AttendanceStats> {
    let student = authenticate(&q.ssid, &pg).await?;
    student.ensure_role(Role::Student)?;

    let records = sqlx::query_as::<_, AttendanceRecord>(
        "SELECT * FROM attendance WHERE student_id = $1 ORDER BY marked_at DESC",
    )
    .bind(student.uid)
    .fetch_all(&pg)
    .await
    .map_err(Error::from)?;

    proceeds(compute_stats(&records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_scan_of_the_day_lands() {
        assert!(mark_outcome(1, "CS101").is_ok());
    }

    #[test]
    fn second_same_day_scan_is_rejected() {
        let err = mark_outcome(0, "CS101").unwrap_err();
        match err {
            Error::AlreadyMarked { message } => assert!(message.contains("CS101")),
            other => panic!("expected AlreadyMarked, got {:?}", other),
        }
    }
}
