use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::CONFIG;

pub async fn connect() -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&CONFIG.database_url)
        .await?;
    prepare_schema(&pool).await?;
    Ok(pool)
}

/// Idempotent schema bootstrap. The unique attendance index is the
/// authoritative once-per-day guarantee; handlers insert conditionally
/// against it instead of scanning already-loaded records.
pub async fn prepare_schema(pg: &PgPool) -> anyhow::Result<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(pg).await?;
    }
    log::info!("Database schema ready");
    Ok(())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS credentials(
        uid UUID PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS users(
        uid UUID PRIMARY KEY,
        email TEXT NOT NULL,
        name TEXT NOT NULL,
        role TEXT NOT NULL,
        approved BOOLEAN NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        approved_at TIMESTAMPTZ,
        picture_url TEXT
    )",
    "CREATE TABLE IF NOT EXISTS user_sessions(
        ssid TEXT PRIMARY KEY,
        expires_at TIMESTAMPTZ NOT NULL,
        belongs_to UUID NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_user_sessions_owner ON user_sessions(belongs_to)",
    "CREATE TABLE IF NOT EXISTS courses(
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        code TEXT NOT NULL,
        description TEXT NOT NULL,
        lecturer_id UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_courses_lecturer ON courses(lecturer_id)",
    "CREATE TABLE IF NOT EXISTS course_materials(
        course_id UUID NOT NULL,
        url TEXT NOT NULL,
        filename TEXT NOT NULL,
        uploaded_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_materials_course ON course_materials(course_id)",
    "CREATE TABLE IF NOT EXISTS enrollments(
        student_id UUID NOT NULL,
        course_id UUID NOT NULL,
        enrolled_at TIMESTAMPTZ NOT NULL,
        enrolled_by UUID NOT NULL,
        PRIMARY KEY(student_id, course_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id)",
    "CREATE TABLE IF NOT EXISTS attendance(
        id UUID PRIMARY KEY,
        student_id UUID NOT NULL,
        student_name TEXT NOT NULL,
        student_email TEXT NOT NULL,
        course_id UUID NOT NULL,
        course_name TEXT NOT NULL,
        course_code TEXT NOT NULL,
        marked_on DATE NOT NULL,
        status TEXT NOT NULL,
        marked_at TIMESTAMPTZ NOT NULL,
        session_token TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_once_per_day
        ON attendance(student_id, course_id, marked_on)",
    "CREATE INDEX IF NOT EXISTS idx_attendance_course_day ON attendance(course_id, marked_on)",
    "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
];
