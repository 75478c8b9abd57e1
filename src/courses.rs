use axum::extract::{Path, Query};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{authenticate, SessionQuery};
use crate::err::Error;
use crate::models::{Course, CourseMaterial, Role, UserProfile};
use crate::{breaks, proceeds, Payload};

pub async fn find_course(pg: &PgPool, id: Uuid) -> Result<Option<Course>, Error> {
    sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = $1 LIMIT 1")
        .bind(id)
        .fetch_optional(pg)
        .await
        .map_err(Error::from)
}

/// Course lookup plus the ownership check every lecturer mutation needs.
pub async fn owned_course(pg: &PgPool, id: Uuid, lecturer_id: Uuid) -> Result<Course, Error> {
    let course = find_course(pg, id).await?.ok_or(Error::NotFound {
        message: format!("No course exists with id `{}`", id),
    })?;
    if course.lecturer_id != lecturer_id {
        return Err(Error::unauthorized("You do not own this course"));
    }
    Ok(course)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCourse {
    pub ssid: String,
    pub name: String,
    pub code: String,
    pub description: String,
}

pub async fn create(
    Extension(pg): Extension<PgPool>,
    Json(req): Json<CreateCourse>,
) -> Payload<Course> {
    let lecturer = authenticate(&req.ssid, &pg).await?;
    lecturer.ensure_role(Role::Lecturer)?;

    if req.name.is_empty() || req.code.is_empty() {
        return breaks(Error::invalid("Course name and code are required"));
    }

    // Codes are lecturer-chosen and deliberately not unique across the
    // registry; two lecturers may both run a "CS101".
    let course = Course {
        id: Uuid::new_v4(),
        name: req.name,
        code: req.code,
        description: req.description,
        lecturer_id: lecturer.uid,
        created_at: Utc::now(),
    };

    sqlx::query("INSERT INTO courses VALUES ($1, $2, $3, $4, $5, $6)")
        .bind(course.id)
        .bind(&course.name)
        .bind(&course.code)
        .bind(&course.description)
        .bind(course.lecturer_id)
        .bind(course.created_at)
        .execute(&pg)
        .await
        .map_err(Error::from)?;

    log::info!("Course {} ({}) created by {}", course.id, course.code, lecturer.uid);
    proceeds(course)
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseList {
    pub courses: Vec<Course>,
}

/// The full registry, creation-descending. Readable by every role.
pub async fn list_all(
    Query(q): Query<SessionQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<CourseList> {
    authenticate(&q.ssid, &pg).await?;

    let courses = sqlx::query_as::<_, Course>("SELECT * FROM courses ORDER BY created_at DESC")
        .fetch_all(&pg)
        .await
        .map_err(Error::from)?;
    proceeds(CourseList { courses })
}

pub async fn list_mine(
    Query(q): Query<SessionQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<CourseList> {
    let lecturer = authenticate(&q.ssid, &pg).await?;
    lecturer.ensure_role(Role::Lecturer)?;

    let courses = sqlx::query_as::<_, Course>(
        "SELECT * FROM courses WHERE lecturer_id = $1 ORDER BY created_at DESC",
    )
    .bind(lecturer.uid)
    .fetch_all(&pg)
    .await
    .map_err(Error::from)?;
    proceeds(CourseList { courses })
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollStudent {
    pub ssid: String,
    pub course_id: Uuid,
    pub student_email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Enrolled {
    pub course_id: Uuid,
    pub student_id: Uuid,
}

pub async fn enroll(
    Extension(pg): Extension<PgPool>,
    Json(req): Json<EnrollStudent>,
) -> Payload<Enrolled> {
    let lecturer = authenticate(&req.ssid, &pg).await?;
    lecturer.ensure_role(Role::Lecturer)?;
    owned_course(&pg, req.course_id, lecturer.uid).await?;

    let student = sqlx::query_as::<_, UserProfile>(
        "SELECT * FROM users WHERE email = $1 AND role = 'student' LIMIT 1",
    )
    .bind(&req.student_email)
    .fetch_optional(&pg)
    .await
    .map_err(Error::from)?;
    let student = match student {
        Some(student) => student,
        None => {
            return breaks(Error::UserDoesNotExist {
                message: format!("No student found with email `{}`", req.student_email),
            })
        }
    };

    let inserted = sqlx::query(
        "INSERT INTO enrollments VALUES ($1, $2, $3, $4)
         ON CONFLICT (student_id, course_id) DO NOTHING",
    )
    .bind(student.uid)
    .bind(req.course_id)
    .bind(Utc::now())
    .bind(lecturer.uid)
    .execute(&pg)
    .await
    .map_err(Error::from)?;
    if inserted.rows_affected() < 1 {
        return breaks(Error::invalid("Student is already enrolled in this course"));
    }

    proceeds(Enrolled {
        course_id: req.course_id,
        student_id: student.uid,
    })
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EnrolledStudent {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub enrolled_at: DateTime<Utc>,
    pub attendance_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrolledStudents {
    pub course_id: Uuid,
    pub students: Vec<EnrolledStudent>,
}

pub async fn enrolled_students(
    Path(course_id): Path<Uuid>,
    Query(q): Query<SessionQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<EnrolledStudents> {
    let lecturer = authenticate(&q.ssid, &pg).await?;
    lecturer.ensure_role(Role::Lecturer)?;
    owned_course(&pg, course_id, lecturer.uid).await?;

    let students = sqlx::query_as::<_, EnrolledStudent>(
        "SELECT u.uid AS id, u.name, u.email, e.enrolled_at,
                (SELECT COUNT(*) FROM attendance a
                 WHERE a.student_id = u.uid AND a.course_id = e.course_id) AS attendance_count
         FROM enrollments e
         JOIN users u ON u.uid = e.student_id
         WHERE e.course_id = $1
         ORDER BY e.enrolled_at",
    )
    .bind(course_id)
    .fetch_all(&pg)
    .await
    .map_err(Error::from)?;

    proceeds(EnrolledStudents {
        course_id,
        students,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachMaterial {
    pub ssid: String,
    pub course_id: Uuid,
    pub url: String,
    pub filename: String,
}

pub async fn attach_material(
    Extension(pg): Extension<PgPool>,
    Json(req): Json<AttachMaterial>,
) -> Payload<CourseMaterial> {
    let lecturer = authenticate(&req.ssid, &pg).await?;
    lecturer.ensure_role(Role::Lecturer)?;
    owned_course(&pg, req.course_id, lecturer.uid).await?;

    let material = CourseMaterial {
        course_id: req.course_id,
        url: req.url,
        filename: req.filename,
        uploaded_at: Utc::now(),
    };
    sqlx::query("INSERT INTO course_materials VALUES ($1, $2, $3, $4)")
        .bind(material.course_id)
        .bind(&material.url)
        .bind(&material.filename)
        .bind(material.uploaded_at)
        .execute(&pg)
        .await
        .map_err(Error::from)?;

    proceeds(material)
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterialList {
    pub course_id: Uuid,
    pub materials: Vec<CourseMaterial>,
}

pub async fn list_materials(
    Path(course_id): Path<Uuid>,
    Query(q): Query<SessionQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<MaterialList> {
    authenticate(&q.ssid, &pg).await?;

    let materials = sqlx::query_as::<_, CourseMaterial>(
        "SELECT * FROM course_materials WHERE course_id = $1 ORDER BY uploaded_at DESC",
    )
    .bind(course_id)
    .fetch_all(&pg)
    .await
    .map_err(Error::from)?;

    proceeds(MaterialList {
        course_id,
        materials,
    })
}
